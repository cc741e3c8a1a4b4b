use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use url::Url;

use crate::http_range::ByteRange;

/// Key for one cache entry, derived from the remote URL and the requested
/// byte range. Ranged slices of one URL hash to distinct entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    material: String,
    ext: String,
}

impl CacheKey {
    pub fn new(url: &str, range: Option<&ByteRange>) -> Self {
        let mut material = url.to_string();
        if let Some(range) = range {
            material.push_str(&range.key_suffix());
        }
        Self {
            material,
            ext: extension_of(url),
        }
    }

    /// `<hex-sha256>.<ext>` — deterministic across runs so a warm cache
    /// survives restarts.
    pub fn filename(&self) -> String {
        let digest = Sha256::digest(self.material.as_bytes());
        format!("{:x}.{}", digest, self.ext)
    }
}

fn extension_of(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    match Path::new(&path).extension().and_then(|e| e.to_str()) {
        Some(ext)
            if !ext.is_empty()
                && ext.len() <= 8
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}

/// Content-addressed file store. One regular file per entry; the filesystem
/// is the index and mtime is the eviction key. Mutating operations are
/// best-effort: a failed write surfaces as the entry being absent on the
/// next lookup, never as an error thrown into request serving.
pub struct CacheStore {
    root: PathBuf,
    max_bytes: u64,
}

impl CacheStore {
    pub fn new(root: PathBuf, max_bytes: u64) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, max_bytes })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Pure path derivation, no I/O.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.filename())
    }

    /// An entry exists only as a non-empty regular file.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.size_of(key).is_some()
    }

    pub fn size_of(&self, key: &CacheKey) -> Option<u64> {
        let meta = fs::metadata(self.path_for(key)).ok()?;
        (meta.is_file() && meta.len() > 0).then(|| meta.len())
    }

    /// Whole-file read, used for playlists. An empty file is treated as
    /// absent and removed on sight.
    pub fn read_all(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        let data = fs::read(&path).ok()?;
        if data.is_empty() {
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(data)
    }

    /// Atomic whole-buffer write: temp file + rename, so readers never see
    /// a partial entry under the final name.
    pub fn save_atomic(&self, key: &CacheKey, data: &[u8]) {
        let path = self.path_for(key);
        let tmp = tmp_path_for(&path);
        let result = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, &path));
        if let Err(err) = result {
            log::warn!("cache write failed for {}: {err}", path.display());
            let _ = fs::remove_file(&tmp);
        }
    }

    /// Truncate/create and return an append-only handle. The caller feeds
    /// chunks as they arrive and must `finish` or `abort`; a handle dropped
    /// mid-write removes its partial file.
    pub fn open_stream(&self, key: &CacheKey) -> std::io::Result<StreamWriter> {
        let path = self.path_for(key);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(StreamWriter {
            file: Some(file),
            path,
        })
    }

    pub fn delete(&self, key: &CacheKey) {
        let _ = fs::remove_file(self.path_for(key));
    }

    /// Removes the whole cache directory and recreates it empty.
    pub fn clear_all(&self) {
        if let Err(err) = fs::remove_dir_all(&self.root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("cache clear failed: {err}");
            }
        }
        if let Err(err) = fs::create_dir_all(&self.root) {
            log::warn!("cache dir recreate failed: {err}");
        }
    }

    /// Enforces the byte budget, oldest mtime first. Per-file errors are
    /// swallowed and traversal continues; pruning must never fail playback.
    pub fn prune(&self) {
        let mut entries = Vec::new();
        let mut total: u64 = 0;
        let Ok(dir) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in dir.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += meta.len();
            entries.push((entry.path(), meta.len(), mtime));
        }
        if total <= self.max_bytes {
            return;
        }

        entries.sort_by_key(|(_, _, mtime)| *mtime);
        let before = total;
        let mut removed = 0usize;
        for (path, size, _) in entries {
            if total <= self.max_bytes {
                break;
            }
            if fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(size);
                removed += 1;
            }
        }
        log::info!(
            "cache pruned: {removed} entries, {before} -> {total} bytes (budget {})",
            self.max_bytes
        );
    }

    /// Sum of entry sizes on disk.
    pub fn total_bytes(&self) -> u64 {
        let Ok(dir) = fs::read_dir(&self.root) else {
            return 0;
        };
        dir.flatten()
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }
}

/// Append-only handle for a streaming download. The file lives at its final
/// path while in flight; error paths remove it so a partial entry is never
/// served as complete.
pub struct StreamWriter {
    file: Option<File>,
    path: PathBuf,
}

impl StreamWriter {
    pub fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk),
            None => Ok(()),
        }
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    pub fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "entry".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
