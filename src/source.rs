use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::constants;
use crate::http_range::{build_content_range, ByteRange};
use crate::rewrite::{is_playlist_url, rewrite_playlist};
use crate::scheduler::{DownloadDelegate, Downloader};
use crate::store::{CacheKey, CacheStore, StreamWriter};

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Response head handed to the connection: status plus the headers this
/// request contributes (the connection adds the mandatory ones).
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Ordered event stream for one request: exactly one head, any number of
/// chunks, one terminal result.
#[derive(Debug)]
pub enum ServeEvent {
    Head(ResponseHead),
    Chunk(Bytes),
    Done(Result<()>),
}

pub type EventSender = mpsc::UnboundedSender<ServeEvent>;

/// Admission counter for head-only mode: only the first few segments per
/// origin host get persisted, the rest stream through untouched. Scope is
/// process memory; a restart starts counting afresh.
pub struct HeadGate {
    limit: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl HeadGate {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, origin: &str) -> bool {
        let mut counts = self.counts.lock().expect("head gate");
        let count = counts.entry(origin.to_string()).or_insert(0);
        if *count < self.limit {
            *count += 1;
            true
        } else {
            false
        }
    }
}

/// Resolves one request: playlist (fetch fully, rewrite, cache), disk hit
/// (stream the file, honouring ranges), or miss (stream from origin while
/// teeing to the store).
pub struct DataSource {
    url: Url,
    range: Option<ByteRange>,
    store: Arc<CacheStore>,
    port: u16,
    head_gate: Option<Arc<HeadGate>>,
}

impl DataSource {
    pub fn new(
        url: Url,
        range: Option<ByteRange>,
        store: Arc<CacheStore>,
        port: u16,
        head_gate: Option<Arc<HeadGate>>,
    ) -> Self {
        Self {
            url,
            range,
            store,
            port,
            head_gate,
        }
    }

    pub async fn run(self, tx: EventSender, cancel: CancellationToken) {
        if is_playlist_url(self.url.as_str()) {
            self.serve_playlist(&tx).await;
            return;
        }

        // A cached full entity satisfies any range by slicing; a ranged blob
        // only ever matches the exact range it was fetched with.
        let full_key = CacheKey::new(self.url.as_str(), None);
        if self.store.exists(&full_key) {
            self.serve_from_disk(&tx, &full_key);
            return;
        }
        match &self.range {
            None => self.serve_from_origin(tx, cancel, full_key).await,
            Some(range) => {
                let ranged_key = CacheKey::new(self.url.as_str(), Some(range));
                if self.store.exists(&ranged_key) {
                    self.serve_ranged_blob(&tx, &ranged_key, range);
                } else {
                    self.serve_from_origin(tx, cancel, ranged_key).await;
                }
            }
        }
    }

    /// Playlists are always fetched whole, cached raw and rewritten at serve
    /// time so the embedded port matches the live listener.
    async fn serve_playlist(&self, tx: &EventSender) {
        let key = CacheKey::new(self.url.as_str(), None);
        let raw = match self.store.read_all(&key) {
            Some(data) => data,
            None => match self.fetch_playlist().await {
                Ok(data) => {
                    self.store.save_atomic(&key, &data);
                    data
                }
                Err(err) => {
                    log::warn!("playlist fetch failed for {}: {err:#}", self.url);
                    send_not_found(tx);
                    return;
                }
            },
        };

        let text = String::from_utf8_lossy(&raw);
        let body = Bytes::from(rewrite_playlist(&text, &self.url, self.port));
        let head = ResponseHead {
            status: 200,
            headers: vec![
                ("Content-Type".into(), PLAYLIST_CONTENT_TYPE.into()),
                ("Content-Length".into(), body.len().to_string()),
            ],
        };
        let _ = tx.send(ServeEvent::Head(head));
        let _ = tx.send(ServeEvent::Chunk(body));
        let _ = tx.send(ServeEvent::Done(Ok(())));
    }

    async fn fetch_playlist(&self) -> Result<Vec<u8>> {
        let (done_tx, done_rx) = oneshot::channel();
        let delegate = Arc::new(CollectDelegate::new(done_tx));
        let handle = Downloader::shared().download(self.url.clone(), None, delegate);

        let collected = match tokio::time::timeout(constants::PLAYLIST_FETCH_TIMEOUT, done_rx).await
        {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(anyhow!("download dropped without completing")),
            Err(_) => {
                handle.cancel();
                return Err(anyhow!("timed out"));
            }
        };
        if !(200..300).contains(&collected.status) {
            return Err(anyhow!("origin returned status {}", collected.status));
        }
        Ok(collected.body)
    }

    fn serve_from_disk(&self, tx: &EventSender, key: &CacheKey) {
        let path = self.store.path_for(key);
        let (mut file, size) = match File::open(&path).and_then(|f| {
            let len = f.metadata()?.len();
            Ok((f, len))
        }) {
            Ok(opened) => opened,
            Err(err) => {
                log::warn!("cache entry vanished for {}: {err}", self.url);
                send_not_found(tx);
                return;
            }
        };

        // A range that fails to parse or resolve is ignored rather than
        // rejected; the player gets the full entity.
        let span = self.range.as_ref().and_then(|r| r.resolve(size).ok());
        let (status, body_len) = match span {
            Some(span) => (206, span.byte_len()),
            None => (200, size),
        };

        let mut headers = vec![
            ("Content-Type".into(), content_type_for(&self.url).into()),
            ("Content-Length".into(), body_len.to_string()),
            ("Accept-Ranges".into(), "bytes".into()),
        ];
        if let Some(span) = span {
            headers.push((
                "Content-Range".into(),
                build_content_range(span.start, span.end, size),
            ));
            if let Err(err) = file.seek(SeekFrom::Start(span.start)) {
                log::warn!("cache seek failed for {}: {err}", self.url);
                send_not_found(tx);
                return;
            }
        }
        let _ = tx.send(ServeEvent::Head(ResponseHead { status, headers }));

        let mut remaining = body_len;
        let mut buf = vec![0u8; constants::READ_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            match file.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    remaining -= n as u64;
                    if tx.send(ServeEvent::Chunk(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(ServeEvent::Done(Err(err.into())));
                    return;
                }
            }
        }
        let _ = tx.send(ServeEvent::Done(Ok(())));
    }

    /// A blob fetched with this exact range earlier: the file content is the
    /// slice itself. The entity total is unknown here, so the content range
    /// advertises `/*` per RFC 9110; a suffix-range blob has an unknown
    /// offset too and anchors at zero.
    fn serve_ranged_blob(&self, tx: &EventSender, key: &CacheKey, range: &ByteRange) {
        let path = self.store.path_for(key);
        let (mut file, size) = match File::open(&path).and_then(|f| {
            let len = f.metadata()?.len();
            Ok((f, len))
        }) {
            Ok(opened) => opened,
            Err(err) => {
                log::warn!("cache entry vanished for {}: {err}", self.url);
                send_not_found(tx);
                return;
            }
        };

        let start = range.start.unwrap_or(0);
        let headers = vec![
            ("Content-Type".into(), content_type_for(&self.url).into()),
            ("Content-Length".into(), size.to_string()),
            ("Accept-Ranges".into(), "bytes".into()),
            (
                "Content-Range".into(),
                format!("bytes {}-{}/*", start, start + size - 1),
            ),
        ];
        let _ = tx.send(ServeEvent::Head(ResponseHead {
            status: 206,
            headers,
        }));

        let mut buf = vec![0u8; constants::READ_CHUNK_SIZE];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(ServeEvent::Chunk(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(ServeEvent::Done(Err(err.into())));
                    return;
                }
            }
        }
        let _ = tx.send(ServeEvent::Done(Ok(())));
    }

    /// Miss path: bytes are teed to the client and to a streaming write
    /// handle in parallel, so one playthrough warms the cache.
    async fn serve_from_origin(self, tx: EventSender, cancel: CancellationToken, key: CacheKey) {
        let (done_tx, done_rx) = oneshot::channel();
        let delegate = Arc::new(ForwardDelegate {
            tx,
            store: Arc::clone(&self.store),
            key,
            content_type: content_type_for(&self.url),
            head_gate: self.head_gate.clone(),
            origin: self.url.host_str().unwrap_or_default().to_string(),
            writer: Mutex::new(None),
            done: Mutex::new(Some(done_tx)),
        });
        let handle = Downloader::shared().download(self.url.clone(), self.range, delegate);

        tokio::select! {
            _ = cancel.cancelled() => handle.cancel(),
            _ = done_rx => {}
        }
    }
}

/// Accumulates a whole small response; used for playlists only.
#[derive(Default)]
struct Collected {
    status: u16,
    body: Vec<u8>,
}

struct CollectDelegate {
    state: Mutex<Collected>,
    done: Mutex<Option<oneshot::Sender<Result<Collected>>>>,
}

impl CollectDelegate {
    fn new(done: oneshot::Sender<Result<Collected>>) -> Self {
        Self {
            state: Mutex::new(Collected::default()),
            done: Mutex::new(Some(done)),
        }
    }
}

impl DownloadDelegate for CollectDelegate {
    fn on_response(&self, status: u16, _headers: &HeaderMap) {
        self.state.lock().expect("collect state").status = status;
    }

    fn on_data(&self, chunk: Bytes) {
        self.state
            .lock()
            .expect("collect state")
            .body
            .extend_from_slice(&chunk);
    }

    fn on_complete(&self, error: Option<anyhow::Error>) {
        let Some(done) = self.done.lock().expect("collect done").take() else {
            return;
        };
        let result = match error {
            Some(err) => Err(err),
            None => Ok(std::mem::take(&mut *self.state.lock().expect("collect state"))),
        };
        let _ = done.send(result);
    }
}

/// Tees origin bytes to the client and to the cache. The write handle only
/// opens on a 2xx response; any failure aborts the handle so the partial
/// entry disappears instead of being served as complete.
struct ForwardDelegate {
    tx: EventSender,
    store: Arc<CacheStore>,
    key: CacheKey,
    content_type: &'static str,
    head_gate: Option<Arc<HeadGate>>,
    origin: String,
    writer: Mutex<Option<StreamWriter>>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl DownloadDelegate for ForwardDelegate {
    fn on_response(&self, status: u16, headers: &HeaderMap) {
        if (200..300).contains(&status) {
            let persist = self
                .head_gate
                .as_ref()
                .map_or(true, |gate| gate.admit(&self.origin));
            if persist {
                match self.store.open_stream(&self.key) {
                    Ok(writer) => *self.writer.lock().expect("tee writer") = Some(writer),
                    Err(err) => log::warn!("cache stream open failed: {err}"),
                }
            }
        }

        let mut out = vec![
            ("Content-Type".to_string(), self.content_type.to_string()),
            ("Accept-Ranges".to_string(), "bytes".to_string()),
        ];
        for name in ["Content-Length", "Content-Range"] {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                out.push((name.to_string(), value.to_string()));
            }
        }
        let _ = self.tx.send(ServeEvent::Head(ResponseHead {
            status,
            headers: out,
        }));
    }

    fn on_data(&self, chunk: Bytes) {
        let mut writer = self.writer.lock().expect("tee writer");
        if let Some(handle) = writer.as_mut() {
            if let Err(err) = handle.append(&chunk) {
                log::warn!("cache append failed: {err}");
                if let Some(handle) = writer.take() {
                    handle.abort();
                }
            }
        }
        drop(writer);
        let _ = self.tx.send(ServeEvent::Chunk(chunk));
    }

    fn on_complete(&self, error: Option<anyhow::Error>) {
        let writer = self.writer.lock().expect("tee writer").take();
        match (&error, writer) {
            (None, Some(handle)) => {
                if let Err(err) = handle.finish() {
                    log::warn!("cache finish failed: {err}");
                    self.store.delete(&self.key);
                }
            }
            (Some(_), Some(handle)) => handle.abort(),
            _ => {}
        }
        let _ = self.tx.send(ServeEvent::Done(error.map_or(Ok(()), Err)));
        if let Some(done) = self.done.lock().expect("tee done").take() {
            let _ = done.send(());
        }
    }
}

fn send_not_found(tx: &EventSender) {
    let _ = tx.send(ServeEvent::Head(ResponseHead {
        status: 404,
        headers: vec![("Content-Length".into(), "0".into())],
    }));
    let _ = tx.send(ServeEvent::Done(Ok(())));
}

/// Content type by URL path extension; unknown extensions fall back to an
/// opaque octet stream.
pub fn content_type_for(url: &Url) -> &'static str {
    let ext = std::path::Path::new(url.path())
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "m3u8" => PLAYLIST_CONTENT_TYPE,
        "ts" => "video/mp2t",
        "mp4" => "video/mp4",
        "m4s" => "video/iso.segment",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}
