use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants;

/// Runtime options for one proxy instance. Everything the host can tune
/// flows through here; there are no environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Disk budget enforced by the prune pass.
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,

    /// Persist only the first few segments per origin; the rest stream
    /// through without touching disk.
    #[serde(default)]
    pub head_only: bool,

    /// Cache directory. Defaults to the platform cache dir + `bodega/`.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_cache_bytes: default_max_cache_bytes(),
            head_only: false,
            cache_root: None,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port must be non-zero"));
        }
        if self.max_cache_bytes == 0 {
            return Err(anyhow!("max_cache_bytes must be non-zero"));
        }
        Ok(())
    }

    pub fn resolved_cache_root(&self) -> PathBuf {
        if let Some(root) = &self.cache_root {
            return root.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(constants::DEFAULT_CACHE_DIR)
    }
}

fn default_port() -> u16 {
    constants::DEFAULT_PORT
}

fn default_max_cache_bytes() -> u64 {
    constants::DEFAULT_MAX_CACHE_BYTES
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: Options,
    #[serde(default)]
    pub logger: Logger,
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}
