use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 1024 * 1024 * 1024; // 1GiB
pub const DEFAULT_CACHE_DIR: &str = "bodega";

pub const PROXY_PATH: &str = "/proxy";
pub const URL_PARAM: &str = "url";

pub const MAX_CONCURRENT_BULK: usize = 32;
pub const POOL_CONNS_PER_HOST: usize = 32;
pub const SMALL_RANGE_PRIORITY_BYTES: u64 = 1024;

pub const READ_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_REQUEST_HEAD_BYTES: usize = 64 * 1024;

pub const PLAYLIST_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(60);
pub const PRUNE_DELAY: Duration = Duration::from_secs(5);

pub const HEAD_ONLY_SEGMENT_LIMIT: u32 = 8;
