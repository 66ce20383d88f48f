/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Loopback server defaults
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_OUTPUT_PATH: &str = "/video.mp4";
pub const DEFAULT_READY_TIMEOUT: &str = "15s";
pub const DEFAULT_SHUTDOWN_TIMEOUT: &str = "3s";
pub const DEFAULT_RECONNECT_GRACE: &str = "10s";

// Chunk channel defaults
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_GET_TIMEOUT: &str = "500ms";
pub const DEFAULT_PUT_TIMEOUT: &str = "2s";

// Muxer defaults
pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg";
pub const DEFAULT_READ_BLOCK_SIZE: usize = 512 * 1024; // 512KB
pub const DEFAULT_STDERR_LOG_LINES: usize = 200;
pub const DEFAULT_FATAL_MARKERS: &[&str] = &["error", "403", "404"];
pub const DEFAULT_GRACEFUL_STOP_TIMEOUT: &str = "2s";
pub const DEFAULT_KILL_TIMEOUT: &str = "2s";
pub const DEFAULT_REAP_TIMEOUT: &str = "5s";
pub const DEFAULT_RW_TIMEOUT: &str = "15s";
pub const DEFAULT_MUXER_LOGLEVEL: &str = "warning";

// Upstream defaults
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
pub const DEFAULT_REFERER: &str = "https://www.bilibili.com/";
pub const DEFAULT_ORIGIN: &str = "https://www.bilibili.com";
pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";
pub const DEFAULT_CONNECT_TIMEOUT: &str = "10s";
pub const DEFAULT_PASSTHROUGH_CHUNK_SIZE: usize = 1024 * 1024; // 1MB
