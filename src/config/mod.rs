use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::{duration, parse_default};

use crate::errors::{ProxyError, ProxyResult};
use crate::models::DisconnectPolicy;
use crate::utils::url::UrlSanitization;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub muxer: MuxerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// What happens to a muxed session when its client disconnects mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectMode {
    Teardown,
    KeepWarm,
}

/// Loopback HTTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Must be a loopback address; the proxy is never exposed off-host
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_output_path")]
    pub output_path: String,
    /// Maximum wait for the first muxed bytes (or the passthrough probe)
    #[serde(default = "default_ready_timeout", with = "duration")]
    pub ready_timeout: Duration,
    /// Maximum wait for the HTTP server task to finish on stop
    #[serde(default = "default_shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_disconnect_mode")]
    pub disconnect_policy: DisconnectMode,
    /// Only used with `disconnect_policy = "keep_warm"`
    #[serde(default = "default_reconnect_grace", with = "duration")]
    pub reconnect_grace: Duration,
}

/// Backpressure channel between the muxer and the HTTP handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Maximum number of buffered chunks
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
    #[serde(default = "default_get_timeout", with = "duration")]
    pub get_timeout: Duration,
    /// A chunk that cannot be queued within this time is dropped
    #[serde(default = "default_put_timeout", with = "duration")]
    pub put_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxerConfig {
    /// FFmpeg command to use for muxing
    /// Can be a full path (/usr/bin/ffmpeg) or command name (ffmpeg)
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    #[serde(default = "default_read_block_size")]
    pub read_block_size: usize,
    #[serde(default = "default_stderr_log_lines")]
    pub stderr_log_lines: usize,
    /// Case-insensitive whole-word markers that flag a stderr line as fatal
    #[serde(default = "default_fatal_markers")]
    pub fatal_markers: Vec<String>,
    #[serde(default = "default_graceful_stop_timeout", with = "duration")]
    pub graceful_stop_timeout: Duration,
    #[serde(default = "default_kill_timeout", with = "duration")]
    pub kill_timeout: Duration,
    /// Time allowed for the process to exit after its stdout ended
    #[serde(default = "default_reap_timeout", with = "duration")]
    pub reap_timeout: Duration,
    /// Upstream read/write timeout handed to the muxer's HTTP client
    #[serde(default = "default_rw_timeout", with = "duration")]
    pub rw_timeout: Duration,
    #[serde(default = "default_muxer_loglevel")]
    pub loglevel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Metadata API base used by the resolver
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,
    #[serde(default = "default_passthrough_chunk_size")]
    pub passthrough_chunk_size: usize,
    #[serde(default)]
    pub url_sanitization: UrlSanitization,
    /// Ask the resolver for a single combined track when the provider offers one
    #[serde(default)]
    pub prefer_passthrough: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Netscape-format cookie jar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_file: Option<PathBuf>,
}

fn default_bind_host() -> String {
    DEFAULT_BIND_HOST.to_string()
}
fn default_output_path() -> String {
    DEFAULT_OUTPUT_PATH.to_string()
}
fn default_ready_timeout() -> Duration {
    parse_default(DEFAULT_READY_TIMEOUT)
}
fn default_shutdown_timeout() -> Duration {
    parse_default(DEFAULT_SHUTDOWN_TIMEOUT)
}
fn default_disconnect_mode() -> DisconnectMode {
    DisconnectMode::Teardown
}
fn default_reconnect_grace() -> Duration {
    parse_default(DEFAULT_RECONNECT_GRACE)
}
fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_get_timeout() -> Duration {
    parse_default(DEFAULT_GET_TIMEOUT)
}
fn default_put_timeout() -> Duration {
    parse_default(DEFAULT_PUT_TIMEOUT)
}
fn default_ffmpeg_command() -> String {
    DEFAULT_FFMPEG_COMMAND.to_string()
}
fn default_read_block_size() -> usize {
    DEFAULT_READ_BLOCK_SIZE
}
fn default_stderr_log_lines() -> usize {
    DEFAULT_STDERR_LOG_LINES
}
fn default_fatal_markers() -> Vec<String> {
    DEFAULT_FATAL_MARKERS.iter().map(|m| m.to_string()).collect()
}
fn default_graceful_stop_timeout() -> Duration {
    parse_default(DEFAULT_GRACEFUL_STOP_TIMEOUT)
}
fn default_kill_timeout() -> Duration {
    parse_default(DEFAULT_KILL_TIMEOUT)
}
fn default_reap_timeout() -> Duration {
    parse_default(DEFAULT_REAP_TIMEOUT)
}
fn default_rw_timeout() -> Duration {
    parse_default(DEFAULT_RW_TIMEOUT)
}
fn default_muxer_loglevel() -> String {
    DEFAULT_MUXER_LOGLEVEL.to_string()
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_referer() -> String {
    DEFAULT_REFERER.to_string()
}
fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}
fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}
fn default_connect_timeout() -> Duration {
    parse_default(DEFAULT_CONNECT_TIMEOUT)
}
fn default_passthrough_chunk_size() -> usize {
    DEFAULT_PASSTHROUGH_CHUNK_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            output_path: default_output_path(),
            ready_timeout: default_ready_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            disconnect_policy: default_disconnect_mode(),
            reconnect_grace: default_reconnect_grace(),
        }
    }
}

impl ServerConfig {
    pub fn disconnect_policy(&self) -> DisconnectPolicy {
        match self.disconnect_policy {
            DisconnectMode::Teardown => DisconnectPolicy::Teardown,
            DisconnectMode::KeepWarm => DisconnectPolicy::KeepWarm {
                grace: self.reconnect_grace,
            },
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
            get_timeout: default_get_timeout(),
            put_timeout: default_put_timeout(),
        }
    }
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: default_ffmpeg_command(),
            read_block_size: default_read_block_size(),
            stderr_log_lines: default_stderr_log_lines(),
            fatal_markers: default_fatal_markers(),
            graceful_stop_timeout: default_graceful_stop_timeout(),
            kill_timeout: default_kill_timeout(),
            reap_timeout: default_reap_timeout(),
            rw_timeout: default_rw_timeout(),
            loglevel: default_muxer_loglevel(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            referer: default_referer(),
            origin: default_origin(),
            api_base: default_api_base(),
            connect_timeout: default_connect_timeout(),
            passthrough_chunk_size: default_passthrough_chunk_size(),
            url_sanitization: UrlSanitization::default(),
            prefer_passthrough: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let config: Self = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            default_config
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would expose the proxy or make sessions unusable.
    pub fn validate(&self) -> ProxyResult<()> {
        let host: IpAddr = self.server.bind_host.parse().map_err(|_| {
            ProxyError::configuration(format!(
                "server.bind_host '{}' is not an IP address",
                self.server.bind_host
            ))
        })?;
        if !host.is_loopback() {
            return Err(ProxyError::configuration(format!(
                "server.bind_host '{host}' is not a loopback address"
            )));
        }
        if !self.server.output_path.starts_with('/') || self.server.output_path.len() < 2 {
            return Err(ProxyError::configuration(format!(
                "server.output_path '{}' must be an absolute path",
                self.server.output_path
            )));
        }
        if self.channel.capacity == 0 {
            return Err(ProxyError::configuration("channel.capacity must be > 0"));
        }
        if self.muxer.read_block_size == 0 {
            return Err(ProxyError::configuration("muxer.read_block_size must be > 0"));
        }
        if self.upstream.passthrough_chunk_size == 0 {
            return Err(ProxyError::configuration(
                "upstream.passthrough_chunk_size must be > 0",
            ));
        }
        Ok(())
    }
}
