//! Error type definitions for the media proxy

use std::time::Duration;

use thiserror::Error;

/// Message shown to end users for any playback start failure.
pub const USER_FACING_MESSAGE: &str = "could not start playback";

/// Top-level error type for resolution, session startup and session failures.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Metadata or signed URL lookup failed
    #[error("Resolution failed for {content}: {message}")]
    Resolution { content: String, message: String },

    /// The upstream provider answered with a non-success status
    #[error("Upstream rejected request with status {status}: {url}")]
    UpstreamStatus { status: u16, url: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The loopback listener could not be bound
    #[error("Failed to bind local listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The external muxer could not be started
    #[error("Failed to spawn muxer '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The session did not signal readiness in time
    #[error("Proxy did not become ready within {0:?}")]
    NotReady(Duration),

    /// The session failed after startup (fatal muxer output, unexpected exit, upstream rejection)
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// Source URLs or content identifiers that cannot be used
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Create a resolution error
    pub fn resolution<C: Into<String>, M: Into<String>>(content: C, message: M) -> Self {
        Self::Resolution {
            content: content.into(),
            message: message.into(),
        }
    }

    /// Create an invalid source error
    pub fn invalid_source<S: Into<String>>(message: S) -> Self {
        Self::InvalidSource(message.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The single human-readable message the UI should display.
    pub fn user_message(&self) -> &'static str {
        USER_FACING_MESSAGE
    }

    /// Whether retrying makes sense after re-resolving fresh signed URLs.
    ///
    /// Resource and configuration errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamStatus { status, .. } => (400..500).contains(status),
            Self::Http(_) | Self::NotReady(_) | Self::SessionFailed(_) | Self::Resolution { .. } => {
                true
            }
            Self::Bind { .. }
            | Self::Spawn { .. }
            | Self::InvalidSource(_)
            | Self::Configuration { .. }
            | Self::Io(_) => false,
        }
    }
}
