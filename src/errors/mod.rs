//! Centralized error handling for the media proxy
//!
//! Every fallible operation in the crate returns [`ProxyError`]. Errors raised
//! inside background tasks (muxer readers, the HTTP server, the session
//! supervisor) never escape as panics; they are converted into session state
//! transitions and a recorded failure reason instead.
//!
//! # Error Categories
//!
//! - **Resolution errors**: metadata / signed URL lookup failed
//! - **Upstream errors**: the provider rejected a request (usually an expired signed URL)
//! - **Resource errors**: port bind or muxer spawn failed
//! - **Session errors**: readiness timeout, fatal muxer output, unexpected exit
//!
//! # Usage
//!
//! ```rust
//! use media_proxy::errors::{ProxyError, ProxyResult};
//!
//! fn example_function() -> ProxyResult<String> {
//!     Err(ProxyError::invalid_source("no tracks"))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using ProxyError
pub type ProxyResult<T> = Result<T, ProxyError>;
