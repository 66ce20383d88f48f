//! Loopback media proxy.
//!
//! Resolves a content id to signed upstream URLs, then serves the media on
//! `http://127.0.0.1:<port>/video.mp4` for a local player: either by muxing a
//! separate video and audio track through ffmpeg, or by relaying a single
//! combined URL with `Range` support.

pub mod config;
pub mod errors;
pub mod models;
pub mod proxy;
pub mod services;
pub mod utils;

pub use config::Config;
pub use errors::{ProxyError, ProxyResult};
