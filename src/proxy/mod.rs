//! Loopback HTTP surface of a session and the upstream passthrough client.

pub mod handler;
pub mod http_stream;

pub use handler::{ClientEvent, HandlerContext, HandlerSource, router};
