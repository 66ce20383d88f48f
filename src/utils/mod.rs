//! Utility modules for the media proxy
//!
//! URL and header sanitization shared by the muxer command builder and
//! the passthrough HTTP client.

pub mod headers;
pub mod url;

pub use headers::HeaderSet;
pub use self::url::{UrlSanitization, UrlUtils};
