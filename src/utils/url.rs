//! URL utilities for upstream source URLs
//!
//! Signed upstream URLs occasionally arrive with non-ASCII bytes in them.
//! They are cleaned up here before being handed to the muxer or to the
//! HTTP client, and redacted before they reach the logs.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{ProxyError, ProxyResult};

/// How non-ASCII characters in upstream URLs are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSanitization {
    /// Drop every non-ASCII and control character
    #[default]
    StripNonAscii,
    /// Let the URL parser percent-encode path and query characters
    PercentEncode,
}

/// URL utilities for consistent URL handling
pub struct UrlUtils;

impl UrlUtils {
    /// Remove non-ASCII and ASCII control characters, keeping everything else verbatim
    ///
    /// # Examples
    ///
    /// ```rust
    /// use media_proxy::utils::url::UrlUtils;
    ///
    /// assert_eq!(
    ///     UrlUtils::strip_non_ascii("https://cdn.example/v.m4s?sig=ab\u{00e9}c"),
    ///     "https://cdn.example/v.m4s?sig=abc"
    /// );
    /// ```
    pub fn strip_non_ascii(url: &str) -> String {
        url.chars()
            .filter(|c| c.is_ascii() && !c.is_ascii_control())
            .collect()
    }

    /// Re-serialize the URL through the parser, which percent-encodes
    /// non-ASCII path and query characters
    pub fn percent_encode(url: &str) -> Result<String, url::ParseError> {
        Url::parse(url.trim()).map(|u| u.to_string())
    }

    /// Sanitize an upstream URL and check that it is an absolute http(s) URL
    pub fn sanitize_upstream(url: &str, mode: UrlSanitization) -> ProxyResult<String> {
        let cleaned = match mode {
            UrlSanitization::StripNonAscii => Self::strip_non_ascii(url.trim()),
            UrlSanitization::PercentEncode => Self::percent_encode(url)
                .map_err(|e| ProxyError::invalid_source(format!("unparseable URL: {e}")))?,
        };

        let parsed = Url::parse(&cleaned)
            .map_err(|e| ProxyError::invalid_source(format!("unparseable URL: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::invalid_source(format!(
                    "unsupported URL scheme '{other}'"
                )));
            }
        }
        if parsed.host_str().is_none() {
            return Err(ProxyError::invalid_source("URL has no host"));
        }

        Ok(cleaned)
    }

    /// Drop the query string so signed tokens never reach the logs
    pub fn redact(url: &str) -> String {
        match Url::parse(url) {
            Ok(mut parsed) => {
                let had_query = parsed.query().is_some();
                parsed.set_query(None);
                parsed.set_fragment(None);
                if had_query {
                    format!("{parsed}?<redacted>")
                } else {
                    parsed.to_string()
                }
            }
            Err(_) => "<invalid url>".to_string(),
        }
    }
}
