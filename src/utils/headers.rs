//! Upstream request header allow-list
//!
//! Header names and values that end up on the muxer's command line or on
//! upstream requests come partly from resolver metadata. Only a fixed set
//! of names is forwarded and values are stripped of anything that could
//! split a header line.

use tracing::debug;

/// Header names that may be sent upstream, in canonical form
pub const ALLOWED_HEADERS: &[&str] = &[
    "User-Agent",
    "Referer",
    "Origin",
    "Accept",
    "Accept-Language",
    "Connection",
    "Cookie",
];

/// Canonical spelling of an allowed header name, `None` if not allowed
pub fn canonical_name(name: &str) -> Option<&'static str> {
    let name = name.trim();
    ALLOWED_HEADERS
        .iter()
        .copied()
        .find(|allowed| allowed.eq_ignore_ascii_case(name))
}

/// Remove CR, LF, other control characters and non-ASCII bytes from a header value
pub fn sanitize_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Ordered, deduplicated list of sanitized headers restricted to [`ALLOWED_HEADERS`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(&'static str, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header. Returns false when the name is not allowed
    /// or the value is empty after sanitization.
    pub fn insert(&mut self, name: &str, value: &str) -> bool {
        let Some(canonical) = canonical_name(name) else {
            debug!("Dropping non-allowed upstream header: {}", name);
            return false;
        };
        let value = sanitize_value(value);
        if value.is_empty() {
            return false;
        }
        match self.entries.iter_mut().find(|(n, _)| *n == canonical) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((canonical, value)),
        }
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let canonical = canonical_name(name)?;
        self.entries
            .iter()
            .find(|(n, _)| *n == canonical)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.entries.iter().map(|(n, v)| (*n, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as `Name: value\r\n` lines, skipping the given names
    pub fn to_header_block(&self, skip: &[&str]) -> String {
        self.iter()
            .filter(|(name, _)| !skip.iter().any(|s| s.eq_ignore_ascii_case(name)))
            .map(|(name, value)| format!("{name}: {value}\r\n"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_disallowed_header_is_dropped_and_logged() {
        let mut headers = HeaderSet::new();
        assert!(!headers.insert("X-Api-Key", "secret"));
        assert!(headers.is_empty());
        assert!(logs_contain("Dropping non-allowed upstream header: X-Api-Key"));
    }

    #[test]
    fn test_allow_list_is_case_insensitive() {
        assert_eq!(canonical_name("user-agent"), Some("User-Agent"));
        assert_eq!(canonical_name(" COOKIE "), Some("Cookie"));
        assert_eq!(canonical_name("X-Forwarded-For"), None);
        assert_eq!(canonical_name("Host"), None);
    }

    #[test]
    fn test_values_cannot_inject_lines() {
        let mut headers = HeaderSet::new();
        assert!(headers.insert("Referer", "https://a.example/\r\nX-Evil: 1"));
        assert_eq!(headers.get("referer"), Some("https://a.example/X-Evil: 1"));
        assert!(!headers.to_header_block(&[]).contains("\r\nX-Evil"));
    }

    #[test]
    fn test_insert_replaces_and_filters() {
        let mut headers = HeaderSet::new();
        assert!(!headers.insert("X-Api-Key", "secret"));
        assert!(!headers.insert("Accept", "\u{00e9}\n"));
        assert!(headers.insert("accept", "*/*"));
        assert!(headers.insert("Accept", "video/mp4"));
        assert_eq!(headers.iter().count(), 1);
        assert_eq!(headers.get("Accept"), Some("video/mp4"));
    }

    #[test]
    fn test_header_block_skips_names() {
        let mut headers = HeaderSet::new();
        headers.insert("User-Agent", "ua");
        headers.insert("Origin", "https://o.example");
        headers.insert("Cookie", "a=1");
        assert_eq!(
            headers.to_header_block(&["user-agent"]),
            "Origin: https://o.example\r\nCookie: a=1\r\n"
        );
    }
}
