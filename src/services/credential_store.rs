//! Upstream credentials
//!
//! [`CredentialStore`] is an immutable value: cookies and identity headers
//! needed to get past the provider's hotlink protection. Updates build a new
//! store; [`SharedCredentials`] swaps the current snapshot atomically so a
//! running session keeps reading the snapshot it started with.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::config::defaults::{DEFAULT_ORIGIN, DEFAULT_REFERER, DEFAULT_USER_AGENT};
use crate::errors::{ProxyError, ProxyResult};
use crate::utils::headers::{self, HeaderSet};

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStore {
    cookies: BTreeMap<String, String>,
    user_agent: String,
    referer: String,
    origin: String,
    extra_headers: HeaderSet,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENT, DEFAULT_REFERER, DEFAULT_ORIGIN)
    }
}

impl CredentialStore {
    pub fn new(
        user_agent: impl Into<String>,
        referer: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            cookies: BTreeMap::new(),
            user_agent: headers::sanitize_value(&user_agent.into()),
            referer: headers::sanitize_value(&referer.into()),
            origin: headers::sanitize_value(&origin.into()),
            extra_headers: HeaderSet::new(),
        }
    }

    /// Identity headers from `[upstream]` plus the cookie jar from `[credentials]`, if any
    pub fn from_config(config: &Config) -> ProxyResult<Self> {
        let base = Self::new(
            &config.upstream.user_agent,
            &config.upstream.referer,
            &config.upstream.origin,
        );
        match &config.credentials.cookie_file {
            Some(path) => {
                let cookies = Self::read_netscape_file(path)?;
                info!(
                    "Loaded {} cookies from {}",
                    cookies.len(),
                    path.display()
                );
                Ok(base.with_cookies(cookies))
            }
            None => Ok(base),
        }
    }

    /// Default identity headers with cookies from a Netscape cookie jar
    pub fn from_netscape_file(path: impl AsRef<Path>) -> ProxyResult<Self> {
        let cookies = Self::read_netscape_file(path.as_ref())?;
        Ok(Self::default().with_cookies(cookies))
    }

    /// Default identity headers with cookies from a `name=value; name2=value2` string
    pub fn from_cookie_header(header: &str) -> Self {
        let cookies = header.split(';').filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        });
        Self::default().with_cookies(cookies)
    }

    fn read_netscape_file(path: &Path) -> ProxyResult<BTreeMap<String, String>> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::configuration(format!(
                "cannot read cookie file {}: {e}",
                path.display()
            ))
        })?;
        Ok(parse_netscape_cookies(&contents))
    }

    /// New store with one cookie added or replaced
    pub fn with_cookie(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_cookies([(name.into(), value.into())])
    }

    /// New store with all given cookies added or replaced; later pairs win
    pub fn with_cookies<I, K, V>(&self, cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        for (name, value) in cookies {
            let name = headers::sanitize_value(&name.into());
            // `;` and `=` would corrupt the assembled Cookie line
            if name.is_empty() || name.contains(['=', ';']) {
                continue;
            }
            let value = headers::sanitize_value(&value.into()).replace(';', "");
            next.cookies.insert(name, value);
        }
        next
    }

    /// New store with an extra allow-listed header; disallowed names are ignored
    pub fn with_header(&self, name: &str, value: &str) -> Self {
        let mut next = self.clone();
        match headers::canonical_name(name) {
            Some("User-Agent") => next.user_agent = headers::sanitize_value(value),
            Some("Referer") => next.referer = headers::sanitize_value(value),
            Some("Origin") => next.origin = headers::sanitize_value(value),
            Some("Cookie") => {
                debug!("Ignoring raw Cookie header, use with_cookies instead");
            }
            Some(_) => {
                next.extra_headers.insert(name, value);
            }
            None => debug!("Ignoring non-allowed credential header: {}", name),
        }
        next
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn referer(&self) -> &str {
        &self.referer
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    /// `name=value; name2=value2` in name order, `None` without cookies
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Every header to send upstream, already allow-listed and sanitized
    pub fn request_headers(&self) -> HeaderSet {
        let mut set = HeaderSet::new();
        set.insert("User-Agent", &self.user_agent);
        set.insert("Referer", &self.referer);
        set.insert("Origin", &self.origin);
        for (name, value) in self.extra_headers.iter() {
            set.insert(name, value);
        }
        if let Some(cookie) = self.cookie_header() {
            set.insert("Cookie", &cookie);
        }
        set
    }
}

/// Parse a Netscape cookie jar: seven tab-separated fields, name in the sixth and
/// value in the seventh. Comments and short lines are skipped.
pub fn parse_netscape_cookies(contents: &str) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for raw in contents.lines() {
        let line = raw.trim_end_matches(['\r', '\n']);
        let line = line.strip_prefix(HTTP_ONLY_PREFIX).unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            debug!("Skipping malformed cookie line with {} fields", fields.len());
            continue;
        }
        cookies.insert(fields[5].to_string(), fields[6].to_string());
    }
    cookies
}

/// Current credential snapshot shared across sessions
#[derive(Debug)]
pub struct SharedCredentials {
    current: RwLock<Arc<CredentialStore>>,
}

impl SharedCredentials {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            current: RwLock::new(Arc::new(store)),
        }
    }

    pub fn snapshot(&self) -> Arc<CredentialStore> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new snapshot; sessions already running keep the old one
    pub fn replace(&self, store: CredentialStore) -> Arc<CredentialStore> {
        let next = Arc::new(store);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

impl Default for SharedCredentials {
    fn default() -> Self {
        Self::new(CredentialStore::default())
    }
}
