//! Muxer stderr capture
//!
//! Keeps the most recent stderr lines for diagnostics and decides which
//! lines mean the upstream fetch is broken.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::errors::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Info,
    Fatal,
}

/// Whole-word, case-insensitive keyword classifier
#[derive(Debug, Clone)]
pub struct FatalMarkers {
    pattern: Option<Regex>,
}

impl FatalMarkers {
    pub fn new<S: AsRef<str>>(markers: &[S]) -> ProxyResult<Self> {
        let alternatives: Vec<String> = markers
            .iter()
            .map(|m| m.as_ref().trim())
            .filter(|m| !m.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
            .map_err(|e| ProxyError::configuration(format!("invalid fatal marker: {e}")))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn classify(&self, line: &str) -> LineClass {
        match &self.pattern {
            Some(pattern) if pattern.is_match(line) => LineClass::Fatal,
            _ => LineClass::Info,
        }
    }
}

/// Bounded ring of the latest stderr lines
#[derive(Debug)]
pub struct StderrLog {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl StderrLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
