use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::errors::{ProxyError, ProxyResult};

/// Upstream content identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentId {
    /// `BV1xx411c7mD` style identifier
    Bvid(String),
    /// Numeric identifier, accepted as `av170001` or `170001`
    Aid(u64),
}

impl ContentId {
    pub fn parse(input: &str) -> ProxyResult<Self> {
        let trimmed = input.trim();
        let has_prefix = |prefix: &str| {
            trimmed.len() > 2
                && trimmed
                    .get(..2)
                    .is_some_and(|p| p.eq_ignore_ascii_case(prefix))
        };
        if has_prefix("bv") {
            let rest = &trimmed[2..];
            if rest.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Ok(ContentId::Bvid(format!("BV{rest}")));
            }
        }

        let digits = if has_prefix("av") {
            &trimmed[2..]
        } else {
            trimmed
        };
        digits
            .parse::<u64>()
            .map(ContentId::Aid)
            .map_err(|_| ProxyError::invalid_source(format!("unrecognised content id '{input}'")))
    }

    /// Query parameter understood by the metadata API
    pub fn query_pair(&self) -> (&'static str, String) {
        match self {
            ContentId::Bvid(bvid) => ("bvid", bvid.clone()),
            ContentId::Aid(aid) => ("aid", aid.to_string()),
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentId::Bvid(bvid) => write!(f, "{bvid}"),
            ContentId::Aid(aid) => write!(f, "av{aid}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Separate video and audio tracks combined by the external muxer
    Muxed,
    /// A single combined upstream URL relayed with Range support
    Passthrough,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Muxed => write!(f, "muxed"),
            SessionMode::Passthrough => write!(f, "passthrough"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    ProcessStarting,
    Ready,
    Serving,
    Draining,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::ProcessStarting => "process_starting",
            SessionState::Ready => "ready",
            SessionState::Serving => "serving",
            SessionState::Draining => "draining",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Combined,
}

/// One signed upstream URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTrack {
    pub kind: TrackKind,
    pub url: String,
}

impl SourceTrack {
    pub fn video(url: impl Into<String>) -> Self {
        Self {
            kind: TrackKind::Video,
            url: url.into(),
        }
    }

    pub fn audio(url: impl Into<String>) -> Self {
        Self {
            kind: TrackKind::Audio,
            url: url.into(),
        }
    }

    pub fn combined(url: impl Into<String>) -> Self {
        Self {
            kind: TrackKind::Combined,
            url: url.into(),
        }
    }
}

/// Resolver output: signed track URLs plus the authoritative duration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMedia {
    pub tracks: Vec<SourceTrack>,
    pub duration_ms: Option<u64>,
}

impl ResolvedMedia {
    pub fn combined(url: impl Into<String>, duration_ms: Option<u64>) -> Self {
        Self {
            tracks: vec![SourceTrack::combined(url)],
            duration_ms,
        }
    }

    pub fn split(
        video: impl Into<String>,
        audio: impl Into<String>,
        duration_ms: Option<u64>,
    ) -> Self {
        Self {
            tracks: vec![SourceTrack::video(video), SourceTrack::audio(audio)],
            duration_ms,
        }
    }

    fn track(&self, kind: TrackKind) -> Option<&SourceTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Pick the session mode from what the resolver returned.
    ///
    /// A combined track always wins; otherwise both a video and an audio
    /// track are required.
    pub fn into_source(self) -> ProxyResult<SessionSource> {
        if let Some(track) = self.track(TrackKind::Combined) {
            return Ok(SessionSource::Passthrough {
                url: track.url.clone(),
                duration_ms: self.duration_ms,
            });
        }
        match (self.track(TrackKind::Video), self.track(TrackKind::Audio)) {
            (Some(video), Some(audio)) => Ok(SessionSource::Muxed {
                video_url: video.url.clone(),
                audio_url: audio.url.clone(),
                duration_ms: self.duration_ms,
            }),
            _ => Err(ProxyError::invalid_source(format!(
                "expected one combined track or a video and an audio track, got {}",
                self.tracks.len()
            ))),
        }
    }
}

/// What a session serves, tagged by mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSource {
    Muxed {
        video_url: String,
        audio_url: String,
        duration_ms: Option<u64>,
    },
    Passthrough {
        url: String,
        duration_ms: Option<u64>,
    },
}

impl SessionSource {
    pub fn mode(&self) -> SessionMode {
        match self {
            SessionSource::Muxed { .. } => SessionMode::Muxed,
            SessionSource::Passthrough { .. } => SessionMode::Passthrough,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            SessionSource::Muxed { duration_ms, .. } => *duration_ms,
            SessionSource::Passthrough { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn urls(&self) -> Vec<&str> {
        match self {
            SessionSource::Muxed {
                video_url,
                audio_url,
                ..
            } => vec![video_url.as_str(), audio_url.as_str()],
            SessionSource::Passthrough { url, .. } => vec![url.as_str()],
        }
    }
}

/// Behaviour of a muxed session when its client goes away before end of stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPolicy {
    Teardown,
    KeepWarm { grace: Duration },
}
