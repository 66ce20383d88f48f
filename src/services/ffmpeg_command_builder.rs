//! FFmpeg Command Builder Service
//!
//! Builds the argument list for muxing a separate video and audio track into
//! a fragmented MP4 written to stdout. Both inputs are fetched by ffmpeg
//! itself over HTTP with the credential headers attached.

use tracing::debug;

use crate::config::MuxerConfig;
use crate::errors::ProxyResult;
use crate::services::credential_store::CredentialStore;
use crate::utils::url::{UrlSanitization, UrlUtils};

/// Fragmented MP4 flags so the container can be played while it is written
pub const FRAGMENTED_MP4_FLAGS: &str = "frag_keyframe+empty_moov+default_base_moof";

/// Service for building FFmpeg command arguments
#[derive(Debug, Clone)]
pub struct FFmpegCommandBuilder {
    loglevel: String,
    rw_timeout_us: u128,
    sanitization: UrlSanitization,
}

impl FFmpegCommandBuilder {
    pub fn new(config: &MuxerConfig, sanitization: UrlSanitization) -> Self {
        Self {
            loglevel: config.loglevel.clone(),
            rw_timeout_us: config.rw_timeout.as_micros(),
            sanitization,
        }
    }

    /// Build arguments that stream-copy `video_url` and `audio_url` into one
    /// fragmented MP4 on `pipe:1`.
    pub fn build_args(
        &self,
        video_url: &str,
        audio_url: &str,
        credentials: &CredentialStore,
    ) -> ProxyResult<Vec<String>> {
        let video_url = UrlUtils::sanitize_upstream(video_url, self.sanitization)?;
        let audio_url = UrlUtils::sanitize_upstream(audio_url, self.sanitization)?;

        let mut args = Vec::new();
        self.add_global_args(&mut args);
        self.add_input_args(&mut args, &video_url, credentials);
        self.add_input_args(&mut args, &audio_url, credentials);
        self.add_mapping_args(&mut args);
        self.add_output_args(&mut args);

        debug!(
            "Generated FFmpeg command with {} arguments for video={} audio={}",
            args.len(),
            UrlUtils::redact(&video_url),
            UrlUtils::redact(&audio_url)
        );
        Ok(args)
    }

    fn add_global_args(&self, args: &mut Vec<String>) {
        args.extend([
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            self.loglevel.clone(),
        ]);
    }

    /// Per-input HTTP options must precede the `-i` they apply to
    fn add_input_args(&self, args: &mut Vec<String>, url: &str, credentials: &CredentialStore) {
        let headers = credentials.request_headers();

        if self.rw_timeout_us > 0 {
            args.push("-rw_timeout".to_string());
            args.push(self.rw_timeout_us.to_string());
        }
        if let Some(user_agent) = headers.get("User-Agent") {
            args.push("-user_agent".to_string());
            args.push(user_agent.to_string());
        }
        if let Some(referer) = headers.get("Referer") {
            args.push("-referer".to_string());
            args.push(referer.to_string());
        }
        let block = headers.to_header_block(&["User-Agent", "Referer"]);
        if !block.is_empty() {
            args.push("-headers".to_string());
            args.push(block);
        }

        args.push("-i".to_string());
        args.push(url.to_string());
    }

    fn add_mapping_args(&self, args: &mut Vec<String>) {
        args.extend(
            ["-map", "0:v:0", "-map", "1:a:0", "-c", "copy"]
                .iter()
                .map(|s| s.to_string()),
        );
    }

    fn add_output_args(&self, args: &mut Vec<String>) {
        args.extend(
            ["-movflags", FRAGMENTED_MP4_FLAGS, "-f", "mp4", "pipe:1"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
}
