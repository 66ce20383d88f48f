//! Content id to signed source URLs
//!
//! The Bilibili resolver makes two metadata calls: `view` for the content's
//! `cid` and duration, then `playurl` for signed track URLs. Either a single
//! combined URL (`durl`) or separate DASH video and audio URLs come back; the
//! caller picks the session mode from that.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{ProxyError, ProxyResult};
use crate::models::{ContentId, ResolvedMedia};
use crate::proxy::http_stream::{build_upstream_client, credential_headers};
use crate::services::credential_store::CredentialStore;

const VIEW_PATH: &str = "/x/web-interface/view";
const PLAYURL_PATH: &str = "/x/player/wbi/playurl";
/// DASH (separate video and audio)
const FNVAL_DASH: &str = "16";
/// Single combined MP4
const FNVAL_MP4: &str = "1";

#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    async fn resolve(
        &self,
        content: &ContentId,
        credentials: &CredentialStore,
    ) -> ProxyResult<ResolvedMedia>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ViewData {
    cid: u64,
    /// Seconds
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct PlayUrlData {
    /// Milliseconds
    #[serde(default)]
    timelength: Option<u64>,
    #[serde(default)]
    durl: Vec<DurlEntry>,
    #[serde(default)]
    dash: Option<DashData>,
}

#[derive(Debug, Deserialize)]
struct DurlEntry {
    url: String,
}

#[derive(Debug, Deserialize)]
struct DashData {
    #[serde(default)]
    video: Vec<DashStream>,
    #[serde(default)]
    audio: Vec<DashStream>,
}

#[derive(Debug, Deserialize)]
struct DashStream {
    #[serde(rename = "baseUrl", alias = "base_url")]
    base_url: String,
}

pub struct BilibiliResolver {
    client: Client,
    api_base: String,
    prefer_passthrough: bool,
}

impl BilibiliResolver {
    pub fn new(client: Client, api_base: impl Into<String>, prefer_passthrough: bool) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            prefer_passthrough,
        }
    }

    pub fn from_config(config: &Config) -> ProxyResult<Self> {
        Ok(Self::new(
            build_upstream_client(config.upstream.connect_timeout)?,
            config.upstream.api_base.clone(),
            config.upstream.prefer_passthrough,
        ))
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        content: &ContentId,
        path: &str,
        query: &[(&str, String)],
        credentials: &CredentialStore,
    ) -> ProxyResult<T> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .get(&url)
            .headers(credential_headers(credentials))
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
                url,
            });
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        if envelope.code != 0 {
            return Err(ProxyError::resolution(
                content.to_string(),
                format!("{path} returned code {}: {}", envelope.code, envelope.message),
            ));
        }
        envelope.data.ok_or_else(|| {
            ProxyError::resolution(content.to_string(), format!("{path} returned no data"))
        })
    }
}

#[async_trait]
impl UpstreamResolver for BilibiliResolver {
    async fn resolve(
        &self,
        content: &ContentId,
        credentials: &CredentialStore,
    ) -> ProxyResult<ResolvedMedia> {
        let id_param = content.query_pair();

        let view: ViewData = self
            .get_data(content, VIEW_PATH, &[id_param.clone()], credentials)
            .await?;
        debug!(
            "Resolved view content={} cid={} duration_s={} title={:?}",
            content, view.cid, view.duration, view.title
        );

        let fnval = if self.prefer_passthrough {
            FNVAL_MP4
        } else {
            FNVAL_DASH
        };
        let play: PlayUrlData = self
            .get_data(
                content,
                PLAYURL_PATH,
                &[
                    id_param,
                    ("cid", view.cid.to_string()),
                    ("fnval", fnval.to_string()),
                ],
                credentials,
            )
            .await?;

        let duration_ms = media_duration_ms(play.timelength, view.duration);

        if let Some(entry) = play.durl.into_iter().next() {
            info!("Resolved combined track content={}", content);
            return Ok(ResolvedMedia::combined(entry.url, duration_ms));
        }

        let dash = play.dash.ok_or_else(|| {
            ProxyError::resolution(content.to_string(), "no playable stream in playurl response")
        })?;
        match (dash.video.into_iter().next(), dash.audio.into_iter().next()) {
            (Some(video), Some(audio)) => {
                info!("Resolved DASH video and audio tracks content={}", content);
                Ok(ResolvedMedia::split(
                    video.base_url,
                    audio.base_url,
                    duration_ms,
                ))
            }
            _ => Err(ProxyError::resolution(
                content.to_string(),
                "DASH response is missing a video or an audio track",
            )),
        }
    }
}

/// Playurl's millisecond length, else the view's seconds; `None` when
/// neither is usable
fn media_duration_ms(timelength: Option<u64>, view_seconds: u64) -> Option<u64> {
    timelength
        .filter(|ms| *ms > 0)
        .or_else(|| view_seconds.checked_mul(1000).filter(|ms| *ms > 0))
}

/// Returns the same preconfigured media for every content id
#[derive(Debug, Clone)]
pub struct StaticResolver {
    media: ResolvedMedia,
}

impl StaticResolver {
    pub fn new(media: ResolvedMedia) -> Self {
        Self { media }
    }
}

#[async_trait]
impl UpstreamResolver for StaticResolver {
    async fn resolve(
        &self,
        _content: &ContentId,
        _credentials: &CredentialStore,
    ) -> ProxyResult<ResolvedMedia> {
        Ok(self.media.clone())
    }
}
