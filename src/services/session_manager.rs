//! Session Manager Service
//!
//! Resolves content ids, picks the session mode and keeps at most one live
//! [`StreamSession`] per content id.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::ProxyResult;
use crate::models::{ContentId, ResolvedMedia, SessionMode};
use crate::services::credential_store::SharedCredentials;
use crate::services::stream_session::StreamSession;
use crate::services::upstream_resolver::UpstreamResolver;

/// What the player needs to start playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackHandle {
    pub content_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    pub output_url: String,
    /// Prefer this over the duration reported by the player
    pub duration_ms: Option<u64>,
}

pub struct SessionManager {
    config: Config,
    resolver: Arc<dyn UpstreamResolver>,
    credentials: Arc<SharedCredentials>,
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        resolver: Arc<dyn UpstreamResolver>,
        credentials: Arc<SharedCredentials>,
    ) -> Self {
        Self {
            config,
            resolver,
            credentials,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn credentials(&self) -> &Arc<SharedCredentials> {
        &self.credentials
    }

    /// Resolve `content` and open a ready session for it
    pub async fn open(&self, content: &ContentId) -> ProxyResult<PlaybackHandle> {
        let credentials = self.credentials.snapshot();
        let media = self.resolver.resolve(content, &credentials).await?;
        self.open_resolved(content, media).await
    }

    /// Open a ready session for already-resolved media, replacing any session
    /// open for the same content id
    pub async fn open_resolved(
        &self,
        content: &ContentId,
        media: ResolvedMedia,
    ) -> ProxyResult<PlaybackHandle> {
        let key = content.to_string();
        let source = media.into_source()?;

        if self.close(&key).await {
            debug!("Replaced existing session for content={}", key);
        }

        let session = StreamSession::open(
            &key,
            source,
            self.credentials.snapshot(),
            &self.config,
        )
        .await?;
        let handle = PlaybackHandle {
            content_id: key.clone(),
            session_id: session.id().to_string(),
            mode: session.mode(),
            output_url: session.output_url().to_string(),
            duration_ms: session.duration_ms(),
        };

        let previous = self
            .sessions
            .write()
            .await
            .insert(key.clone(), Arc::new(session));
        if let Some(previous) = previous {
            // A concurrent open for the same content won the race before us
            previous.stop().await;
        }

        info!(
            "Playback ready content={} session_id={} mode={} url={}",
            handle.content_id, handle.session_id, handle.mode, handle.output_url
        );
        Ok(handle)
    }

    /// Live session for `content_id`; sessions that already stopped or failed are pruned
    pub async fn get(&self, content_id: &str) -> Option<Arc<StreamSession>> {
        self.prune().await;
        self.sessions.read().await.get(content_id).cloned()
    }

    /// Stop and forget the session for `content_id`
    pub async fn close(&self, content_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(content_id);
        match removed {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        if sessions.is_empty() {
            return;
        }
        info!("Stopping {} sessions", sessions.len());
        futures::future::join_all(sessions.iter().map(|(_, session)| session.stop())).await;
    }

    pub async fn active_count(&self) -> usize {
        self.prune().await;
        self.sessions.read().await.len()
    }

    async fn prune(&self) {
        let finished: Vec<Arc<StreamSession>> = {
            let mut sessions = self.sessions.write().await;
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.state().is_terminal())
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        for session in finished {
            debug!(
                "Pruning finished session session_id={} reason={:?}",
                session.id(),
                session.failure_reason()
            );
            // Completes the teardown if the session failed on its own
            session.stop().await;
        }
    }
}
