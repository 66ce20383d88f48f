//! One playback session
//!
//! A session owns a loopback listener on an OS-assigned port, the producer
//! (a [`MuxingProcess`] feeding a [`ChunkChannel`], or a passthrough upstream)
//! and the HTTP server task. A supervisor task turns muxer and client events
//! into state transitions. [`StreamSession::stop`] releases everything exactly
//! once.
//!
//! State flow:
//! `Initializing -> ProcessStarting -> Ready <-> Serving -> Draining -> Stopped`,
//! with `Failed` reachable from any non-terminal state.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{ProxyError, ProxyResult};
use crate::models::{DisconnectPolicy, SessionMode, SessionSource, SessionState};
use crate::proxy::handler::{self, ClientEvent, HandlerContext, HandlerSource};
use crate::proxy::http_stream::{PassthroughUpstream, build_upstream_client};
use crate::services::chunk_channel::ChunkChannel;
use crate::services::credential_store::CredentialStore;
use crate::services::ffmpeg_command_builder::FFmpegCommandBuilder;
use crate::services::muxing_process::{MuxerEvent, MuxerOptions, MuxingProcess};
use crate::utils::url::UrlUtils;

/// Readiness signal, set once from `Pending`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks_queued: u64,
    pub chunks_dropped: u64,
    pub bytes_served: u64,
    pub muxer_bytes_read: u64,
}

struct SessionInner {
    id: String,
    mode: SessionMode,
    addr: SocketAddr,
    output_url: String,
    duration_ms: Option<u64>,
    policy: DisconnectPolicy,
    shutdown_timeout: Duration,
    state: watch::Sender<SessionState>,
    readiness: watch::Sender<Readiness>,
    failure: Mutex<Option<String>>,
    cancel: CancellationToken,
    channel: Option<Arc<ChunkChannel>>,
    muxer: OnceLock<MuxingProcess>,
    server: Mutex<Option<JoinHandle<()>>>,
    bytes_served: Arc<AtomicU64>,
    stopped: tokio::sync::Mutex<bool>,
}

pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl StreamSession {
    /// Bind the loopback listener, start the producer and the HTTP server.
    ///
    /// Returns once connections can be accepted. A muxed session becomes ready
    /// when its first output block is queued; a passthrough session is ready
    /// when this returns. Any failure here is cleaned up before returning.
    /// Only loopback bind hosts are accepted.
    pub async fn start(
        label: &str,
        source: SessionSource,
        credentials: Arc<CredentialStore>,
        config: &Config,
    ) -> ProxyResult<Self> {
        config.validate()?;
        let host: IpAddr = config.server.bind_host.parse().map_err(|_| {
            ProxyError::configuration(format!(
                "server.bind_host '{}' is not an IP address",
                config.server.bind_host
            ))
        })?;
        let listener =
            TcpListener::bind(SocketAddr::new(host, 0))
                .await
                .map_err(|source| ProxyError::Bind {
                    addr: format!("{host}:0"),
                    source,
                })?;
        let addr = listener.local_addr()?;

        let id = format!("{}-{}", label, &Uuid::new_v4().simple().to_string()[..8]);
        let mode = source.mode();
        let channel = match mode {
            SessionMode::Muxed => Some(Arc::new(ChunkChannel::new(config.channel.capacity))),
            SessionMode::Passthrough => None,
        };
        let (state, _) = watch::channel(SessionState::Initializing);
        let (readiness, _) = watch::channel(Readiness::Pending);

        let session = Self {
            inner: Arc::new(SessionInner {
                output_url: format!("http://{addr}{}", config.server.output_path),
                id,
                mode,
                addr,
                duration_ms: source.duration_ms(),
                policy: config.server.disconnect_policy(),
                shutdown_timeout: config.server.shutdown_timeout,
                state,
                readiness,
                failure: Mutex::new(None),
                cancel: CancellationToken::new(),
                channel,
                muxer: OnceLock::new(),
                server: Mutex::new(None),
                bytes_served: Arc::new(AtomicU64::new(0)),
                stopped: tokio::sync::Mutex::new(false),
            }),
        };
        info!(
            "Starting session session_id={} mode={} addr={}",
            session.inner.id, mode, addr
        );

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (handler_source, muxer_rx) =
            match session.start_producer(&source, &credentials, config).await {
                Ok(started) => started,
                Err(e) => {
                    error!(
                        "Session failed to start session_id={}: {}",
                        session.inner.id, e
                    );
                    session.inner.fail(e.to_string());
                    session.inner.stop().await;
                    return Err(e);
                }
            };

        let ctx = Arc::new(HandlerContext::new(
            session.inner.id.clone(),
            config.server.output_path.clone(),
            handler_source,
            session.inner.cancel.clone(),
            client_tx,
            session.inner.bytes_served.clone(),
        ));
        let app = handler::router(ctx);

        let shutdown = session.inner.cancel.clone();
        let server_id = session.inner.id.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            match result {
                Ok(()) => debug!("Session server stopped session_id={}", server_id),
                Err(e) => error!("Session server failed session_id={}: {}", server_id, e),
            }
        });
        match session.inner.server.lock() {
            Ok(mut slot) => *slot = Some(server),
            Err(poisoned) => *poisoned.into_inner() = Some(server),
        }

        tokio::spawn(supervise(session.inner.clone(), muxer_rx, client_rx));

        Ok(session)
    }

    /// `start` followed by `wait_ready`; on any error the session is fully
    /// stopped before this returns.
    pub async fn open(
        label: &str,
        source: SessionSource,
        credentials: Arc<CredentialStore>,
        config: &Config,
    ) -> ProxyResult<Self> {
        let session = Self::start(label, source, credentials, config).await?;
        match session.wait_ready(config.server.ready_timeout).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.stop().await;
                Err(e)
            }
        }
    }

    async fn start_producer(
        &self,
        source: &SessionSource,
        credentials: &CredentialStore,
        config: &Config,
    ) -> ProxyResult<(HandlerSource, Option<mpsc::UnboundedReceiver<MuxerEvent>>)> {
        let inner = &self.inner;
        inner.set_state(SessionState::ProcessStarting);

        match source {
            SessionSource::Muxed {
                video_url,
                audio_url,
                ..
            } => {
                let channel = inner.channel.clone().ok_or_else(|| {
                    ProxyError::SessionFailed("muxed session without a channel".to_string())
                })?;
                let args = FFmpegCommandBuilder::new(&config.muxer, config.upstream.url_sanitization)
                    .build_args(video_url, audio_url, credentials)?;
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let muxer = MuxingProcess::spawn(
                    MuxerOptions::from_config(inner.id.clone(), config),
                    args,
                    channel.clone(),
                    events_tx,
                    inner.cancel.child_token(),
                )?;
                // Only ever set here, once per session
                let _ = inner.muxer.set(muxer);

                Ok((
                    HandlerSource::Muxed {
                        channel,
                        get_timeout: config.channel.get_timeout,
                    },
                    Some(events_rx),
                ))
            }
            SessionSource::Passthrough { url, .. } => {
                let url = UrlUtils::sanitize_upstream(url, config.upstream.url_sanitization)?;
                let client = build_upstream_client(config.upstream.connect_timeout)?;
                let upstream = PassthroughUpstream::new(
                    client,
                    url,
                    credentials,
                    config.upstream.passthrough_chunk_size,
                );

                let probe = tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        return Err(ProxyError::SessionFailed("stopped during probe".to_string()));
                    }
                    probe = tokio::time::timeout(config.server.ready_timeout, upstream.probe()) => probe,
                };
                match probe {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(ProxyError::NotReady(config.server.ready_timeout)),
                }
                inner.mark_ready();

                Ok((HandlerSource::Passthrough(upstream), None))
            }
        }
    }

    /// Wait for the readiness signal. A timeout fails and stops the session.
    pub async fn wait_ready(&self, timeout: Duration) -> ProxyResult<()> {
        let mut rx = self.inner.readiness.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|readiness| *readiness != Readiness::Pending)
                .await
                .map(|readiness| readiness.clone())
        })
        .await;

        let readiness = match waited {
            Ok(Ok(readiness)) => readiness,
            Ok(Err(_)) => Readiness::Failed("session dropped".to_string()),
            Err(_) => {
                warn!(
                    "Session not ready within {:?} session_id={}",
                    timeout, self.inner.id
                );
                self.inner
                    .fail(format!("proxy did not become ready within {timeout:?}"));
                self.stop().await;
                return Err(ProxyError::NotReady(timeout));
            }
        };

        match readiness {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(ProxyError::SessionFailed(reason)),
            Readiness::Pending => Err(ProxyError::NotReady(timeout)),
        }
    }

    /// Tear the session down. Returns `true` for the call that did the work;
    /// concurrent or later calls wait for it and return `false`.
    pub async fn stop(&self) -> bool {
        self.inner.stop().await
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.mode
    }

    pub fn port(&self) -> u16 {
        self.inner.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn output_url(&self) -> &str {
        &self.inner.output_url
    }

    /// Duration from the metadata API, preferred over the muxed container's own
    pub fn duration_ms(&self) -> Option<u64> {
        self.inner.duration_ms
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.readiness.borrow().clone()
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.inner.failure_reason()
    }

    /// Most recent muxer stderr lines
    pub fn diagnostics(&self) -> Vec<String> {
        self.inner
            .muxer
            .get()
            .map(|m| m.stderr_lines())
            .unwrap_or_default()
    }

    pub fn muxer_pid(&self) -> Option<u32> {
        self.inner.muxer.get().and_then(|m| m.pid())
    }

    pub fn stats(&self) -> SessionStats {
        let channel = self
            .inner
            .channel
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default();
        SessionStats {
            chunks_queued: channel.chunks_queued,
            chunks_dropped: channel.chunks_dropped,
            bytes_served: self.inner.bytes_served.load(Ordering::Relaxed),
            muxer_bytes_read: self.inner.muxer.get().map(|m| m.bytes_read()).unwrap_or(0),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        // Tasks, listener and muxer all follow the token
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` unless the session already reached a terminal state
    fn set_state(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!("Session state session_id={} state={}", self.id, next);
        }
        changed
    }

    fn mark_ready(&self) {
        self.readiness.send_if_modified(|readiness| {
            if *readiness != Readiness::Pending {
                return false;
            }
            *readiness = Readiness::Ready;
            true
        });
        if self.set_state(SessionState::Ready) {
            info!(
                "Session ready session_id={} url={}",
                self.id, self.output_url
            );
        }
    }

    fn failure_reason(&self) -> Option<String> {
        match self.failure.lock() {
            Ok(failure) => failure.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Record the first failure reason and move to `Failed`
    fn fail(&self, reason: String) {
        {
            let mut failure = match self.failure.lock() {
                Ok(failure) => failure,
                Err(poisoned) => poisoned.into_inner(),
            };
            if failure.is_none() {
                *failure = Some(reason.clone());
            }
        }
        self.readiness.send_if_modified(|readiness| {
            if *readiness != Readiness::Pending {
                return false;
            }
            *readiness = Readiness::Failed(reason.clone());
            true
        });
        if self.set_state(SessionState::Failed) {
            warn!("Session failed session_id={}: {}", self.id, reason);
        }
    }

    async fn stop(&self) -> bool {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return false;
        }
        *stopped = true;

        info!("Stopping session session_id={}", self.id);
        self.set_state(SessionState::Draining);
        self.cancel.cancel();

        if let Some(channel) = &self.channel {
            channel.close();
        }
        if let Some(muxer) = self.muxer.get() {
            muxer.shutdown().await;
        }

        let server = match self.server.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(server) = server {
            let abort = server.abort_handle();
            if tokio::time::timeout(self.shutdown_timeout, server).await.is_err() {
                warn!(
                    "Session server did not stop within {:?}, aborting session_id={}",
                    self.shutdown_timeout, self.id
                );
                abort.abort();
            }
        }

        self.readiness.send_if_modified(|readiness| {
            if *readiness != Readiness::Pending {
                return false;
            }
            *readiness = Readiness::Failed("stopped before ready".to_string());
            true
        });
        self.set_state(SessionState::Stopped);
        info!(
            "Session stopped session_id={} state={} port={}",
            self.id,
            self.state(),
            self.addr.port()
        );
        true
    }
}

enum Wake {
    Cancelled,
    Muxer(Option<MuxerEvent>),
    Client(Option<ClientEvent>),
    GraceExpired,
}

async fn next_event<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn supervise(
    inner: Arc<SessionInner>,
    mut muxer_rx: Option<mpsc::UnboundedReceiver<MuxerEvent>>,
    client_rx: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut client_rx = Some(client_rx);
    // Passthrough allows overlapping range requests, so clients are counted
    let mut active_clients: usize = 0;
    let mut warm_deadline: Option<Instant> = None;

    loop {
        let wake = tokio::select! {
            _ = inner.cancel.cancelled() => Wake::Cancelled,
            event = next_event(&mut muxer_rx) => Wake::Muxer(event),
            event = next_event(&mut client_rx) => Wake::Client(event),
            _ = sleep_until(warm_deadline), if warm_deadline.is_some() => Wake::GraceExpired,
        };

        match wake {
            Wake::Cancelled => break,
            Wake::Muxer(None) => muxer_rx = None,
            Wake::Client(None) => client_rx = None,
            Wake::GraceExpired => {
                info!(
                    "No client reconnected within grace period session_id={}",
                    inner.id
                );
                inner.stop().await;
                break;
            }
            Wake::Muxer(Some(event)) => match event {
                MuxerEvent::FirstOutput => {
                    inner.mark_ready();
                    if active_clients > 0 {
                        inner.set_state(SessionState::Serving);
                    }
                }
                MuxerEvent::Fatal(line) => {
                    inner.fail(format!("muxer reported a fatal error: {line}"));
                    inner.stop().await;
                    break;
                }
                MuxerEvent::StdoutEnded { bytes } => {
                    debug!(
                        "Muxer output ended session_id={} bytes={}",
                        inner.id, bytes
                    );
                }
                MuxerEvent::Exited(report) => {
                    if report.requested {
                        continue;
                    }
                    let produced = inner.muxer.get().map(|m| m.bytes_read()).unwrap_or(0);
                    if !report.success {
                        inner.fail(format!(
                            "muxer exited unexpectedly with code {:?}",
                            report.code
                        ));
                        inner.stop().await;
                        break;
                    }
                    if produced == 0 {
                        inner.fail("muxer exited without producing output".to_string());
                        inner.stop().await;
                        break;
                    }
                    info!(
                        "Muxer finished session_id={} bytes={}",
                        inner.id, produced
                    );
                }
            },
            Wake::Client(Some(event)) => match event {
                ClientEvent::Connected => {
                    active_clients += 1;
                    warm_deadline = None;
                    if inner.state() == SessionState::Ready {
                        inner.set_state(SessionState::Serving);
                    }
                }
                ClientEvent::Completed => {
                    active_clients = active_clients.saturating_sub(1);
                    if active_clients == 0 && inner.state() == SessionState::Serving {
                        inner.set_state(SessionState::Ready);
                    }
                }
                ClientEvent::Gone => {
                    active_clients = active_clients.saturating_sub(1);
                    if inner.mode == SessionMode::Passthrough {
                        // Players drop range requests while seeking
                        if active_clients == 0 && inner.state() == SessionState::Serving {
                            inner.set_state(SessionState::Ready);
                        }
                        continue;
                    }
                    match inner.policy {
                        DisconnectPolicy::Teardown => {
                            info!(
                                "Client disconnected, tearing down session_id={}",
                                inner.id
                            );
                            inner.stop().await;
                            break;
                        }
                        DisconnectPolicy::KeepWarm { grace } => {
                            info!(
                                "Client disconnected, keeping warm for {:?} session_id={}",
                                grace, inner.id
                            );
                            if inner.state() == SessionState::Serving {
                                inner.set_state(SessionState::Ready);
                            }
                            warm_deadline = Some(Instant::now() + grace);
                        }
                    }
                }
                ClientEvent::UpstreamRejected(status) => {
                    inner.fail(format!("upstream rejected request with status {status}"));
                    inner.stop().await;
                    break;
                }
            },
        }
    }
    debug!("Session supervisor exited session_id={}", inner.id);
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
