//! Loopback HTTP handler
//!
//! Answers exactly one path. In muxed mode the body is drained from the
//! session's [`ChunkChannel`] and only one client may stream at a time; in
//! passthrough mode every request is forwarded upstream with its `Range`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Response, StatusCode, header},
    routing::any,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proxy::http_stream::{
    ForwardError, PassthroughUpstream, error_response, stream_response_builder,
};
use crate::services::chunk_channel::{ChunkChannel, Received};

/// Connection-level notifications sent to the owning session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    /// The client went away before the end of the stream
    Gone,
    /// The whole stream was delivered
    Completed,
    /// Upstream refused the signed URL during a passthrough request
    UpstreamRejected(u16),
}

#[derive(Debug)]
pub enum HandlerSource {
    Muxed {
        channel: Arc<ChunkChannel>,
        get_timeout: Duration,
    },
    Passthrough(PassthroughUpstream),
}

/// Immutable per-session state handed to the router
#[derive(Debug)]
pub struct HandlerContext {
    pub session_id: String,
    pub output_path: String,
    pub source: HandlerSource,
    pub cancel: CancellationToken,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub bytes_served: Arc<AtomicU64>,
    active_client: AtomicBool,
}

impl HandlerContext {
    pub fn new(
        session_id: String,
        output_path: String,
        source: HandlerSource,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ClientEvent>,
        bytes_served: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session_id,
            output_path,
            source,
            cancel,
            events,
            bytes_served,
            active_client: AtomicBool::new(false),
        }
    }
}

pub fn router(ctx: Arc<HandlerContext>) -> Router {
    let path = ctx.output_path.clone();
    Router::new()
        .route(&path, any(serve_output))
        .fallback(not_found)
        .with_state(ctx)
}

async fn not_found() -> Response<Body> {
    error_response(StatusCode::NOT_FOUND, "Not Found")
}

async fn serve_output(
    State(ctx): State<Arc<HandlerContext>>,
    method: Method,
    headers: HeaderMap,
) -> Response<Body> {
    if method != Method::GET {
        debug!(
            "Rejecting {} on output path session_id={}",
            method, ctx.session_id
        );
        return error_response(StatusCode::NOT_FOUND, "Not Found");
    }
    if ctx.cancel.is_cancelled() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Session stopping");
    }

    match &ctx.source {
        HandlerSource::Muxed {
            channel,
            get_timeout,
        } => serve_muxed(ctx.clone(), channel.clone(), *get_timeout),
        HandlerSource::Passthrough(upstream) => {
            serve_passthrough(ctx.clone(), upstream, &headers).await
        }
    }
}

fn serve_muxed(
    ctx: Arc<HandlerContext>,
    channel: Arc<ChunkChannel>,
    get_timeout: Duration,
) -> Response<Body> {
    if ctx.active_client.swap(true, Ordering::SeqCst) {
        warn!(
            "Rejecting second concurrent client session_id={}",
            ctx.session_id
        );
        return error_response(StatusCode::CONFLICT, "Stream already has a client");
    }

    info!("Client connected session_id={}", ctx.session_id);
    let _ = ctx.events.send(ClientEvent::Connected);

    let body = MuxedBody {
        guard: ClientGuard {
            ctx: ctx.clone(),
            exclusive: true,
            completed: false,
        },
        channel,
        get_timeout,
    };
    let stream = futures::stream::unfold(body, |mut body| async move {
        match body.next_chunk().await {
            Some(chunk) => Some((Ok::<Bytes, std::io::Error>(chunk), body)),
            None => None,
        }
    });

    stream_response_builder(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response")
        })
}

struct MuxedBody {
    guard: ClientGuard,
    channel: Arc<ChunkChannel>,
    get_timeout: Duration,
}

impl MuxedBody {
    /// Next chunk for the client, `None` once the response should end.
    ///
    /// Short `get` timeouts keep the loop responsive to cancellation; a
    /// client that disconnects causes the body (and this loop) to be dropped
    /// at its next write.
    async fn next_chunk(&mut self) -> Option<Bytes> {
        let ctx = self.guard.ctx.clone();
        loop {
            let received = tokio::select! {
                _ = ctx.cancel.cancelled() => return None,
                received = self.channel.get(self.get_timeout) => received,
            };
            match received {
                Received::Chunk(chunk) => {
                    ctx.bytes_served
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    return Some(chunk);
                }
                Received::TimedOut => continue,
                Received::EndOfStream => {
                    self.guard.completed = true;
                    return None;
                }
                Received::Closed => return None,
            }
        }
    }
}

/// Reports how a connection ended, releasing the single-client slot when
/// it holds one
struct ClientGuard {
    ctx: Arc<HandlerContext>,
    exclusive: bool,
    completed: bool,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if self.exclusive {
            self.ctx.active_client.store(false, Ordering::SeqCst);
        }
        if self.completed {
            info!("Stream completed session_id={}", self.ctx.session_id);
            let _ = self.ctx.events.send(ClientEvent::Completed);
        } else if !self.ctx.cancel.is_cancelled() {
            info!("Client disconnected session_id={}", self.ctx.session_id);
            let _ = self.ctx.events.send(ClientEvent::Gone);
        }
    }
}

async fn serve_passthrough(
    ctx: Arc<HandlerContext>,
    upstream: &PassthroughUpstream,
    headers: &HeaderMap,
) -> Response<Body> {
    match upstream
        .forward(headers, ctx.cancel.clone(), ctx.bytes_served.clone())
        .await
    {
        Ok(response) => {
            debug!("Passthrough client connected session_id={}", ctx.session_id);
            let _ = ctx.events.send(ClientEvent::Connected);
            track_body(ctx, response)
        }
        Err(ForwardError::Rejected(status)) => {
            let _ = ctx.events.send(ClientEvent::UpstreamRejected(status.as_u16()));
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Upstream rejected request")
        }
        Err(ForwardError::Status(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Upstream error status")
        }
        Err(ForwardError::Connect(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to connect to upstream")
        }
    }
}

/// Wrap a forwarded body so its end (or early drop) reaches the session
fn track_body(ctx: Arc<HandlerContext>, response: Response<Body>) -> Response<Body> {
    let (parts, body) = response.into_parts();
    let guard = ClientGuard {
        ctx,
        exclusive: false,
        completed: false,
    };
    let stream = futures::stream::unfold(
        (body.into_data_stream(), guard),
        |(mut data, mut guard)| async move {
            match data.next().await {
                Some(chunk) => Some((chunk, (data, guard))),
                None => {
                    guard.completed = true;
                    None
                }
            }
        },
    );
    Response::from_parts(parts, Body::from_stream(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn muxed_context(channel: Arc<ChunkChannel>) -> (Arc<HandlerContext>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(HandlerContext::new(
            "test".to_string(),
            "/video.mp4".to_string(),
            HandlerSource::Muxed {
                channel,
                get_timeout: Duration::from_millis(20),
            },
            CancellationToken::new(),
            tx,
            Arc::new(AtomicU64::new(0)),
        ));
        (ctx, rx)
    }

    fn passthrough_context(url: &str) -> (Arc<HandlerContext>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client =
            crate::proxy::http_stream::build_upstream_client(Duration::from_millis(500)).unwrap();
        let credentials = crate::services::credential_store::CredentialStore::from_cookie_header("");
        let ctx = Arc::new(HandlerContext::new(
            "test".to_string(),
            "/video.mp4".to_string(),
            HandlerSource::Passthrough(PassthroughUpstream::new(
                client,
                url.to_string(),
                &credentials,
                1024,
            )),
            CancellationToken::new(),
            tx,
            Arc::new(AtomicU64::new(0)),
        ));
        (ctx, rx)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_other_paths_and_methods_are_not_found() {
        let (ctx, _rx) = muxed_context(Arc::new(ChunkChannel::new(4)));
        let app = router(ctx);

        let response = app.clone().oneshot(get("/other.mp4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let post = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/video.mp4")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(post).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let head = axum::http::Request::builder()
            .method(Method::HEAD)
            .uri("/video.mp4")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(head).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_muxed_streams_channel_in_order() {
        let channel = Arc::new(ChunkChannel::new(4));
        let (ctx, mut rx) = muxed_context(channel.clone());
        let app = router(ctx.clone());

        for part in [&b"ftyp"[..], b"moov", b"moof"] {
            channel
                .put(Bytes::copy_from_slice(part), Duration::from_millis(50))
                .await;
        }
        channel.finish();

        let response = app.oneshot(get("/video.mp4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ftypmoovmoof");
        assert_eq!(ctx.bytes_served.load(Ordering::Relaxed), 12);

        assert_eq!(rx.recv().await, Some(ClientEvent::Connected));
        assert_eq!(rx.recv().await, Some(ClientEvent::Completed));
    }

    #[tokio::test]
    async fn test_second_client_conflicts_until_first_leaves() {
        let channel = Arc::new(ChunkChannel::new(4));
        let (ctx, mut rx) = muxed_context(channel);
        let app = router(ctx);

        let first = app.clone().oneshot(get("/video.mp4")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(get("/video.mp4")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        drop(first);
        assert_eq!(rx.recv().await, Some(ClientEvent::Connected));
        assert_eq!(rx.recv().await, Some(ClientEvent::Gone));

        let third = app.oneshot(get("/video.mp4")).await.unwrap();
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_does_not_count_as_a_client() {
        // Nothing listens on the discard port
        let (ctx, mut rx) = passthrough_context("http://127.0.0.1:9/media.mp4");
        let app = router(ctx.clone());

        let response = app.oneshot(get("/video.mp4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        drop(response);
        drop(ctx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_tracked_body_reports_completion_and_early_drop() {
        let (ctx, mut rx) = passthrough_context("http://127.0.0.1:9/media.mp4");

        let whole = track_body(ctx.clone(), Response::new(Body::from("abcdef")));
        let body = axum::body::to_bytes(whole.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"abcdef");
        assert_eq!(rx.recv().await, Some(ClientEvent::Completed));

        let parts = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]);
        let partial = track_body(ctx.clone(), Response::new(Body::from_stream(parts)));
        let mut data = partial.into_body().into_data_stream();
        assert_eq!(data.next().await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        drop(data);
        assert_eq!(rx.recv().await, Some(ClientEvent::Gone));
        assert!(!ctx.active_client.load(Ordering::SeqCst));
    }
}
