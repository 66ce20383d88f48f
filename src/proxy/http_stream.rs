//! Upstream HTTP streaming for passthrough sessions.
//!
//! Key behaviors:
//!   - No total request timeout (media bodies stay open for as long as the
//!     player reads); only a connect timeout.
//!   - Credential headers (User-Agent, Referer, Origin, Cookie) on every request.
//!   - The client's `Range` header is forwarded verbatim.
//!   - Upstream frames are re-split to at most `chunk_size` bytes.
//!   - Dropping the response body (client gone) or cancelling the session
//!     drops the upstream request instead of draining it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ProxyError, ProxyResult};
use crate::services::credential_store::CredentialStore;
use crate::utils::url::UrlUtils;

/// Build the shared upstream client.
pub fn build_upstream_client(connect_timeout: Duration) -> ProxyResult<Client> {
    Ok(Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(8)
        .build()?)
}

/// Allow-listed credential headers as a reqwest header map
pub fn credential_headers(credentials: &CredentialStore) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in credentials.request_headers().iter() {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Any 4xx but `416`: the signed URL expired or was refused, and asking
/// again with the same URL will not help
pub fn is_rejection(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::RANGE_NOT_SATISFIABLE
}

/// Why a passthrough request produced no stream
#[derive(Debug)]
pub enum ForwardError {
    /// Upstream answered 4xx (other than 416)
    Rejected(StatusCode),
    /// Upstream answered with some other non-success status, such as 5xx
    Status(StatusCode),
    Connect(reqwest::Error),
}

/// One combined upstream URL and the headers needed to fetch it
#[derive(Debug, Clone)]
pub struct PassthroughUpstream {
    client: Client,
    url: String,
    headers: reqwest::header::HeaderMap,
    chunk_size: usize,
}

impl PassthroughUpstream {
    pub fn new(client: Client, url: String, credentials: &CredentialStore, chunk_size: usize) -> Self {
        Self {
            client,
            url,
            headers: credential_headers(credentials),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, range: Option<&HeaderValue>) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.get(&self.url).headers(self.headers.clone());
        if let Some(range) = range {
            request = request.header(header::RANGE, range.clone());
        }
        request.send().await
    }

    /// Check the URL is reachable by asking for its first byte.
    pub async fn probe(&self) -> ProxyResult<StatusCode> {
        let response = self
            .send(Some(&HeaderValue::from_static("bytes=0-0")))
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!(
                "Upstream probe ok status={} url={}",
                status,
                UrlUtils::redact(&self.url)
            );
            Ok(status)
        } else {
            Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
                url: UrlUtils::redact(&self.url),
            })
        }
    }

    /// Forward one client request upstream and wrap the upstream body.
    ///
    /// A `416` from upstream is passed through as a complete response.
    pub async fn forward(
        &self,
        request_headers: &HeaderMap,
        cancel: CancellationToken,
        bytes_served: Arc<AtomicU64>,
    ) -> Result<Response<Body>, ForwardError> {
        let range = request_headers.get(header::RANGE);
        let upstream = self.send(range).await.map_err(|e| {
            error!(
                "Failed to connect to upstream {}: {}",
                UrlUtils::redact(&self.url),
                e
            );
            ForwardError::Connect(e)
        })?;

        let status = upstream.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("Upstream rejected range {:?}", range);
            let mut builder = stream_response_builder(status);
            if let Some(content_range) = upstream.headers().get(header::CONTENT_RANGE) {
                builder = builder.header(header::CONTENT_RANGE, content_range.clone());
            }
            return Ok(builder
                .body(Body::empty())
                .unwrap_or_else(|_| error_response(status, "range not satisfiable")));
        }
        if !status.is_success() {
            warn!(
                "Upstream responded with error status {} for {}",
                status,
                UrlUtils::redact(&self.url)
            );
            return Err(if is_rejection(status) {
                ForwardError::Rejected(status)
            } else {
                ForwardError::Status(status)
            });
        }

        let upstream_headers = upstream.headers().clone();
        let mut builder = stream_response_builder(status)
            .header(
                header::CONTENT_TYPE,
                upstream_headers
                    .get(header::CONTENT_TYPE)
                    .cloned()
                    .unwrap_or_else(|| HeaderValue::from_static("video/mp4")),
            )
            .header(header::ACCEPT_RANGES, "bytes");
        for name in [header::CONTENT_LENGTH, header::CONTENT_RANGE] {
            if let Some(value) = upstream_headers.get(&name) {
                builder = builder.header(name, value.clone());
            }
        }

        debug!(
            "Upstream accepted status={} range={:?} cl={:?}",
            status,
            range,
            upstream_headers.get(header::CONTENT_LENGTH)
        );

        let body = rechunk(upstream.bytes_stream(), self.chunk_size)
            .take_until(cancel.cancelled_owned())
            .inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    bytes_served.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
            });

        info!(
            "Passthrough stream established status={} url={}",
            status,
            UrlUtils::redact(&self.url)
        );
        Ok(builder
            .body(Body::from_stream(body))
            .unwrap_or_else(|_| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response")
            }))
    }
}

/// Split upstream frames so no emitted chunk exceeds `max` bytes.
pub fn rechunk<S>(stream: S, max: usize) -> impl Stream<Item = Result<Bytes, std::io::Error>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    let max = max.max(1);
    stream.flat_map(move |frame| {
        let pieces: Vec<Result<Bytes, std::io::Error>> = match frame {
            Ok(frame) => split_frame(frame, max).into_iter().map(Ok).collect(),
            Err(e) => vec![Err(std::io::Error::other(e))],
        };
        futures::stream::iter(pieces)
    })
}

fn split_frame(mut frame: Bytes, max: usize) -> Vec<Bytes> {
    let mut pieces = Vec::with_capacity(frame.len() / max + 1);
    while frame.len() > max {
        pieces.push(frame.split_to(max));
    }
    if !frame.is_empty() {
        pieces.push(frame);
    }
    pieces
}

/// Headers shared by every media response
pub fn stream_response_builder(status: StatusCode) -> axum::http::response::Builder {
    Response::builder()
        .status(status)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET")
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Range, Accept",
        )
        .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, "*")
}

/// Simple helper to construct a uniform error response.
pub fn error_response(status: StatusCode, msg: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(msg.to_string()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
