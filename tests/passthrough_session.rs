#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::StatusCode;

use media_proxy::config::Config;
use media_proxy::errors::ProxyError;
use media_proxy::models::{ContentId, ResolvedMedia, SessionMode, SessionSource, SessionState};
use media_proxy::services::{
    CredentialStore, SessionManager, SharedCredentials, StaticResolver, StreamSession,
};

use common::{SLOW_CHUNKS, port_is_closed, spawn_fake_upstream, wait_for_state};

const MEDIA_LEN: usize = 5000;

fn credentials() -> Arc<CredentialStore> {
    Arc::new(CredentialStore::from_cookie_header("SESSDATA=test"))
}

fn passthrough(url: String) -> SessionSource {
    SessionSource::Passthrough {
        url,
        duration_ms: Some(42_000),
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.server.ready_timeout = Duration::from_secs(5);
    config.server.shutdown_timeout = Duration::from_secs(2);
    config.upstream.passthrough_chunk_size = 1000;
    config
}

#[tokio::test]
async fn test_range_is_forwarded_verbatim() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();
    assert_eq!(session.mode(), SessionMode::Passthrough);
    assert_eq!(session.duration_ms(), Some(42_000));

    let response = reqwest::Client::new()
        .get(session.output_url())
        .header("Range", "bytes=1000-")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-range"], "bytes 1000-4999/5000");
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert_eq!(response.headers()["content-type"], "video/mp4");
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &upstream.content[1000..]);

    let recorded = upstream.recorded();
    // Readiness probe, then the client's request
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].range.as_deref(), Some("bytes=0-0"));
    assert_eq!(recorded[1].range.as_deref(), Some("bytes=1000-"));
    for request in &recorded {
        assert_eq!(request.referer.as_deref(), Some("https://www.bilibili.com/"));
        assert_eq!(request.cookie.as_deref(), Some("SESSDATA=test"));
        assert!(request.user_agent.as_deref().unwrap().contains("Chrome/91"));
    }

    assert!(session.stop().await);
}

#[tokio::test]
async fn test_request_without_range_gets_whole_body() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();

    let response = reqwest::get(session.output_url()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "5000");
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &upstream.content[..]);
    assert_eq!(upstream.recorded()[1].range, None);
    assert_eq!(session.stats().bytes_served, MEDIA_LEN as u64);

    session.stop().await;
}

#[tokio::test]
async fn test_unsatisfiable_range_is_passed_through() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .get(session.output_url())
        .header("Range", "bytes=9000-")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()["content-range"], "bytes */5000");
    assert_ne!(session.state(), SessionState::Failed);

    session.stop().await;
}

#[tokio::test]
async fn test_concurrent_range_requests_are_allowed() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let (head, tail) = tokio::join!(
        client
            .get(session.output_url())
            .header("Range", "bytes=0-99")
            .send(),
        client
            .get(session.output_url())
            .header("Range", "bytes=4900-")
            .send(),
    );
    let head = head.unwrap();
    let tail = tail.unwrap();
    assert_eq!(head.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(tail.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&head.bytes().await.unwrap()[..], &upstream.content[..100]);
    assert_eq!(&tail.bytes().await.unwrap()[..], &upstream.content[4900..]);

    session.stop().await;
}

#[tokio::test]
async fn test_expired_url_fails_the_session() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();
    let mut state = session.subscribe_state();

    upstream.start_rejecting();
    let response = reqwest::get(session.output_url()).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    wait_for_state(&mut state, SessionState::Failed, Duration::from_secs(5)).await;
    assert!(session.failure_reason().unwrap().contains("403"));
    session.stop().await;
    assert!(port_is_closed(session.port()));
}

/// The upstream starts refusing after the session is up
async fn assert_client_error_fails_session(status: StatusCode) {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();
    let mut state = session.subscribe_state();

    upstream.reject_with(status);
    let response = reqwest::get(session.output_url()).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    wait_for_state(&mut state, SessionState::Failed, Duration::from_secs(5)).await;
    assert!(
        session
            .failure_reason()
            .unwrap()
            .contains(&status.as_u16().to_string())
    );
    session.stop().await;
    assert!(port_is_closed(session.port()));
}

#[tokio::test]
async fn test_bad_request_fails_the_session() {
    assert_client_error_fails_session(StatusCode::BAD_REQUEST).await;
}

#[tokio::test]
async fn test_rate_limited_fails_the_session() {
    assert_client_error_fails_session(StatusCode::TOO_MANY_REQUESTS).await;
}

#[tokio::test]
async fn test_server_error_answers_500_and_keeps_the_session() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();

    upstream.reject_with(StatusCode::SERVICE_UNAVAILABLE);
    let response = reqwest::get(session.output_url()).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // No stream was handed out, so nobody is being served
    assert_eq!(session.state(), SessionState::Ready);
    session.stop().await;
}

#[tokio::test]
async fn test_finished_request_returns_session_to_ready() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.media_url()), credentials(), &config())
        .await
        .unwrap();
    let mut state = session.subscribe_state();

    let response = reqwest::get(session.output_url()).await.unwrap();
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), MEDIA_LEN);

    // Let the supervisor see the request start before checking it ended
    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_for_state(&mut state, SessionState::Ready, Duration::from_secs(5)).await;
    assert_eq!(session.stats().bytes_served, MEDIA_LEN as u64);
    session.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_aborts_upstream_request() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let session = StreamSession::open("av1", passthrough(upstream.slow_url()), credentials(), &config())
        .await
        .unwrap();
    let mut state = session.subscribe_state();

    let mut response = reqwest::get(session.output_url()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.chunk().await.unwrap().is_some());
    wait_for_state(&mut state, SessionState::Serving, Duration::from_secs(5)).await;
    drop(response);

    // The full body takes several seconds to write
    tokio::time::timeout(Duration::from_secs(3), async {
        while !upstream.slow_body_dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("upstream body kept streaming after the client left");
    let sent = upstream.slow_chunks_sent.load(Ordering::SeqCst);
    assert!(sent < SLOW_CHUNKS / 2, "upstream sent {sent} of {SLOW_CHUNKS} chunks");

    // A passthrough session outlives a dropped request
    wait_for_state(&mut state, SessionState::Ready, Duration::from_secs(5)).await;
    assert!(session.stop().await);
}

#[tokio::test]
async fn test_rejected_probe_fails_start() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let result =
        StreamSession::start("av1", passthrough(upstream.forbidden_url()), credentials(), &config())
            .await;
    assert!(matches!(
        result,
        Err(ProxyError::UpstreamStatus { status: 403, .. })
    ));
}

#[tokio::test]
async fn test_manager_opens_and_closes_passthrough_sessions() {
    let upstream = spawn_fake_upstream(common::media_bytes(MEDIA_LEN)).await;
    let manager = SessionManager::new(
        config(),
        Arc::new(StaticResolver::new(ResolvedMedia::combined(
            upstream.media_url(),
            Some(42_000),
        ))),
        Arc::new(SharedCredentials::new(CredentialStore::from_cookie_header(
            "SESSDATA=test",
        ))),
    );

    let content = ContentId::parse("BV1xx411c7mD").unwrap();
    let first = manager.open(&content).await.unwrap();
    assert_eq!(first.mode, SessionMode::Passthrough);
    assert_eq!(first.content_id, "BV1xx411c7mD");
    assert_eq!(first.duration_ms, Some(42_000));
    assert_eq!(manager.active_count().await, 1);

    // Reopening the same content replaces the previous session
    let second = manager.open(&content).await.unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(manager.active_count().await, 1);
    let first_port = url::Url::parse(&first.output_url).unwrap().port().unwrap();
    assert!(port_is_closed(first_port));

    let response = reqwest::get(&second.output_url).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(manager.close(&second.content_id).await);
    assert_eq!(manager.active_count().await, 0);
    manager.stop_all().await;
}
