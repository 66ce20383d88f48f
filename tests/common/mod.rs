#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Response, StatusCode, header},
    routing::get,
};
use tokio::sync::watch;

use media_proxy::config::Config;
use media_proxy::models::{SessionSource, SessionState};

pub const VIDEO_URL: &str = "https://upstream.invalid/video.m4s?deadline=1&upsig=abc";
pub const AUDIO_URL: &str = "https://upstream.invalid/audio.m4s?deadline=1&upsig=def";

/// Write an executable `/bin/sh` script standing in for ffmpeg.
pub fn fake_muxer(dir: &tempfile::TempDir, body: &str) -> String {
    let path = dir.path().join("fake-ffmpeg.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// Defaults with timeouts short enough for tests
pub fn test_config(ffmpeg_command: &str) -> Config {
    let mut config = Config::default();
    config.muxer.ffmpeg_command = ffmpeg_command.to_string();
    config.muxer.read_block_size = 4096;
    config.muxer.graceful_stop_timeout = Duration::from_millis(300);
    config.muxer.kill_timeout = Duration::from_secs(2);
    config.muxer.reap_timeout = Duration::from_secs(2);
    config.channel.capacity = 16;
    config.channel.get_timeout = Duration::from_millis(50);
    config.channel.put_timeout = Duration::from_millis(200);
    config.server.ready_timeout = Duration::from_secs(5);
    config.server.shutdown_timeout = Duration::from_secs(2);
    config
}

pub fn muxed_source() -> SessionSource {
    SessionSource::Muxed {
        video_url: VIDEO_URL.to_string(),
        audio_url: AUDIO_URL.to_string(),
        duration_ms: Some(90_000),
    }
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<SessionState>,
    wanted: SessionState,
    within: Duration,
) {
    tokio::time::timeout(within, rx.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("state did not reach {wanted} within {within:?}"))
        .expect("session state channel closed");
}

pub fn port_is_closed(port: u16) -> bool {
    std::net::TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(200),
    )
    .is_err()
}

/// Running and not a zombie
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Headers of one request seen by the fake upstream
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub range: Option<String>,
    pub referer: Option<String>,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct FakeUpstream {
    pub base_url: String,
    pub content: Arc<Vec<u8>>,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// Status `/media.mp4` answers with instead of content; 0 serves normally
    pub reject_status: Arc<AtomicU16>,
    /// Chunks written by `/slow.mp4` so far
    pub slow_chunks_sent: Arc<AtomicUsize>,
    /// Set once a `/slow.mp4` body is dropped before its end
    pub slow_body_dropped: Arc<AtomicBool>,
}

impl FakeUpstream {
    pub fn media_url(&self) -> String {
        format!("{}/media.mp4", self.base_url)
    }

    pub fn slow_url(&self) -> String {
        format!("{}/slow.mp4", self.base_url)
    }

    pub fn forbidden_url(&self) -> String {
        format!("{}/forbidden.mp4", self.base_url)
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn start_rejecting(&self) {
        self.reject_with(StatusCode::FORBIDDEN);
    }

    pub fn reject_with(&self, status: StatusCode) {
        self.reject_status.store(status.as_u16(), Ordering::SeqCst);
    }
}

pub fn media_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serve `content` with byte-range support on an ephemeral loopback port.
pub async fn spawn_fake_upstream(content: Vec<u8>) -> FakeUpstream {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = FakeUpstream {
        base_url: format!("http://{addr}"),
        content: Arc::new(content),
        requests: Arc::new(Mutex::new(Vec::new())),
        reject_status: Arc::new(AtomicU16::new(0)),
        slow_chunks_sent: Arc::new(AtomicUsize::new(0)),
        slow_body_dropped: Arc::new(AtomicBool::new(false)),
    };

    let app = Router::new()
        .route("/media.mp4", get(serve_media))
        .route("/slow.mp4", get(serve_slow))
        .route("/forbidden.mp4", get(|| async { StatusCode::FORBIDDEN }))
        .with_state(upstream.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    upstream
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn serve_media(State(upstream): State<FakeUpstream>, headers: HeaderMap) -> Response<Body> {
    upstream.requests.lock().unwrap().push(RecordedRequest {
        range: header_string(&headers, header::RANGE),
        referer: header_string(&headers, header::REFERER),
        cookie: header_string(&headers, header::COOKIE),
        user_agent: header_string(&headers, header::USER_AGENT),
    });

    let reject = upstream.reject_status.load(Ordering::SeqCst);
    if reject != 0 {
        return Response::builder()
            .status(StatusCode::from_u16(reject).unwrap())
            .body(Body::empty())
            .unwrap();
    }

    let total = upstream.content.len();
    let range = header_string(&headers, header::RANGE).and_then(|r| parse_range(&r, total));
    match range {
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from(upstream.content.as_ref().clone()))
            .unwrap(),
        Some(Err(())) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{total}"))
            .body(Body::empty())
            .unwrap(),
        Some(Ok((start, end))) => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_LENGTH, end - start + 1)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}"),
            )
            .body(Body::from(upstream.content[start..=end].to_vec()))
            .unwrap(),
    }
}

pub const SLOW_CHUNK_LEN: usize = 16 * 1024;
pub const SLOW_CHUNKS: usize = 2000;

/// Flags the body as dropped unless it ran to the end
struct DropFlag {
    flag: Arc<AtomicBool>,
    finished: bool,
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        if !self.finished {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// A long body written a chunk every couple of milliseconds. The one-byte
/// readiness request is answered at once.
async fn serve_slow(State(upstream): State<FakeUpstream>, headers: HeaderMap) -> Response<Body> {
    if header_string(&headers, header::RANGE).as_deref() == Some("bytes=0-0") {
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes 0-0/{}", SLOW_CHUNK_LEN * SLOW_CHUNKS))
            .body(Body::from(vec![0u8]))
            .unwrap();
    }

    let flag = DropFlag {
        flag: upstream.slow_body_dropped.clone(),
        finished: false,
    };
    let sent = upstream.slow_chunks_sent.clone();
    let stream = futures::stream::unfold((0usize, flag), move |(index, mut flag)| {
        let sent = sent.clone();
        async move {
            if index == SLOW_CHUNKS {
                flag.finished = true;
                return None;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            sent.fetch_add(1, Ordering::SeqCst);
            let chunk = bytes::Bytes::from(vec![(index % 251) as u8; SLOW_CHUNK_LEN]);
            Some((Ok::<_, std::io::Error>(chunk), (index + 1, flag)))
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, SLOW_CHUNK_LEN * SLOW_CHUNKS)
        .body(Body::from_stream(stream))
        .unwrap()
}

/// `bytes=N-` or `bytes=N-M`; `Err` when unsatisfiable
fn parse_range(value: &str, total: usize) -> Option<Result<(usize, usize), ()>> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    if start >= total {
        return Some(Err(()));
    }
    let end = if end.is_empty() {
        total - 1
    } else {
        end.parse::<usize>().ok()?.min(total - 1)
    };
    if end < start {
        return Some(Err(()));
    }
    Some(Ok((start, end)))
}
