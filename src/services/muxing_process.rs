//! External muxer process
//!
//! One `MuxingProcess` owns one ffmpeg child and three tasks:
//! - the stdout reader, which moves output blocks into the [`ChunkChannel`]
//!   and marks the end of stream when stdout closes,
//! - the stderr reader, which fills the diagnostic ring and reports the first
//!   fatal line without waiting for the process to exit,
//! - the supervisor, which owns the `Child`, reaps it after stdout closes and
//!   performs the graceful-then-forced stop.
//!
//! Everything observable is reported as [`MuxerEvent`]s.

use bytes::Bytes;
use futures::StreamExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{ProxyError, ProxyResult};
use crate::services::chunk_channel::{ChunkChannel, PutResult};
use crate::services::stderr_log::{FatalMarkers, LineClass, StderrLog};

const MAX_STDERR_LINE: usize = 4096;
const QUIT_COMMAND: &[u8] = b"q\n";
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Notifications from a running muxer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerEvent {
    /// The first output block was queued
    FirstOutput,
    /// A stderr line matched a fatal marker
    Fatal(String),
    /// stdout closed after `bytes` bytes
    StdoutEnded { bytes: u64 },
    Exited(ExitReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub success: bool,
    pub code: Option<i32>,
    /// The exit followed a stop request
    pub requested: bool,
}

impl ExitReport {
    fn from_status(status: std::io::Result<ExitStatus>, requested: bool) -> Self {
        match status {
            Ok(status) => Self {
                success: status.success(),
                code: status.code(),
                requested,
            },
            Err(e) => {
                warn!("Failed to collect muxer exit status: {}", e);
                Self {
                    success: false,
                    code: None,
                    requested,
                }
            }
        }
    }
}

/// Everything needed to run the muxer apart from its arguments
#[derive(Debug, Clone)]
pub struct MuxerOptions {
    /// Used as the `session_id` log field
    pub label: String,
    pub command: String,
    pub read_block_size: usize,
    pub put_timeout: Duration,
    pub stderr_log_lines: usize,
    pub fatal_markers: Vec<String>,
    pub graceful_stop_timeout: Duration,
    pub kill_timeout: Duration,
    pub reap_timeout: Duration,
}

impl MuxerOptions {
    pub fn from_config(label: impl Into<String>, config: &Config) -> Self {
        Self {
            label: label.into(),
            command: config.muxer.ffmpeg_command.clone(),
            read_block_size: config.muxer.read_block_size,
            put_timeout: config.channel.put_timeout,
            stderr_log_lines: config.muxer.stderr_log_lines,
            fatal_markers: config.muxer.fatal_markers.clone(),
            graceful_stop_timeout: config.muxer.graceful_stop_timeout,
            kill_timeout: config.muxer.kill_timeout,
            reap_timeout: config.muxer.reap_timeout,
        }
    }
}

pub struct MuxingProcess {
    label: String,
    pid: Option<u32>,
    stderr_log: Arc<StderrLog>,
    bytes_read: Arc<AtomicU64>,
    exit: Arc<OnceLock<ExitReport>>,
    shutdown: CancellationToken,
    tasks: Mutex<Option<MuxerTasks>>,
}

struct MuxerTasks {
    supervisor: JoinHandle<()>,
    stdout_reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
}

impl MuxingProcess {
    /// Spawn the muxer and its reader and supervisor tasks.
    ///
    /// `shutdown` stops everything when cancelled; pass a child of the owning
    /// session's token.
    pub fn spawn(
        options: MuxerOptions,
        args: Vec<String>,
        channel: Arc<ChunkChannel>,
        events: mpsc::UnboundedSender<MuxerEvent>,
        shutdown: CancellationToken,
    ) -> ProxyResult<Self> {
        let markers = FatalMarkers::new(&options.fatal_markers)?;

        let mut cmd = TokioCommand::new(&options.command);
        cmd.args(&args);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ProxyError::Spawn {
            command: options.command.clone(),
            source,
        })?;
        let pid = child.id();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(ProxyError::Spawn {
                command: options.command.clone(),
                source: std::io::Error::other("stdio was not captured"),
            });
        };
        let stdin = child.stdin.take();

        info!(
            "Started FFmpeg process session_id={} pid={:?} args={}",
            options.label,
            pid,
            args.len()
        );

        let stderr_log = Arc::new(StderrLog::new(options.stderr_log_lines));
        let bytes_read = Arc::new(AtomicU64::new(0));
        let exit = Arc::new(OnceLock::new());
        let (stdout_done_tx, stdout_done_rx) = oneshot::channel();

        let stdout_reader = tokio::spawn(read_stdout(
            StdoutReader {
                label: options.label.clone(),
                block_size: options.read_block_size.max(1),
                put_timeout: options.put_timeout,
                channel,
                events: events.clone(),
                bytes_read: bytes_read.clone(),
                shutdown: shutdown.clone(),
            },
            stdout,
            stdout_done_tx,
        ));

        let stderr_reader = tokio::spawn(read_stderr(
            options.label.clone(),
            stderr,
            markers,
            stderr_log.clone(),
            events.clone(),
            shutdown.clone(),
        ));

        let supervisor = tokio::spawn(supervise(
            options.clone(),
            child,
            stdin,
            stdout_done_rx,
            events,
            exit.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            label: options.label,
            pid,
            stderr_log,
            bytes_read,
            exit,
            shutdown,
            tasks: Mutex::new(Some(MuxerTasks {
                supervisor,
                stdout_reader,
                stderr_reader,
            })),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_log.snapshot()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit.get().cloned()
    }

    /// Stop the process and join every task. Safe to call repeatedly; only the
    /// first call does any work, later calls wait for nothing and return the
    /// recorded exit.
    pub async fn shutdown(&self) -> Option<ExitReport> {
        self.shutdown.cancel();

        let tasks = self.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            if let Err(e) = tasks.supervisor.await {
                error!("Muxer supervisor task failed session_id={}: {}", self.label, e);
            }
            for reader in [tasks.stdout_reader, tasks.stderr_reader] {
                let abort = reader.abort_handle();
                if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
                    warn!("Muxer reader did not stop in time session_id={}", self.label);
                    abort.abort();
                }
            }
            debug!("Muxer tasks joined session_id={}", self.label);
        }

        self.exit_report()
    }
}

impl std::fmt::Debug for MuxingProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxingProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("bytes_read", &self.bytes_read())
            .field("exit", &self.exit.get())
            .finish()
    }
}

struct StdoutReader {
    label: String,
    block_size: usize,
    put_timeout: Duration,
    channel: Arc<ChunkChannel>,
    events: mpsc::UnboundedSender<MuxerEvent>,
    bytes_read: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

async fn read_stdout(
    reader: StdoutReader,
    mut stdout: ChildStdout,
    done: oneshot::Sender<()>,
) {
    let mut buffer = vec![0u8; reader.block_size];
    let mut first_output = true;
    let mut dropped: u64 = 0;

    let reached_eof = loop {
        let read = tokio::select! {
            _ = reader.shutdown.cancelled() => break false,
            read = stdout.read(&mut buffer) => read,
        };

        let n = match read {
            Ok(0) => break true,
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "Error reading FFmpeg stdout session_id={}: {}",
                    reader.label, e
                );
                break true;
            }
        };
        reader.bytes_read.fetch_add(n as u64, Ordering::Relaxed);

        let chunk = Bytes::copy_from_slice(&buffer[..n]);
        let put = tokio::select! {
            _ = reader.shutdown.cancelled() => break false,
            put = reader.channel.put(chunk, reader.put_timeout) => put,
        };
        match put {
            PutResult::Queued => {
                if first_output {
                    first_output = false;
                    let _ = reader.events.send(MuxerEvent::FirstOutput);
                }
            }
            PutResult::TimedOut => {
                dropped += 1;
                warn!(
                    "Consumer stalled, dropped {} byte block session_id={} dropped_total={}",
                    n, reader.label, dropped
                );
            }
            PutResult::Closed => break false,
        }
    };

    let total = reader.bytes_read.load(Ordering::Relaxed);
    if reached_eof {
        reader.channel.finish();
        info!(
            "FFmpeg stdout ended session_id={} bytes={}",
            reader.label, total
        );
        let _ = reader.events.send(MuxerEvent::StdoutEnded { bytes: total });
    } else {
        debug!(
            "FFmpeg stdout reader stopped session_id={} bytes={}",
            reader.label, total
        );
    }
    let _ = done.send(());
}

async fn read_stderr(
    label: String,
    stderr: ChildStderr,
    markers: FatalMarkers,
    log: Arc<StderrLog>,
    events: mpsc::UnboundedSender<MuxerEvent>,
    shutdown: CancellationToken,
) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_STDERR_LINE));
    let mut reported = false;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next() => next,
        };
        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                debug!("Discarding overlong FFmpeg stderr line session_id={}", label);
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!("FFmpeg stderr read error session_id={}: {}", label, e);
                break;
            }
            None => break,
        };

        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        match markers.classify(&line) {
            LineClass::Fatal => {
                warn!("FFmpeg session_id={} fatal: {}", label, line);
                if !reported {
                    reported = true;
                    let _ = events.send(MuxerEvent::Fatal(line.clone()));
                }
            }
            LineClass::Info => debug!("FFmpeg session_id={}: {}", label, line),
        }
        log.push(line);
    }
}

enum Trigger {
    Exited(std::io::Result<ExitStatus>),
    Stop,
    StdoutClosed,
}

async fn supervise(
    options: MuxerOptions,
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    mut stdout_done: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<MuxerEvent>,
    exit: Arc<OnceLock<ExitReport>>,
    shutdown: CancellationToken,
) {
    let trigger = tokio::select! {
        status = child.wait() => Trigger::Exited(status),
        _ = shutdown.cancelled() => Trigger::Stop,
        _ = &mut stdout_done => Trigger::StdoutClosed,
    };

    let report = match trigger {
        Trigger::Exited(status) => {
            // Output written before the exit is still in the pipe
            tokio::select! {
                _ = tokio::time::timeout(options.reap_timeout, &mut stdout_done) => {}
                _ = shutdown.cancelled() => {}
            }
            ExitReport::from_status(status, false)
        }
        Trigger::Stop => {
            let status = terminate(&options, &mut child, stdin.take()).await;
            ExitReport::from_status(status, true)
        }
        Trigger::StdoutClosed => {
            let reaped = tokio::select! {
                reaped = tokio::time::timeout(options.reap_timeout, child.wait()) => Some(reaped),
                _ = shutdown.cancelled() => None,
            };
            match reaped {
                Some(Ok(status)) => ExitReport::from_status(status, false),
                Some(Err(_)) => {
                    warn!(
                        "FFmpeg did not exit {:?} after stdout closed, killing session_id={}",
                        options.reap_timeout, options.label
                    );
                    let status = force_kill(&options, &mut child).await;
                    ExitReport::from_status(status, false)
                }
                None => {
                    let status = terminate(&options, &mut child, stdin.take()).await;
                    ExitReport::from_status(status, true)
                }
            }
        }
    };

    if report.success || report.requested {
        info!(
            "FFmpeg process exited session_id={} code={:?} requested={}",
            options.label, report.code, report.requested
        );
    } else {
        warn!(
            "FFmpeg process exited unexpectedly session_id={} code={:?}",
            options.label, report.code
        );
    }
    let _ = exit.set(report.clone());
    let _ = events.send(MuxerEvent::Exited(report));
}

/// Ask ffmpeg to quit through its interactive `q` command, then kill it.
async fn terminate(
    options: &MuxerOptions,
    child: &mut Child,
    stdin: Option<ChildStdin>,
) -> std::io::Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }

    if let Some(mut stdin) = stdin {
        let asked = tokio::time::timeout(options.graceful_stop_timeout, async {
            stdin.write_all(QUIT_COMMAND).await?;
            stdin.flush().await
        })
        .await;
        drop(stdin);

        if matches!(asked, Ok(Ok(()))) {
            debug!("Sent quit to FFmpeg session_id={}", options.label);
            if let Ok(status) = tokio::time::timeout(options.graceful_stop_timeout, child.wait()).await
            {
                return status;
            }
        }
    }

    force_kill(options, child).await
}

async fn force_kill(options: &MuxerOptions, child: &mut Child) -> std::io::Result<ExitStatus> {
    debug!("Killing FFmpeg session_id={}", options.label);
    if let Err(e) = child.start_kill() {
        // Already reaped or gone
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(status);
        }
        return Err(e);
    }
    match tokio::time::timeout(options.kill_timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            error!(
                "FFmpeg did not exit {:?} after kill session_id={}",
                options.kill_timeout, options.label
            );
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "muxer did not exit after kill",
            ))
        }
    }
}
