//! Bounded chunk channel between the muxer and the HTTP handler
//!
//! A FIFO of byte chunks with a fixed capacity counted in chunks. The
//! producer (the muxer's stdout reader) uses a timeout-bounded `put` and
//! drops the chunk when the consumer cannot keep up; the consumer (the
//! HTTP response body) polls with a short `get` timeout so it can notice
//! cancellation. The end of the stream is marked exactly once with
//! [`ChunkChannel::finish`]; [`ChunkChannel::close`] stops producers but
//! lets consumers drain what is already buffered.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Outcome of [`ChunkChannel::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    Queued,
    /// The channel stayed full for the whole timeout; the chunk was dropped
    TimedOut,
    /// The channel is closed or finished; the chunk was discarded
    Closed,
}

/// Outcome of [`ChunkChannel::get`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Chunk(Bytes),
    /// The producer finished and every buffered chunk has been delivered
    EndOfStream,
    /// The channel was closed and every buffered chunk has been delivered
    Closed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub chunks_queued: u64,
    pub chunks_dropped: u64,
    pub chunks_delivered: u64,
    pub bytes_delivered: u64,
    /// Highest number of chunks held at once
    pub high_water: usize,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Bytes>,
    buffered_bytes: usize,
    finished: bool,
    closed: bool,
    stats: ChannelStats,
}

#[derive(Debug)]
pub struct ChunkChannel {
    capacity: usize,
    state: Mutex<State>,
    data_ready: Notify,
    space_ready: Notify,
}

impl ChunkChannel {
    /// Create a channel holding at most `capacity` chunks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a chunk, waiting at most `timeout` for free space.
    pub async fn put(&self, chunk: Bytes, timeout: Duration) -> PutResult {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed || state.finished {
                    return PutResult::Closed;
                }
                if state.queue.len() < self.capacity {
                    state.buffered_bytes += chunk.len();
                    state.queue.push_back(chunk);
                    state.stats.chunks_queued += 1;
                    state.stats.high_water = state.stats.high_water.max(state.queue.len());
                    drop(state);
                    self.data_ready.notify_waiters();
                    return PutResult::Queued;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.lock();
                if state.closed || state.finished {
                    return PutResult::Closed;
                }
                state.stats.chunks_dropped += 1;
                trace!(
                    "Chunk channel full for {:?}, dropping {} bytes",
                    timeout,
                    chunk.len()
                );
                return PutResult::TimedOut;
            }
        }
    }

    /// Dequeue the next chunk, waiting at most `timeout` for one to arrive.
    ///
    /// Buffered chunks are always delivered before `EndOfStream` or `Closed`.
    pub async fn get(&self, timeout: Duration) -> Received {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(chunk) = state.queue.pop_front() {
                    state.buffered_bytes -= chunk.len();
                    state.stats.chunks_delivered += 1;
                    state.stats.bytes_delivered += chunk.len() as u64;
                    drop(state);
                    self.space_ready.notify_waiters();
                    return Received::Chunk(chunk);
                }
                if state.finished {
                    return Received::EndOfStream;
                }
                if state.closed {
                    return Received::Closed;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Received::TimedOut;
            }
        }
    }

    /// Mark the end of the stream. Only the first call has any effect.
    pub fn finish(&self) -> bool {
        let mut state = self.lock();
        if state.finished || state.closed {
            return false;
        }
        state.finished = true;
        drop(state);
        self.data_ready.notify_waiters();
        self.space_ready.notify_waiters();
        true
    }

    /// Refuse further puts and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.data_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.lock().buffered_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn stats(&self) -> ChannelStats {
        self.lock().stats
    }
}
