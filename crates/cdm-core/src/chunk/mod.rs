//! Chunk: one contiguous byte range of a download and its write pipeline.
//!
//! Lifecycle is `Idle → Opening → Writing ⇄ Suspended → Closing → Closed`; a chunk
//! is opened at most once, a new transfer session needs [`Chunk::clone_for_resume`].
//!
//! Byte accounting: `written` counts bytes admitted by the bucket hierarchy.
//! Bytes the connection delivered beyond the granted amount are still taken
//! (nothing is ever dropped); they are owed as `pending_tokens` and the chunk
//! stays suspended until [`Chunk::run`] has acquired them. Bytes the sink could
//! not take yet wait in the overflow buffer.

mod sink;


pub use sink::{ChunkSink, ChunkStorage, StorageFactory};

use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use crate::bucket::ByteBucketTee;
use crate::memory::MemoryReporter;

/// Size of one pipe segment between a chunk and the disk writer.
pub const PIPE_SEGMENT_SIZE: u64 = 64 * 1024;
/// Number of segments a chunk pipe may hold.
pub const MAX_PIPE_SEGMENTS: u64 = 16;
/// Bytes given up on an interrupted close, covering data accepted but not provably flushed.
pub const SAFETY_MARGIN: u64 = 2048;
/// Upper bound for the randomized delay before a suspended chunk retries.
pub const MAX_RESUME_JITTER_MS: u64 = 150;

/// Longest one close (or one batch of closes sharing a budget) waits for the sink.
pub const CLOSE_WAIT_BUDGET: Duration = Duration::from_millis(600);

const DRAIN_ATTEMPTS: u32 = 20;
const DRAIN_BACKOFF_CAP: Duration = Duration::from_millis(32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Idle,
    Opening,
    Writing,
    Suspended,
    Closing,
    Closed,
}

/// Result of offering bytes to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// This many bytes of the input were consumed.
    Accepted(usize),
    /// Chunk is suspended; the caller must stop delivering until [`Chunk::run`] resumes it.
    WouldBlock,
    /// Bounded range is complete, no more bytes wanted.
    Finished,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk was already opened once; clone it to transfer again")]
    Recycled,
    #[error("write on a chunk that is not open")]
    NotOpen,
    #[error("cannot merge chunks: {0}")]
    Merge(&'static str),
    #[error("invalid chunk range: {0}")]
    Range(String),
    #[error("chunk write failed: {0}")]
    Io(#[from] io::Error),
}

impl ChunkError {
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ChunkError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

pub struct Chunk {
    start: u64,
    /// Inclusive end; `None` for the unbounded starter chunk.
    end: Option<u64>,
    written: u64,
    session_bytes: u64,
    safe_bytes: u64,
    start_bytes: u64,
    state: ChunkState,
    running: bool,
    errored: bool,
    canceled: bool,
    was_opened: bool,
    sink: Option<Box<dyn ChunkSink>>,
    overflow: VecDeque<u8>,
    pending_tokens: u64,
    resume_at: Option<Instant>,
    buckets: Option<ByteBucketTee>,
    memory: Option<MemoryReporter>,
    last_progress: Option<Instant>,
}

impl Chunk {
    /// Chunk covering `[start, end]` with `written` bytes already on disk.
    pub fn new(start: u64, end: Option<u64>, written: u64) -> Result<Self, ChunkError> {
        if let Some(e) = end {
            if e < start {
                return Err(ChunkError::Range(format!("end {e} before start {start}")));
            }
            if written > e - start + 1 {
                return Err(ChunkError::Range(format!(
                    "written {written} exceeds range {start}-{e}"
                )));
            }
        }
        let mut c = Self::blank(start);
        c.end = end;
        c.written = written;
        c.safe_bytes = written;
        c.start_bytes = written;
        Ok(c)
    }

    /// Unbounded chunk at offset 0 whose first response discovers the total size.
    pub fn starter() -> Self {
        Self::blank(0)
    }

    fn blank(start: u64) -> Self {
        Self {
            start,
            end: None,
            written: 0,
            session_bytes: 0,
            safe_bytes: 0,
            start_bytes: 0,
            state: ChunkState::Idle,
            running: false,
            errored: false,
            canceled: false,
            was_opened: false,
            sink: None,
            overflow: VecDeque::new(),
            pending_tokens: 0,
            resume_at: None,
            buckets: None,
            memory: None,
            last_progress: None,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    pub fn is_starter(&self) -> bool {
        self.end.is_none()
    }

    pub fn total(&self) -> Option<u64> {
        self.end.map(|e| e - self.start + 1)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn session_bytes(&self) -> u64 {
        self.session_bytes
    }

    pub fn safe_bytes(&self) -> u64 {
        self.safe_bytes
    }

    pub fn start_bytes(&self) -> u64 {
        self.start_bytes
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn canceled(&self) -> bool {
        self.canceled
    }

    pub fn was_opened(&self) -> bool {
        self.was_opened
    }

    pub fn is_suspended(&self) -> bool {
        self.state == ChunkState::Suspended
    }

    pub fn last_progress(&self) -> Option<Instant> {
        self.last_progress
    }

    pub fn resume_at(&self) -> Option<Instant> {
        self.resume_at
    }

    /// Bytes still wanted; `None` when unbounded. Owed tokens count as received.
    pub fn remainder(&self) -> Option<u64> {
        self.total()
            .map(|t| t.saturating_sub(self.written + self.pending_tokens))
    }

    /// Absolute offset the next received byte belongs to.
    pub fn position(&self) -> u64 {
        self.start + self.written + self.pending_tokens
    }

    /// Every byte of a bounded range has arrived, counting bytes whose tokens are
    /// still owed. `complete` only turns true once those tokens are settled.
    pub fn received_all(&self) -> bool {
        self.remainder() == Some(0)
    }

    pub fn complete(&self) -> bool {
        match self.total() {
            Some(t) => self.written == t,
            None => self.written != 0,
        }
    }

    /// Bytes in the pipeline that are not provably on disk, plus one segment of slack.
    pub fn buffered(&self) -> u64 {
        let rv = self.sink.as_ref().map(|s| s.pending()).unwrap_or(0) + self.overflow.len() as u64;
        if rv > 0 {
            rv + PIPE_SEGMENT_SIZE
        } else {
            0
        }
    }

    /// Move the inclusive end. Only the owning download does this, while splitting
    /// or once the starter learned the size.
    pub(crate) fn set_end(&mut self, end: Option<u64>) -> Result<(), ChunkError> {
        if let Some(e) = end {
            let received = self.written + self.pending_tokens;
            if e < self.start || e + 1 < self.start + received {
                return Err(ChunkError::Range(format!(
                    "end {e} below received position {}",
                    self.start + received
                )));
            }
        }
        self.end = end;
        Ok(())
    }

    pub(crate) fn set_errored(&mut self) {
        self.errored = true;
    }

    /// Open the write pipeline at `start + safe_bytes`.
    ///
    /// Calling this on an open chunk is a no-op. A chunk that has been open before
    /// can not be reopened.
    pub fn open(
        &mut self,
        storage: &dyn ChunkStorage,
        buckets: ByteBucketTee,
        memory: MemoryReporter,
    ) -> Result<(), ChunkError> {
        match self.state {
            ChunkState::Opening | ChunkState::Writing | ChunkState::Suspended => return Ok(()),
            ChunkState::Closing | ChunkState::Closed => return Err(ChunkError::Recycled),
            ChunkState::Idle if self.was_opened => return Err(ChunkError::Recycled),
            ChunkState::Idle => {}
        }
        self.was_opened = true;
        self.state = ChunkState::Opening;
        let pos = self.start + self.safe_bytes;
        tracing::debug!(chunk = %self, pos, "opening chunk");
        let sink = match storage.open_sink(pos) {
            Ok(s) => s,
            Err(e) => {
                self.errored = true;
                self.state = ChunkState::Closed;
                return Err(e.into());
            }
        };
        self.sink = Some(sink);
        self.written = self.safe_bytes;
        self.start_bytes = self.safe_bytes;
        self.session_bytes = 0;
        self.buckets = Some(buckets);
        self.memory = Some(memory);
        self.running = true;
        self.state = ChunkState::Writing;
        Ok(())
    }

    /// Take bytes from the connection.
    pub fn write(&mut self, data: &[u8], now: Instant) -> Result<WriteStatus, ChunkError> {
        if !self.running || self.sink.is_none() {
            tracing::error!(chunk = %self, "trying to write on a closed chunk");
            return Err(ChunkError::NotOpen);
        }
        if self.state == ChunkState::Suspended {
            return Ok(WriteStatus::WouldBlock);
        }
        if data.is_empty() {
            return Ok(WriteStatus::Accepted(0));
        }
        let bytes = match self.remainder() {
            Some(r) => r.min(data.len() as u64) as usize,
            None => data.len(),
        };
        if bytes == 0 {
            return Ok(WriteStatus::Finished);
        }
        let got = self.request_bytes(bytes as u64, now);
        self.enqueue(&data[..bytes])?;
        if got < bytes as u64 {
            self.suspend(bytes as u64 - got, now);
        } else if !self.overflow.is_empty() {
            self.suspend(0, now);
        }
        self.note_bytes_written(got, now);
        Ok(WriteStatus::Accepted(bytes))
    }

    /// Resume driver for a suspended chunk. Acquires owed tokens and flushes the
    /// overflow; returns true once the connection may deliver bytes again.
    pub fn run(&mut self, now: Instant) -> Result<bool, ChunkError> {
        self.resume_at = None;
        if self.state != ChunkState::Suspended || self.sink.is_none() {
            return Ok(false);
        }
        if self.pending_tokens > 0 {
            let got = self.request_bytes(self.pending_tokens, now).min(self.pending_tokens);
            if got > 0 {
                self.pending_tokens -= got;
                self.note_bytes_written(got, now);
            }
            if self.pending_tokens > 0 {
                self.schedule(now);
                return Ok(false);
            }
        }
        // Owed tokens and the overflow clear independently. A slow sink does not
        // hold back token acquisition, but both must be settled before resuming.
        if !self.overflow.is_empty() {
            self.flush_overflow().map_err(|e| self.io_failed(e))?;
            if !self.overflow.is_empty() {
                self.schedule(now);
                return Ok(false);
            }
        }
        self.state = ChunkState::Writing;
        self.last_progress = Some(now);
        Ok(true)
    }

    /// Whether the resume timer has fired.
    pub fn resume_due(&self, now: Instant) -> bool {
        self.resume_at.map_or(false, |t| now >= t)
    }

    /// Recompute the durable low-water mark from what the sink still holds.
    pub fn refresh_safe_bytes(&mut self) {
        self.safe_bytes = self.start_bytes.max(self.written.saturating_sub(self.buffered()));
    }

    /// Close the pipeline and settle the counters. Idempotent.
    ///
    /// An errored or incomplete chunk keeps `max(start_bytes, safe_bytes - SAFETY_MARGIN)`.
    /// Afterwards `written == safe_bytes == start_bytes`.
    pub fn close(&mut self) -> Result<(), ChunkError> {
        let mut budget = CLOSE_WAIT_BUDGET;
        self.close_within(&mut budget)
    }

    /// [`Chunk::close`], waiting at most `budget` for the overflow to drain. The
    /// time spent is taken off `budget`, so closing many chunks can share one allowance.
    pub fn close_within(&mut self, budget: &mut Duration) -> Result<(), ChunkError> {
        match self.state {
            ChunkState::Closed | ChunkState::Closing => return Ok(()),
            ChunkState::Idle => {
                self.running = false;
                return Ok(());
            }
            _ => {}
        }
        tracing::debug!(chunk = %self, "closing chunk");
        self.running = false;
        self.state = ChunkState::Closing;
        let mut result = Ok(());

        // Owed bytes are already in the pipeline.
        if self.pending_tokens > 0 {
            self.written += self.pending_tokens;
            self.session_bytes += self.pending_tokens;
            self.pending_tokens = 0;
        }
        if !self.errored {
            if let Err(e) = self.drain_overflow(budget) {
                self.errored = true;
                result = Err(ChunkError::Io(e));
            }
        }
        if !self.overflow.is_empty() {
            let lost = self.overflow.len() as u64;
            tracing::debug!(chunk = %self, lost, "discarding undrained overflow");
            self.written = self.written.saturating_sub(lost);
            self.session_bytes = self.session_bytes.saturating_sub(lost);
            self.overflow.clear();
            if let Some(m) = &self.memory {
                m.sub(lost);
            }
        }
        self.refresh_safe_bytes();
        if let Some(sink) = self.sink.take() {
            match sink.finish() {
                Ok(()) => self.refresh_safe_bytes(),
                Err(e) => {
                    // Keep the pre-finish mark: queued bytes never became durable.
                    self.errored = true;
                    if result.is_ok() {
                        result = Err(ChunkError::Io(e));
                    }
                }
            }
        }

        self.session_bytes = 0;
        self.written = if self.errored || !self.complete() {
            self.start_bytes
                .max(self.safe_bytes.saturating_sub(SAFETY_MARGIN))
        } else {
            self.safe_bytes
        };
        self.start_bytes = self.written;
        self.safe_bytes = self.written;
        self.buckets = None;
        self.memory = None;
        self.resume_at = None;
        self.state = ChunkState::Closed;
        result
    }

    /// Stop accepting bytes and close. The connection notices on its next write.
    pub fn cancel_chunk(&mut self) -> Result<(), ChunkError> {
        self.canceled = true;
        self.running = false;
        self.close()
    }

    /// Absorb the adjacent chunk `next`. Both must be complete and idle.
    pub fn merge(&mut self, next: &Chunk) -> Result<(), ChunkError> {
        if !self.complete() || !next.complete() {
            return Err(ChunkError::Merge("both chunks must be complete"));
        }
        if self.running || next.running {
            return Err(ChunkError::Merge("chunk still running"));
        }
        if self.end.map(|e| e + 1) != Some(next.start) || next.end.is_none() {
            return Err(ChunkError::Merge("chunks are not adjacent"));
        }
        self.end = next.end;
        self.written += next.written;
        self.safe_bytes += next.safe_bytes;
        self.start_bytes = self.written;
        Ok(())
    }

    /// Fresh chunk for the same range, resuming at `safe_bytes`.
    pub fn clone_for_resume(&self) -> Chunk {
        let mut c = Chunk::blank(self.start);
        c.end = self.end;
        c.written = self.safe_bytes;
        c.safe_bytes = self.safe_bytes;
        c.start_bytes = self.safe_bytes;
        c
    }

    /// Tokens for `requested` bytes, scaled down under memory pressure.
    fn request_bytes(&self, mut requested: u64, now: Instant) -> u64 {
        if let Some(m) = &self.memory {
            requested = m.scale_request(requested);
        }
        match &self.buckets {
            Some(tee) => tee.request_bytes_at(requested, now),
            None => requested,
        }
    }

    fn enqueue(&mut self, data: &[u8]) -> Result<(), ChunkError> {
        let taken = if !self.overflow.is_empty() {
            0
        } else {
            let sink = self.sink.as_mut().ok_or(ChunkError::NotOpen)?;
            match sink.offer(data) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(self.io_failed(e)),
            }
        };
        let rest = &data[taken..];
        if !rest.is_empty() {
            self.overflow.extend(rest.iter().copied());
            if let Some(m) = &self.memory {
                m.add(rest.len() as u64);
            }
        }
        Ok(())
    }

    fn flush_overflow(&mut self) -> io::Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        while !self.overflow.is_empty() {
            let (front, _) = self.overflow.as_slices();
            let n = match sink.offer(front) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };
            self.overflow.drain(..n);
            if let Some(m) = &self.memory {
                m.sub(n as u64);
            }
        }
        Ok(())
    }

    /// Keep flushing the overflow with capped backoff until it is empty, the
    /// attempts run out or `budget` is spent.
    fn drain_overflow(&mut self, budget: &mut Duration) -> io::Result<()> {
        let mut backoff = Duration::from_millis(1);
        for _ in 0..DRAIN_ATTEMPTS {
            self.flush_overflow()?;
            if self.overflow.is_empty() {
                return Ok(());
            }
            if budget.is_zero() {
                break;
            }
            let wait = backoff.min(*budget);
            if let Some(sink) = &self.sink {
                sink.wait_writable(wait);
            }
            *budget = budget.saturating_sub(wait);
            backoff = (backoff * 2).min(DRAIN_BACKOFF_CAP);
        }
        tracing::warn!(chunk = %self, left = self.overflow.len(), "overflow did not drain");
        Ok(())
    }

    fn io_failed(&mut self, e: io::Error) -> ChunkError {
        self.errored = true;
        ChunkError::Io(e)
    }

    fn suspend(&mut self, pending: u64, now: Instant) {
        self.pending_tokens += pending;
        self.state = ChunkState::Suspended;
        self.schedule(now);
    }

    fn schedule(&mut self, now: Instant) {
        if self.resume_at.is_some() {
            return;
        }
        let jitter = rand::thread_rng().gen_range(0..=MAX_RESUME_JITTER_MS);
        self.resume_at = Some(now + Duration::from_millis(jitter));
    }

    fn note_bytes_written(&mut self, bytes: u64, now: Instant) {
        self.written += bytes;
        self.session_bytes += bytes;
        self.refresh_safe_bytes();
        if bytes > 0 {
            self.last_progress = Some(now);
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self
            .end
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        let total = self
            .total()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        let remainder = self
            .remainder()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}/{}/{} running:{} written/remain/sb:{}/{}/{}",
            self.start, end, total, self.running, self.written, remainder, self.session_bytes
        )
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("written", &self.written)
            .field("safe_bytes", &self.safe_bytes)
            .field("state", &self.state)
            .field("running", &self.running)
            .field("errored", &self.errored)
            .finish()
    }
}
