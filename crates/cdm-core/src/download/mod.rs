//! Download: the aggregate root owning an ordered list of chunks.
//!
//! All mutation happens on the control thread. Connections only touch their own
//! chunk (through [`SharedChunk`]); `partial_size` and the running count are
//! recomputed from the chunk list so they cannot drift from it.

mod failure;
mod lifecycle;
mod resume;
mod response;
mod snapshot;
mod speed;

#[cfg(test)]
mod tests;

pub use failure::{Failure, FailureKind};
pub use lifecycle::{AutoRetry, ConnectionOutcome};
pub use resume::ResumeContext;
pub use response::ResponseInfo;
pub use snapshot::{ChunkSnapshot, DownloadSnapshot, SnapshotError};
pub use speed::{SpeedStats, SPEED_SAMPLES};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::bucket::ByteBucket;
use crate::checksum::HashSpec;
use crate::chunk::{Chunk, ChunkError, ChunkStorage};
use crate::config::normalize_rate;
use crate::server::HostKey;
use crate::storage::temp_path;
use crate::url_model;

/// A chunk shared between its download (control thread) and its connection.
pub type SharedChunk = Arc<Mutex<Chunk>>;

/// Lock a chunk, recovering from a poisoned mutex.
pub fn lock_chunk(chunk: &SharedChunk) -> MutexGuard<'_, Chunk> {
    chunk.lock().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn share(chunk: Chunk) -> SharedChunk {
    Arc::new(Mutex::new(chunk))
}

pub type DownloadId = i64;

/// Surplus chunks with less than this left are allowed to run out when the limit drops.
pub const MIN_CANCEL_REMAINDER: u64 = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    #[default]
    Queued,
    Running,
    Paused,
    Finishing,
    Complete,
    Canceled,
}

impl DownloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Running => "running",
            DownloadState::Paused => "paused",
            DownloadState::Finishing => "finishing",
            DownloadState::Complete => "complete",
            DownloadState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content encoding the server applied; undone by the finisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Deflate,
}

impl Compression {
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Compression::Gzip),
            "deflate" => Some(Compression::Deflate),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("storage: {0}")]
    Storage(#[from] io::Error),
    #[error("invalid URL: {0}")]
    Url(String),
    #[error("download has no open storage")]
    NoStorage,
    #[error("total size {size} is smaller than the {partial} bytes already received")]
    InvalidSize { size: u64, partial: u64 },
    #[error("chunk list is inconsistent")]
    Inconsistent,
}

impl DownloadError {
    pub fn failure(&self) -> Failure {
        let kind = match self {
            DownloadError::Chunk(e) => FailureKind::from_chunk(e),
            DownloadError::Storage(e) => FailureKind::from_io(e),
            DownloadError::Url(_) => FailureKind::AccessError,
            _ => FailureKind::Internal,
        };
        Failure::new(kind, self.to_string())
    }
}

/// What to download and where.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub url: String,
    pub destination_dir: PathBuf,
    /// Fixed name; derived from the URL or Content-Disposition when absent.
    pub file_name: Option<String>,
    /// Renaming mask like `*name*.*ext*`, expanded below `destination_dir`.
    pub mask: Option<String>,
    /// 0 = server or global default.
    pub max_chunks: usize,
    pub speed_limit: i64,
    pub hash: Option<HashSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: DownloadState,
    pub to: DownloadState,
}

pub struct Download {
    id: DownloadId,
    url: String,
    host: HostKey,
    destination_dir: PathBuf,
    file_name: String,
    file_name_fixed: bool,
    mask: Option<String>,
    temp_file: Option<PathBuf>,
    total_size: u64,
    partial_size: u64,
    state: DownloadState,
    max_chunks: usize,
    default_chunks: usize,
    resumable: bool,
    speed_limit: i64,
    chunks: Vec<SharedChunk>,
    bucket: Option<Arc<ByteBucket>>,
    storage: Option<Arc<dyn ChunkStorage>>,
    compression: Option<Compression>,
    hash: Option<HashSpec>,
    conflicts: u32,
    failure: Option<Failure>,
    stream_ended: bool,
    attempts: u32,
    retry_not_before: Option<Instant>,
    auto_retry_at: Option<Instant>,
    auto_retries: u32,
    last_progress: Option<Instant>,
    started_at: Option<i64>,
    speed: SpeedStats,
    transitions: Vec<StateTransition>,
}

impl Download {
    pub fn new(id: DownloadId, opts: DownloadOptions, default_chunks: usize) -> Result<Self, DownloadError> {
        let host = HostKey::from_url(&opts.url).map_err(|e| DownloadError::Url(format!("{e:#}")))?;
        let file_name_fixed = opts.file_name.is_some();
        let file_name = match opts.file_name {
            Some(name) => url_model::sanitize(&name),
            None => url_model::derive_file_name(&opts.url, None),
        };
        Ok(Self {
            id,
            url: opts.url,
            host,
            destination_dir: opts.destination_dir,
            file_name,
            file_name_fixed,
            mask: opts.mask.filter(|m| !m.trim().is_empty()),
            temp_file: None,
            total_size: 0,
            partial_size: 0,
            state: DownloadState::Queued,
            max_chunks: opts.max_chunks,
            default_chunks: default_chunks.max(1),
            resumable: true,
            speed_limit: normalize_rate(opts.speed_limit),
            chunks: Vec::new(),
            bucket: None,
            storage: None,
            compression: None,
            hash: opts.hash.filter(|h| !h.is_empty()),
            conflicts: 0,
            failure: None,
            stream_ended: false,
            attempts: 0,
            retry_not_before: None,
            auto_retry_at: None,
            auto_retries: 0,
            last_progress: None,
            started_at: None,
            speed: SpeedStats::new(),
            transitions: Vec::new(),
        })
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &HostKey {
        &self.host
    }

    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mask(&self) -> Option<&str> {
        self.mask.as_deref()
    }

    /// Final path: the renaming mask expanded below the download directory, or
    /// just the file name when there is no (usable) mask.
    pub fn destination(&self) -> PathBuf {
        let masked = self.mask.as_deref().and_then(|mask| {
            let ctx = url_model::MaskContext {
                url: &self.url,
                file_name: &self.file_name,
                num: self.id,
                started: self.started_local(),
            };
            url_model::apply_mask(mask, &ctx)
        });
        match masked {
            Some(rel) => self.destination_dir.join(rel),
            None => self.destination_dir.join(&self.file_name),
        }
    }

    /// Temp file of the transfer, next to the unmasked name. Fixed once the first
    /// run opened it, so a later rename from Content-Disposition does not orphan
    /// received data.
    pub fn temp_path(&self) -> PathBuf {
        self.temp_file
            .clone()
            .unwrap_or_else(|| temp_path(&self.destination_dir.join(&self.file_name)))
    }

    fn started_local(&self) -> chrono::NaiveDateTime {
        self.started_at
            .and_then(|ts| chrono::DateTime::<chrono::Utc>::from_timestamp(ts, 0))
            .map(|t| t.with_timezone(&chrono::Local).naive_local())
            .unwrap_or_else(|| chrono::Local::now().naive_local())
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn partial_size(&self) -> u64 {
        self.partial_size
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Effective chunk cap.
    pub fn max_chunks(&self) -> usize {
        if self.max_chunks > 0 {
            self.max_chunks
        } else {
            self.default_chunks
        }
    }

    pub fn active_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| lock_chunk(c).running()).count()
    }

    pub fn resumable(&self) -> bool {
        self.resumable
    }

    pub fn speed_limit(&self) -> i64 {
        self.speed_limit
    }

    pub fn chunks(&self) -> &[SharedChunk] {
        &self.chunks
    }

    pub fn bucket(&self) -> Option<&Arc<ByteBucket>> {
        self.bucket.as_ref()
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub fn hash(&self) -> Option<&HashSpec> {
        self.hash.as_ref()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn conflicts(&self) -> u32 {
        self.conflicts
    }

    pub fn auto_retries(&self) -> u32 {
        self.auto_retries
    }

    pub fn auto_retry_at(&self) -> Option<Instant> {
        self.auto_retry_at
    }

    pub fn is_auto_retrying(&self) -> bool {
        self.auto_retry_at.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_not_before(&self) -> Option<Instant> {
        self.retry_not_before
    }

    pub fn started_at(&self) -> Option<i64> {
        self.started_at
    }

    pub fn speed(&self) -> &SpeedStats {
        &self.speed
    }

    /// Bytes still to fetch; `None` while the size is unknown.
    pub fn remaining(&self) -> Option<u64> {
        (self.total_size > 0).then(|| self.total_size.saturating_sub(self.partial_size))
    }

    /// Most recent progress of the download or any of its chunks.
    pub fn last_progress(&self) -> Option<Instant> {
        self.chunks
            .iter()
            .filter_map(|c| lock_chunk(c).last_progress())
            .chain(self.last_progress)
            .max()
    }

    /// Transitions recorded since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<StateTransition> {
        std::mem::take(&mut self.transitions)
    }

    /// Set the total size. Preallocates the temp file as a side effect while storage is open.
    pub fn set_total_size(&mut self, size: u64) -> Result<(), DownloadError> {
        if size > 0 && size < self.partial_size {
            return Err(DownloadError::InvalidSize {
                size,
                partial: self.partial_size,
            });
        }
        self.total_size = size;
        if size > 0 {
            if let Some(storage) = &self.storage {
                storage.preallocate(size)?;
            }
        }
        Ok(())
    }

    /// Change the per-download rate; applies to a running bucket at once.
    pub fn set_speed_limit(&mut self, limit: i64) {
        self.speed_limit = normalize_rate(limit);
        if let Some(bucket) = &self.bucket {
            bucket.set_byte_rate(self.speed_limit);
        }
    }

    /// Change the chunk cap (0 = default). Surplus running chunks with a meaningful
    /// remainder are canceled, the newest first. Returns true when the cap grew on a
    /// running download and the caller should resume it.
    pub fn set_max_chunks(&mut self, max_chunks: usize) -> Result<bool, DownloadError> {
        let before = self.max_chunks();
        self.max_chunks = max_chunks;
        let after = self.max_chunks();
        if self.state != DownloadState::Running {
            return Ok(false);
        }
        if after > before {
            return Ok(true);
        }
        let mut surplus = self.active_chunks().saturating_sub(after);
        for shared in self.chunks.iter().rev() {
            if surplus == 0 {
                break;
            }
            let mut c = lock_chunk(shared);
            if !c.running() {
                continue;
            }
            if c.remainder().map_or(false, |r| r < MIN_CANCEL_REMAINDER) {
                continue;
            }
            surplus -= 1;
            tracing::debug!(download = self.id, chunk = %c, "canceling surplus chunk");
            let result = c.cancel_chunk();
            drop(c);
            result?;
        }
        self.refresh_partial_size();
        Ok(false)
    }

    /// Adopt a file name the server suggested unless one was fixed by the user.
    pub(crate) fn suggest_file_name(&mut self, content_disposition: &str) {
        if self.file_name_fixed {
            return;
        }
        let name = url_model::derive_file_name(&self.url, Some(content_disposition));
        if name != self.file_name {
            tracing::info!(download = self.id, name = %name, "file name from Content-Disposition");
            self.file_name = name;
        }
    }

    /// Recompute `partial_size` from the chunks. An impossible sum is logged and ignored.
    pub fn refresh_partial_size(&mut self) {
        let sum: u64 = self.chunks.iter().map(|c| lock_chunk(c).written()).sum();
        if self.total_size > 0 && sum > self.total_size {
            tracing::error!(
                download = self.id,
                sum,
                total = self.total_size,
                "chunk sum exceeds total size; keeping previous partial size"
            );
            self.dump_scoreboard();
            return;
        }
        self.partial_size = sum;
    }

    /// Sample progress for the speed statistics.
    pub fn sample_speed(&mut self, now: Instant) {
        self.refresh_partial_size();
        self.speed.sample(now, self.partial_size);
    }

    /// Log one line per chunk.
    pub fn dump_scoreboard(&self) {
        tracing::debug!(
            download = self.id,
            state = %self.state,
            total = self.total_size,
            partial = self.partial_size,
            "scoreboard"
        );
        for (i, c) in self.chunks.iter().enumerate() {
            tracing::debug!(download = self.id, "  {i}: {}", lock_chunk(c));
        }
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.state)
            .field("total_size", &self.total_size)
            .field("partial_size", &self.partial_size)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}
