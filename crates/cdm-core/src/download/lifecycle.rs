//! State transitions of a download and the connection / finish handoffs.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bucket::{ByteBucket, DOWNLOAD_BURST};
use crate::checksum::ByteRange;
use crate::chunk::{Chunk, StorageFactory, CLOSE_WAIT_BUDGET};
use crate::config::VerifyErrorAction;
use crate::finish::{FinishError, FinishJob};
use crate::queue_store::unix_timestamp;
use crate::retry::ConnectionError;

use super::{lock_chunk, share, Download, DownloadError, DownloadState, Failure, FailureKind, SharedChunk};

/// How a connection ended, as seen by its download.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The chunk got every byte it wanted (or the unbounded body ended).
    Completed,
    /// We stopped the connection ourselves (pause, cancel, surplus chunk).
    Aborted,
    Failed(ConnectionError),
}

/// Auto-retry settings handed to [`Download::pause_and_retry`].
#[derive(Debug, Clone, Copy)]
pub struct AutoRetry {
    /// Zero disables auto-retry.
    pub interval: Duration,
    /// 0 = unlimited.
    pub max_retries: u32,
}

impl Download {
    /// Switch state. Entering RUNNING creates a fresh per-download bucket, leaving it
    /// discards the bucket. Entering FINISHING with an unknown size fixes the size to
    /// what was received.
    pub fn set_state(&mut self, state: DownloadState) {
        let from = self.state;
        if from == state {
            return;
        }
        if from == DownloadState::Running {
            if let Some(bucket) = self.bucket.take() {
                bucket.clear();
            }
        }
        match state {
            DownloadState::Running => {
                self.bucket = Some(Arc::new(ByteBucket::new(
                    self.speed_limit,
                    DOWNLOAD_BURST,
                    format!("download-{}", self.id),
                )));
                self.started_at.get_or_insert_with(unix_timestamp);
            }
            DownloadState::Finishing if self.total_size == 0 => {
                self.refresh_partial_size();
                self.total_size = self.partial_size;
            }
            _ => {}
        }
        self.state = state;
        tracing::info!(download = self.id, %from, to = %state, "state change");
        self.transitions.push(super::StateTransition { from, to: state });
    }

    /// Open storage and enter RUNNING. Downloads that can not resume (not resumable,
    /// or size never learned) start over from scratch.
    pub fn prepare_run(
        &mut self,
        factory: &dyn StorageFactory,
        now: Instant,
    ) -> Result<(), DownloadError> {
        if !self.chunks.is_empty() && (!self.resumable || self.total_size == 0) {
            tracing::debug!(download = self.id, "restarting from scratch");
            self.reset_progress();
        }
        let path = self.temp_path();
        let storage = factory.open(&path, !self.chunks.is_empty())?;
        if self.total_size > 0 {
            storage.preallocate(self.total_size)?;
        }
        self.temp_file = Some(path);
        self.storage = Some(storage);
        self.failure = None;
        self.stream_ended = false;
        self.retry_not_before = None;
        self.auto_retry_at = None;
        self.last_progress = Some(now);
        self.speed.clear();
        self.set_state(DownloadState::Running);
        Ok(())
    }

    /// Where the transfer stands once no chunk is running anymore.
    pub fn is_transfer_complete(&self) -> bool {
        if self.chunks.is_empty() || self.active_chunks() > 0 {
            return false;
        }
        if self.total_size == 0 {
            return self.stream_ended;
        }
        self.partial_size == self.total_size && self.chunks.iter().all(|c| lock_chunk(c).complete())
    }

    /// Settle a chunk whose connection ended: close it and update the counters.
    pub fn connection_finished(
        &mut self,
        chunk: &SharedChunk,
        outcome: &ConnectionOutcome,
    ) -> Result<(), DownloadError> {
        let result = {
            let mut c = lock_chunk(chunk);
            let result = c.close();
            if matches!(outcome, ConnectionOutcome::Completed) {
                if c.is_starter() {
                    self.stream_ended = true;
                }
                self.attempts = 0;
            }
            tracing::debug!(download = self.id, chunk = %c, ?outcome, "connection finished");
            result
        };
        self.refresh_partial_size();
        result.map_err(Into::into)
    }

    /// Back off resuming after a retryable connection error.
    pub(crate) fn defer_retry(&mut self, now: Instant, delay: Duration) {
        self.attempts += 1;
        self.retry_not_before = Some(now + delay);
    }

    /// True once a deferred retry may go ahead; clears the deferral.
    pub(crate) fn retry_due(&mut self, now: Instant) -> bool {
        match self.retry_not_before {
            Some(t) if now < t => false,
            _ => {
                self.retry_not_before = None;
                true
            }
        }
    }

    pub(crate) fn set_failure(&mut self, failure: Failure) {
        self.failure = Some(failure);
    }

    /// Close every chunk and go to PAUSED. No-op in terminal or finishing states.
    pub fn pause(&mut self) {
        if matches!(
            self.state,
            DownloadState::Finishing | DownloadState::Complete | DownloadState::Canceled
        ) {
            return;
        }
        self.close_chunks();
        self.storage = None;
        self.retry_not_before = None;
        self.auto_retry_at = None;
        self.set_state(DownloadState::Paused);
    }

    /// Pause after a resumable failure and arm the auto-retry timer when allowed.
    pub fn pause_and_retry(&mut self, now: Instant, retry: AutoRetry) {
        let was_running = self.state == DownloadState::Running;
        self.pause();
        if self.state != DownloadState::Paused || !was_running || retry.interval.is_zero() {
            return;
        }
        if retry.max_retries > 0 && self.auto_retries >= retry.max_retries {
            tracing::info!(download = self.id, retries = self.auto_retries, "auto-retry limit reached");
            return;
        }
        self.auto_retry_at = Some(now + retry.interval);
    }

    /// Requeue when the auto-retry timer fired. Returns true when it did.
    pub fn auto_retry(&mut self, now: Instant) -> bool {
        match self.auto_retry_at {
            Some(at) if now >= at && self.state == DownloadState::Paused => {
                self.auto_retries += 1;
                tracing::info!(download = self.id, attempt = self.auto_retries, "auto-retry");
                self.queue();
                true
            }
            _ => false,
        }
    }

    /// Put the download back in line.
    pub fn queue(&mut self) {
        if self.state == DownloadState::Running {
            self.close_chunks();
            self.storage = None;
        }
        self.auto_retry_at = None;
        self.set_state(DownloadState::Queued);
    }

    /// Stop for good and delete the temp file.
    pub fn cancel(&mut self) {
        self.discard();
        self.failure = None;
        self.set_state(DownloadState::Canceled);
    }

    /// Cancel with a user-visible reason.
    pub fn fail(&mut self, failure: Failure) {
        tracing::warn!(download = self.id, %failure, "download failed");
        self.discard();
        self.failure = Some(failure);
        self.set_state(DownloadState::Canceled);
    }

    /// Throw away all progress and queue again.
    pub fn safe_retry(&mut self) {
        self.discard();
        self.failure = None;
        self.attempts = 0;
        self.auto_retries = 0;
        self.queue();
    }

    /// Keep the verified parts and queue again to fetch only `mismatches`.
    pub fn recover_partials(&mut self, mismatches: &[ByteRange]) -> Result<(), DownloadError> {
        if mismatches.is_empty() || self.total_size == 0 || !self.resumable {
            self.safe_retry();
            return Ok(());
        }
        let mut ranges = mismatches.to_vec();
        ranges.sort_by_key(|r| r.start);
        let total = self.total_size;
        let mut chunks = Vec::new();
        let mut cursor = 0u64;
        for r in ranges {
            if r.start < cursor || r.end >= total {
                return Err(DownloadError::Inconsistent);
            }
            if r.start > cursor {
                chunks.push(share(Chunk::new(cursor, Some(r.start - 1), r.start - cursor)?));
            }
            chunks.push(share(Chunk::new(r.start, Some(r.end), 0)?));
            cursor = r.end + 1;
        }
        if cursor < total {
            chunks.push(share(Chunk::new(cursor, Some(total - 1), total - cursor)?));
        }
        self.close_chunks();
        self.chunks = chunks;
        self.refresh_partial_size();
        self.failure = None;
        tracing::info!(
            download = self.id,
            missing = total - self.partial_size,
            "re-downloading mismatched ranges"
        );
        self.queue();
        Ok(())
    }

    /// Close all chunks and move to FINISHING; the returned job goes to the finisher.
    pub fn finish_download(&mut self) -> FinishJob {
        self.close_chunks();
        self.merge_finished_chunks();
        self.storage = None;
        self.set_state(DownloadState::Finishing);
        FinishJob {
            id: self.id,
            temp_path: self.temp_path(),
            destination: self.destination(),
            total_size: self.total_size,
            hash: self.hash.clone(),
            compression: self.compression,
            conflicts: self.conflicts,
        }
    }

    /// The finisher placed the file at `path`.
    pub fn finish_succeeded(&mut self, path: &std::path::Path, conflicts: u32) {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            self.file_name = name.to_string();
        }
        if let Some(dir) = path.parent() {
            self.destination_dir = dir.to_path_buf();
        }
        self.conflicts = conflicts;
        self.temp_file = None;
        self.chunks.clear();
        self.partial_size = self.total_size;
        self.failure = None;
        self.set_state(DownloadState::Complete);
    }

    /// The finisher gave up; verification failures follow `action`.
    pub fn finish_failed(
        &mut self,
        err: &FinishError,
        action: VerifyErrorAction,
    ) -> Result<(), DownloadError> {
        match err {
            FinishError::Verification { mismatches } => match action {
                VerifyErrorAction::Recover => self.recover_partials(mismatches)?,
                VerifyErrorAction::Retry => self.safe_retry(),
                VerifyErrorAction::Cancel | VerifyErrorAction::Keep => {
                    self.fail(Failure::new(FailureKind::Verification, err.to_string()))
                }
            },
            FinishError::Io(e) => self.fail(Failure::new(FailureKind::from_io(e), err.to_string())),
            FinishError::Move(_) => self.fail(Failure::new(FailureKind::Move, err.to_string())),
        }
        Ok(())
    }

    fn close_chunks(&mut self) {
        let mut budget = CLOSE_WAIT_BUDGET;
        for shared in &self.chunks {
            let mut c = lock_chunk(shared);
            if let Err(e) = c.close_within(&mut budget) {
                tracing::warn!(download = self.id, chunk = %c, error = %e, "chunk close failed");
            }
        }
        self.refresh_partial_size();
    }

    /// Drop all progress and the temp file.
    fn discard(&mut self) {
        self.close_chunks();
        self.storage = None;
        self.chunks.clear();
        self.partial_size = 0;
        self.total_size = 0;
        self.resumable = true;
        self.compression = None;
        self.stream_ended = false;
        self.retry_not_before = None;
        self.auto_retry_at = None;
        self.speed.clear();
        let path = self.temp_path();
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(download = self.id, path = %path.display(), "removed temp file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(download = self.id, path = %path.display(), error = %e, "cannot remove temp file"),
        }
        self.temp_file = None;
    }

    fn reset_progress(&mut self) {
        self.close_chunks();
        self.chunks.clear();
        self.partial_size = 0;
        self.total_size = 0;
        self.resumable = true;
        self.compression = None;
        self.stream_ended = false;
    }
}
