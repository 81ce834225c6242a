//! Results coming back from connections and the finisher.

use std::time::Instant;

use crate::download::{
    lock_chunk, ConnectionOutcome, DownloadId, DownloadState, Failure, FailureKind, ResponseInfo,
    SharedChunk,
};
use crate::finish::{FinishError, Finished};
use crate::retry::{classify, ConnectionError, RetryDecision};

use super::Manager;

impl Manager {
    /// A connection got its (validated) response head.
    pub fn on_response(
        &mut self,
        id: DownloadId,
        chunk: &SharedChunk,
        info: &ResponseInfo,
        now: Instant,
    ) {
        let Some(idx) = self.index_of(id) else {
            return;
        };
        let d = &mut self.queue[idx];
        if d.state() != DownloadState::Running {
            return;
        }
        match d.apply_response(chunk, info) {
            Ok(()) => {
                if d.retry_due(now) {
                    self.resume_connections(idx, now);
                }
            }
            Err(e) => {
                tracing::error!(download = id, error = %e, "cannot apply response");
                let failure = e.failure();
                self.storage_failed(idx, failure, now);
            }
        }
        self.collect_events();
    }

    /// A connection ended. Settles the chunk, handles the failure if any, then
    /// either finishes the download or lets it grow again.
    pub fn on_connection_done(
        &mut self,
        id: DownloadId,
        chunk: &SharedChunk,
        outcome: ConnectionOutcome,
        now: Instant,
    ) {
        let Some(idx) = self.index_of(id) else {
            // Removed while connected.
            let _ = lock_chunk(chunk).close();
            return;
        };
        let d = &mut self.queue[idx];
        if let Err(e) = d.connection_finished(chunk, &outcome) {
            tracing::warn!(download = id, error = %e, "closing chunk failed");
            if d.state() == DownloadState::Running {
                let failure = e.failure();
                self.storage_failed(idx, failure, now);
            }
        }
        if self.queue[idx].state() == DownloadState::Running {
            if let ConnectionOutcome::Failed(err) = outcome {
                self.connection_failed(idx, err, now);
            }
        }

        let d = &mut self.queue[idx];
        if d.state() == DownloadState::Running {
            if d.is_transfer_complete() {
                let job = d.finish_download();
                self.finish_jobs.push(job);
            } else if d.retry_due(now) {
                self.resume_connections(idx, now);
            }
        }
        self.collect_events();
    }

    /// Route a failed connection: back off and retry while the policy allows,
    /// then pause for an auto-retry, otherwise cancel with the failure.
    fn connection_failed(&mut self, idx: usize, err: ConnectionError, now: Instant) {
        let auto = self.auto_retry_settings();
        let resume_on_error = self.config.resume_on_error;
        let failure = Failure::new(FailureKind::from_connection(&err), err.to_string());
        if let ConnectionError::Storage(_) = err {
            self.storage_failed(idx, failure, now);
            return;
        }
        let kind = classify(&err);
        let d = &mut self.queue[idx];
        tracing::warn!(download = d.id(), error = %err, ?kind, attempt = d.attempts() + 1, "connection failed");
        if matches!(err, ConnectionError::RangeRejected) {
            d.fail(failure);
            return;
        }
        match self.retry_policy.decide(d.attempts() + 1, kind) {
            RetryDecision::RetryAfter(delay) => {
                d.defer_retry(now, delay);
                if !d.resumable() {
                    // Nothing to resume from; start over.
                    d.queue();
                }
            }
            RetryDecision::NoRetry if kind.is_resumable() || resume_on_error => {
                d.set_failure(failure);
                d.pause_and_retry(now, auto);
            }
            RetryDecision::NoRetry => d.fail(failure),
        }
    }

    /// The finisher is done with a download's file.
    pub fn on_finished(&mut self, id: DownloadId, result: Result<Finished, FinishError>) {
        let Some(idx) = self.index_of(id) else {
            tracing::warn!(download = id, "finished download no longer queued");
            return;
        };
        let action = self.config.on_verify_error;
        let d = &mut self.queue[idx];
        if d.state() != DownloadState::Finishing {
            tracing::error!(download = id, state = %d.state(), "finish result for a download that is not finishing");
            return;
        }
        match result {
            Ok(done) => {
                tracing::info!(download = id, path = %done.path.display(), "download complete");
                d.finish_succeeded(&done.path, done.conflicts);
            }
            Err(e) => {
                tracing::warn!(download = id, error = %e, "finishing failed");
                if let Err(err) = d.finish_failed(&e, action) {
                    d.fail(err.failure());
                }
            }
        }
        self.collect_events();
    }
}
