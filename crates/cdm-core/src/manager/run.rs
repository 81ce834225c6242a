//! Starting downloads, growing them, and the periodic housekeeping pass.

use std::time::{Duration, Instant};

use crate::download::{lock_chunk, DownloadState, Failure, FailureKind, ResumeContext};
use crate::scheduler::{running_load, Scheduler};

use super::{ConnectionRequest, Manager, ManagerEvent, SNAPSHOT_INTERVAL};

impl Manager {
    /// Downloads allowed to run at once. Every ten finishing downloads take away
    /// one slot, as moving and verifying files competes for the same disk.
    pub fn run_limit(&self) -> usize {
        let finishing = self.count(DownloadState::Finishing);
        self.config
            .max_in_progress
            .saturating_sub(finishing.div_ceil(10))
    }

    /// Start queued downloads until the run limit is reached or the scheduler has
    /// nothing eligible. Returns how many were started.
    pub fn start_next(&mut self, now: Instant) -> usize {
        if self.offline {
            return 0;
        }
        let mut started = 0;
        while self.count(DownloadState::Running) < self.run_limit() {
            let policy = self.config.scheduler;
            let scheduler = self
                .scheduler
                .get_or_insert_with(|| Scheduler::build(policy, &self.queue));
            let Some(id) = scheduler.next(&self.queue, &self.limits, now) else {
                break;
            };
            let Some(idx) = self.index_of(id) else {
                continue;
            };
            if self.queue[idx].state() != DownloadState::Queued {
                tracing::error!(download = id, state = %self.queue[idx].state(), "scheduler returned a download that is not queued");
                continue;
            }
            self.run_download(idx, now);
            started += 1;
        }
        self.collect_events();
        started
    }

    /// Run one queued download. A download whose bytes are all there already (a
    /// crash during finishing) goes straight to the finisher.
    pub(super) fn run_download(&mut self, idx: usize, now: Instant) {
        let d = &mut self.queue[idx];
        if d.is_transfer_complete() {
            tracing::info!(download = d.id(), "all bytes present; finishing");
            let job = d.finish_download();
            self.finish_jobs.push(job);
            return;
        }
        if let Err(e) = d.prepare_run(self.storage.as_ref(), now) {
            tracing::warn!(download = d.id(), error = %e, "cannot open temp file");
            let failure = e.failure();
            self.storage_failed(idx, failure, now);
            return;
        }
        self.resume_connections(idx, now);
    }

    /// Let a running download open more chunks, within its own cap and the
    /// connection slots its server has left.
    pub(super) fn resume_connections(&mut self, idx: usize, now: Instant) {
        let load = running_load(&self.queue);
        let d = &mut self.queue[idx];
        if d.state() != DownloadState::Running {
            return;
        }
        let host = d.host().clone();
        let own = d.active_chunks().max(1);
        let server_slots = self
            .limits
            .connection_limit(&host)
            .map(|limit| limit.saturating_sub(load.get(&host).saturating_sub(own)));
        let ctx = ResumeContext {
            offline: self.offline,
            min_chunk_size: self.config.min_chunk_size,
            load_end_first: self.config.load_end_first,
            server_slots,
            buckets: &self.buckets,
            server_speed_limit: self.limits.speed_limit(&host),
            memory: self.memory.clone(),
        };
        match d.resume_download(&ctx) {
            Ok(chunks) => {
                for chunk in chunks {
                    let (position, end) = {
                        let c = lock_chunk(&chunk);
                        (c.position(), c.end())
                    };
                    self.requests.push(ConnectionRequest {
                        download: d.id(),
                        chunk,
                        url: d.url().to_string(),
                        position,
                        end,
                    });
                }
            }
            Err(e) => {
                tracing::error!(download = d.id(), error = %e, "cannot resume download");
                let failure = e.failure();
                self.storage_failed(idx, failure, now);
            }
        }
    }

    /// A full disk pauses (and may auto-retry later); any other storage problem
    /// cancels the download.
    pub(super) fn storage_failed(&mut self, idx: usize, failure: Failure, now: Instant) {
        let auto = self.auto_retry_settings();
        let d = &mut self.queue[idx];
        if failure.kind == FailureKind::DiskFull {
            tracing::warn!(download = d.id(), %failure, "pausing download");
            d.set_failure(failure);
            d.pause_and_retry(now, auto);
        } else {
            d.fail(failure);
        }
    }

    /// Housekeeping tick: speed samples, no-progress timeouts, auto-retries,
    /// deferred resumes, auto-clear, then start whatever may start.
    pub fn process(&mut self, now: Instant) {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let auto = self.auto_retry_settings();
        let persist = self
            .last_snapshot
            .map_or(true, |t| now.saturating_duration_since(t) >= SNAPSHOT_INTERVAL);

        for idx in 0..self.queue.len() {
            let d = &mut self.queue[idx];
            match d.state() {
                DownloadState::Running => {
                    d.sample_speed(now);
                    self.events.push(ManagerEvent::Progress {
                        id: d.id(),
                        partial_size: d.partial_size(),
                        total_size: d.total_size(),
                        bytes_per_sec: d.speed().bytes_per_sec(),
                    });
                    let stalled = !timeout.is_zero()
                        && d
                            .last_progress()
                            .map_or(false, |t| now.saturating_duration_since(t) > timeout);
                    if stalled {
                        let failure = Failure::new(
                            FailureKind::Timeout,
                            format!("no progress for {}s", timeout.as_secs()),
                        );
                        if d.resumable() {
                            tracing::warn!(download = d.id(), "timed out; pausing for retry");
                            d.set_failure(failure);
                            d.pause_and_retry(now, auto);
                        } else {
                            d.fail(failure);
                        }
                    } else if d.retry_due(now) {
                        self.resume_connections(idx, now);
                    }
                    let d = &self.queue[idx];
                    if persist && d.state() == DownloadState::Running {
                        self.events.push(ManagerEvent::Snapshot {
                            id: d.id(),
                            snapshot: d.to_snapshot(),
                        });
                    }
                }
                DownloadState::Paused => {
                    d.auto_retry(now);
                }
                _ => {}
            }
        }
        if persist {
            self.last_snapshot = Some(now);
        }

        if self.config.auto_clear_complete {
            let mut removed = Vec::new();
            self.queue.retain(|d| {
                let done = d.state() == DownloadState::Complete;
                if done {
                    removed.push(d.id());
                }
                !done
            });
            if !removed.is_empty() {
                tracing::debug!(?removed, "auto-cleared completed downloads");
                self.events
                    .extend(removed.into_iter().map(|id| ManagerEvent::Removed { id }));
                self.invalidate_scheduler();
            }
        }

        self.collect_events();
        self.start_next(now);
    }
}
