//! Picks the queued download that gets the next execution slot.
//!
//! A [`Scheduler`] is a snapshot of the candidates in policy order, built by the
//! manager and thrown away whenever the queue changes. Every call to
//! [`Scheduler::next`] re-checks the live state and the live server load, so a
//! stale snapshot can skip but never return an ineligible download.

mod policy;


pub use policy::SchedulerPolicy;

use std::collections::VecDeque;
use std::time::Instant;

use crate::download::{Download, DownloadId, DownloadState};
use crate::server::{ServerLimits, ServerLoad};

#[derive(Debug)]
pub struct Scheduler {
    policy: SchedulerPolicy,
    candidates: VecDeque<DownloadId>,
}

impl Scheduler {
    /// Snapshot the queued downloads of `queue` (in queue order) for `policy`.
    pub fn build(policy: SchedulerPolicy, queue: &[Download]) -> Self {
        let queued: Vec<&Download> = queue
            .iter()
            .filter(|d| d.state() == DownloadState::Queued)
            .collect();
        let candidates = policy.order(&queued).into();
        tracing::debug!(?policy, ?candidates, "scheduler built");
        Self { policy, candidates }
    }

    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Next eligible download: still QUEUED, past any retry cooldown, and its server
    /// below the connection ceiling.
    pub fn next(
        &mut self,
        queue: &[Download],
        limits: &ServerLimits,
        now: Instant,
    ) -> Option<DownloadId> {
        let load = running_load(queue);
        let mut pos = 0;
        while pos < self.candidates.len() {
            let id = self.candidates[pos];
            let Some(d) = queue.iter().find(|d| d.id() == id) else {
                self.candidates.remove(pos);
                continue;
            };
            if d.state() != DownloadState::Queued {
                self.candidates.remove(pos);
                continue;
            }
            let cooling = d.retry_not_before().map_or(false, |t| now < t);
            if cooling || !load.has_room(d.host(), limits) {
                pos += 1;
                continue;
            }
            self.candidates.remove(pos);
            return Some(id);
        }
        None
    }
}

/// Server load of the running downloads in `queue`.
pub fn running_load(queue: &[Download]) -> ServerLoad {
    let mut load = ServerLoad::new();
    for d in queue.iter().filter(|d| d.state() == DownloadState::Running) {
        load.add(d.host(), d.active_chunks());
    }
    load
}
