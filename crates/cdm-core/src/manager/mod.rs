//! Manager: owns the queue and drives every download from one control thread.
//!
//! It never talks to the network itself. Connections are requested through
//! [`Manager::take_requests`], finished files through [`Manager::take_finish_jobs`],
//! and whatever should be persisted or shown comes out of [`Manager::take_events`].
//! The transfer engine (or a test) feeds results back in with
//! [`Manager::on_response`], [`Manager::on_connection_done`] and
//! [`Manager::on_finished`].

mod events;
mod run;


use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bucket::BucketPool;
use crate::chunk::StorageFactory;
use crate::config::CdmConfig;
use crate::download::{
    AutoRetry, Download, DownloadError, DownloadId, DownloadOptions, DownloadSnapshot,
    DownloadState, SharedChunk, SnapshotError,
};
use crate::finish::FinishJob;
use crate::memory::MemoryReporter;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::server::{HostKey, ServerLimits};
use crate::storage::{DiskStorageFactory, DiskWriter};

/// How often running downloads are persisted while they make progress.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// A chunk that needs a connection.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub download: DownloadId,
    pub chunk: SharedChunk,
    pub url: String,
    /// First byte to request.
    pub position: u64,
    /// Inclusive last byte, `None` for an open-ended request.
    pub end: Option<u64>,
}

impl ConnectionRequest {
    /// Value for the HTTP Range header without the `bytes=` prefix.
    pub fn range(&self) -> String {
        match self.end {
            Some(end) => format!("{}-{}", self.position, end),
            None => format!("{}-", self.position),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    StateChanged {
        id: DownloadId,
        from: DownloadState,
        to: DownloadState,
    },
    /// Persist this record.
    Snapshot {
        id: DownloadId,
        snapshot: DownloadSnapshot,
    },
    Progress {
        id: DownloadId,
        partial_size: u64,
        total_size: u64,
        bytes_per_sec: u64,
    },
    /// Removed from the queue (auto-clear or explicit removal).
    Removed { id: DownloadId },
}

pub struct Manager {
    config: CdmConfig,
    limits: ServerLimits,
    retry_policy: RetryPolicy,
    queue: Vec<Download>,
    scheduler: Option<Scheduler>,
    buckets: BucketPool,
    memory: MemoryReporter,
    storage: Arc<dyn StorageFactory>,
    offline: bool,
    next_id: DownloadId,
    requests: Vec<ConnectionRequest>,
    finish_jobs: Vec<FinishJob>,
    events: Vec<ManagerEvent>,
    last_snapshot: Option<Instant>,
}

impl Manager {
    pub fn new(config: CdmConfig, storage: Arc<dyn StorageFactory>, memory: MemoryReporter) -> Self {
        let config = config.normalized();
        Self {
            limits: ServerLimits::from_config(&config),
            retry_policy: config.retry_policy(),
            buckets: BucketPool::new(config.speed_limit),
            config,
            queue: Vec::new(),
            scheduler: None,
            memory,
            storage,
            offline: false,
            next_id: 1,
            requests: Vec::new(),
            finish_jobs: Vec::new(),
            events: Vec::new(),
            last_snapshot: None,
        }
    }

    /// Manager writing temp files through the process-wide disk writer.
    pub fn with_disk(config: CdmConfig) -> io::Result<Self> {
        let memory = MemoryReporter::new(config.max_buffered_bytes);
        let writer = DiskWriter::spawn()?;
        let storage = Arc::new(DiskStorageFactory::new(writer, memory.clone()));
        Ok(Self::new(config, storage, memory))
    }

    pub fn config(&self) -> &CdmConfig {
        &self.config
    }

    pub fn downloads(&self) -> &[Download] {
        &self.queue
    }

    pub fn get(&self, id: DownloadId) -> Option<&Download> {
        self.queue.iter().find(|d| d.id() == id)
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn buckets(&self) -> &BucketPool {
        &self.buckets
    }

    pub fn memory(&self) -> &MemoryReporter {
        &self.memory
    }

    pub fn count(&self, state: DownloadState) -> usize {
        self.queue.iter().filter(|d| d.state() == state).count()
    }

    /// Nothing left to do: no download running or finishing, none waiting for an
    /// auto-retry, and none queued (queued ones do not count while offline).
    pub fn is_idle(&self) -> bool {
        self.queue.iter().all(|d| match d.state() {
            DownloadState::Running | DownloadState::Finishing => false,
            DownloadState::Queued => self.offline,
            DownloadState::Paused => !d.is_auto_retrying(),
            DownloadState::Complete | DownloadState::Canceled => true,
        })
    }

    fn index_of(&self, id: DownloadId) -> Option<usize> {
        self.queue.iter().position(|d| d.id() == id)
    }

    fn default_chunks(&self, url: &str) -> usize {
        HostKey::from_url(url)
            .ok()
            .and_then(|h| self.limits.segments(&h))
            .unwrap_or(self.config.max_chunks)
    }

    fn auto_retry_settings(&self) -> AutoRetry {
        AutoRetry {
            interval: Duration::from_secs(self.config.auto_retry_interval_secs),
            max_retries: self.config.max_auto_retries,
        }
    }

    fn invalidate_scheduler(&mut self) {
        if self.scheduler.take().is_some() {
            tracing::debug!("scheduler discarded");
        }
    }

    /// Enqueue a new download at the end of the queue.
    pub fn add(&mut self, mut opts: DownloadOptions) -> Result<DownloadId, DownloadError> {
        if opts.destination_dir.as_os_str().is_empty() {
            opts.destination_dir = self
                .config
                .download_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
        }
        if opts.mask.is_none() {
            opts.mask = self.config.default_mask.clone();
        }
        let id = self.next_id;
        let default_chunks = self.default_chunks(&opts.url);
        let download = Download::new(id, opts, default_chunks)?;
        tracing::info!(download = id, url = %download.url(), "download added");
        self.next_id += 1;
        self.events.push(ManagerEvent::Snapshot {
            id,
            snapshot: download.to_snapshot(),
        });
        self.queue.push(download);
        self.invalidate_scheduler();
        Ok(id)
    }

    /// Put a persisted download back at the end of the queue under its stored id.
    pub fn restore(&mut self, id: DownloadId, snapshot: DownloadSnapshot) -> Result<(), SnapshotError> {
        if self.index_of(id).is_some() {
            tracing::warn!(download = id, "duplicate id in stored queue; skipping");
            return Ok(());
        }
        let default_chunks = self.default_chunks(&snapshot.url);
        let download = Download::load(id, snapshot, default_chunks)?;
        self.next_id = self.next_id.max(id + 1);
        self.queue.push(download);
        self.invalidate_scheduler();
        Ok(())
    }

    /// Take a download out of the queue. Unfinished downloads are canceled first so
    /// their temp file goes away.
    pub fn remove(&mut self, id: DownloadId) -> Option<Download> {
        let idx = self.index_of(id)?;
        let mut d = self.queue.remove(idx);
        if d.state() != DownloadState::Complete {
            d.cancel();
        }
        d.take_transitions();
        self.events.push(ManagerEvent::Removed { id });
        self.invalidate_scheduler();
        Some(d)
    }

    /// Move a download to queue position `pos` (clamped).
    pub fn move_to(&mut self, id: DownloadId, pos: usize) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        let d = self.queue.remove(idx);
        let pos = pos.min(self.queue.len());
        self.queue.insert(pos, d);
        self.invalidate_scheduler();
        true
    }

    pub fn pause(&mut self, id: DownloadId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        self.queue[idx].pause();
        self.collect_events();
        true
    }

    /// Queue a paused or canceled download again.
    pub fn resume(&mut self, id: DownloadId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        let d = &mut self.queue[idx];
        if !matches!(d.state(), DownloadState::Paused | DownloadState::Canceled) {
            return false;
        }
        d.queue();
        self.collect_events();
        true
    }

    pub fn cancel(&mut self, id: DownloadId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        let d = &mut self.queue[idx];
        if matches!(d.state(), DownloadState::Complete | DownloadState::Finishing) {
            return false;
        }
        d.cancel();
        self.collect_events();
        true
    }

    /// Discard progress and download again from scratch.
    pub fn retry(&mut self, id: DownloadId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        let d = &mut self.queue[idx];
        if matches!(d.state(), DownloadState::Complete | DownloadState::Finishing) {
            return false;
        }
        d.safe_retry();
        self.collect_events();
        true
    }

    /// Going offline puts running downloads back in the queue; nothing starts
    /// or grows until the manager is online again.
    pub fn set_offline(&mut self, offline: bool) {
        if self.offline == offline {
            return;
        }
        self.offline = offline;
        tracing::info!(offline, "offline mode changed");
        if offline {
            for d in self
                .queue
                .iter_mut()
                .filter(|d| d.state() == DownloadState::Running)
            {
                d.queue();
            }
        }
        self.collect_events();
    }

    pub fn set_max_chunks(&mut self, id: DownloadId, max_chunks: usize, now: Instant) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        match self.queue[idx].set_max_chunks(max_chunks) {
            Ok(true) => self.resume_connections(idx, now),
            Ok(false) => {}
            Err(e) => self.storage_failed(idx, e.failure(), now),
        }
        self.collect_events();
        true
    }

    pub fn set_speed_limit(&mut self, id: DownloadId, limit: i64) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        self.queue[idx].set_speed_limit(limit);
        self.events.push(ManagerEvent::Snapshot {
            id,
            snapshot: self.queue[idx].to_snapshot(),
        });
        true
    }

    pub fn set_global_speed_limit(&mut self, limit: i64) {
        self.config.speed_limit = crate::config::normalize_rate(limit);
        self.buckets.set_global_rate(self.config.speed_limit);
    }

    /// Put every running download back in the queue so its progress is saved and
    /// the next session continues it.
    pub fn shutdown(&mut self) {
        for d in self
            .queue
            .iter_mut()
            .filter(|d| d.state() == DownloadState::Running)
        {
            d.queue();
        }
        self.requests.clear();
        self.collect_events();
    }

    pub fn take_requests(&mut self) -> Vec<ConnectionRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn take_finish_jobs(&mut self) -> Vec<FinishJob> {
        std::mem::take(&mut self.finish_jobs)
    }

    pub fn take_events(&mut self) -> Vec<ManagerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Turn recorded state transitions into events. A download that went back to
    /// QUEUED invalidates the scheduler.
    fn collect_events(&mut self) {
        let mut requeued = false;
        for d in &mut self.queue {
            let transitions = d.take_transitions();
            if transitions.is_empty() {
                continue;
            }
            for t in transitions {
                requeued |= t.to == DownloadState::Queued;
                self.events.push(ManagerEvent::StateChanged {
                    id: d.id(),
                    from: t.from,
                    to: t.to,
                });
            }
            self.events.push(ManagerEvent::Snapshot {
                id: d.id(),
                snapshot: d.to_snapshot(),
            });
        }
        if requeued {
            self.invalidate_scheduler();
        }
    }
}
