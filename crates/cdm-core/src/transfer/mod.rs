//! Curl multi backend: one event loop on the control thread drives every
//! connection the manager asks for.
//!
//! Each connection is an Easy2 handle whose [`handler::ChunkHandler`] writes into
//! its chunk. A chunk that runs out of tokens (or disk buffer) pauses its handle;
//! the loop unpauses it once [`Chunk::run`](crate::chunk::Chunk::run) lets it go on.

mod easy;
mod handler;

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use curl::multi::{Easy2Handle, Multi};

use crate::download::{lock_chunk, DownloadId};
use crate::finish::{FinishError, Finished, Finisher};
use crate::manager::{Manager, ManagerEvent};
use crate::retry::ConnectionError;

use handler::ChunkHandler;

/// How often the manager's housekeeping pass runs.
pub const PROCESS_INTERVAL: Duration = Duration::from_secs(1);

const WAIT: Duration = Duration::from_millis(100);

/// Per-handle curl settings.
#[derive(Debug, Clone)]
pub struct CurlOptions {
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Receive buffer size; `None` leaves curl's default.
    pub buffer_size: Option<usize>,
}

impl Default for CurlOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            user_agent: concat!("cdm/", env!("CARGO_PKG_VERSION")).to_string(),
            buffer_size: None,
        }
    }
}

struct Active {
    handle: Easy2Handle<ChunkHandler>,
    download: DownloadId,
}

type FinishResult = (DownloadId, Result<Finished, FinishError>);

pub struct Engine {
    multi: Multi,
    opts: CurlOptions,
    active: Vec<Active>,
}

impl Engine {
    pub fn new(opts: CurlOptions) -> Self {
        Self {
            multi: Multi::new(),
            opts,
            active: Vec::new(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    /// Drive `manager` until nothing is queued, running or finishing. Setting `stop`
    /// puts running downloads back in the queue (their progress goes out as
    /// snapshot events) and returns once open connections and finish jobs are done.
    pub fn run_until_idle(
        &mut self,
        manager: &mut Manager,
        finisher: Arc<dyn Finisher>,
        mut on_event: impl FnMut(ManagerEvent),
        stop: &AtomicBool,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<FinishResult>();
        let mut finishing = 0usize;
        let mut last_process: Option<Instant> = None;
        let mut stopping = false;

        loop {
            let now = Instant::now();
            if !stopping && stop.load(Ordering::Relaxed) {
                tracing::info!("stop requested; saving progress");
                stopping = true;
                manager.shutdown();
            }
            if !stopping {
                if last_process.map_or(true, |t| now.duration_since(t) >= PROCESS_INTERVAL) {
                    manager.process(now);
                    last_process = Some(now);
                } else {
                    manager.start_next(now);
                }
            }

            for req in manager.take_requests() {
                let handle = easy::add_request(&self.multi, &req, &self.opts)?;
                self.active.push(Active {
                    handle,
                    download: req.download,
                });
            }
            for job in manager.take_finish_jobs() {
                finishing += 1;
                let tx = tx.clone();
                let finisher = Arc::clone(&finisher);
                std::thread::Builder::new()
                    .name(format!("cdm-finish-{}", job.id))
                    .spawn(move || {
                        let result = finisher.finish(&job);
                        let _ = tx.send((job.id, result));
                    })
                    .context("spawn finish thread")?;
            }

            if !self.active.is_empty() {
                self.multi
                    .perform()
                    .map_err(|e| anyhow::anyhow!("curl multi perform: {}", e))?;
            }
            self.forward_responses(manager, now);
            self.collect_done(manager, now)?;
            self.drop_aborted(manager, now)?;
            self.unpause_ready(now)?;

            while let Ok((id, result)) = rx.try_recv() {
                finishing -= 1;
                manager.on_finished(id, result);
            }
            for event in manager.take_events() {
                on_event(event);
            }

            if self.active.is_empty() && finishing == 0 && (stopping || manager.is_idle()) {
                break;
            }
            if self.active.is_empty() {
                std::thread::sleep(WAIT);
            } else {
                self.multi
                    .wait(&mut [], WAIT)
                    .map_err(|e| anyhow::anyhow!("curl multi wait: {}", e))?;
            }
        }
        // Events from the last finish results.
        for event in manager.take_events() {
            on_event(event);
        }
        tracing::debug!(stopping, "engine idle");
        Ok(())
    }

    /// Hand newly validated responses to the manager.
    fn forward_responses(&mut self, manager: &mut Manager, now: Instant) {
        for a in &mut self.active {
            let handler = a.handle.get_mut();
            if let Some(info) = handler.take_response() {
                let chunk = handler.chunk.clone();
                manager.on_response(a.download, &chunk, &info, now);
            }
        }
    }

    /// Settle the handles curl reports as done.
    fn collect_done(&mut self, manager: &mut Manager, now: Instant) -> Result<()> {
        let mut done: Vec<(usize, Result<(), curl::Error>)> = Vec::new();
        let active = &self.active;
        self.multi.messages(|msg| {
            for (i, a) in active.iter().enumerate() {
                if let Some(result) = msg.result_for2(&a.handle) {
                    done.push((i, result));
                    break;
                }
            }
        });
        done.sort_by(|a, b| b.0.cmp(&a.0));
        for (i, result) in done {
            let a = self.active.remove(i);
            let mut easy = self
                .multi
                .remove2(a.handle)
                .map_err(|e| anyhow::anyhow!("curl multi remove: {}", e))?;
            let code = easy.response_code().unwrap_or(0);
            let handler = easy.get_mut();
            handler.check_bodyless();
            let chunk = handler.chunk.clone();
            if let Some(info) = handler.take_response() {
                manager.on_response(a.download, &chunk, &info, now);
            }
            let outcome = handler.outcome(result);
            tracing::debug!(download = a.download, code, ?outcome, "connection done");
            manager.on_connection_done(a.download, &chunk, outcome, now);
        }
        Ok(())
    }

    /// Remove handles whose chunk the manager closed (pause, cancel, surplus chunk).
    fn drop_aborted(&mut self, manager: &mut Manager, now: Instant) -> Result<()> {
        let mut i = 0;
        while i < self.active.len() {
            if lock_chunk(&self.active[i].handle.get_ref().chunk).running() {
                i += 1;
                continue;
            }
            let a = self.active.swap_remove(i);
            let mut easy = self
                .multi
                .remove2(a.handle)
                .map_err(|e| anyhow::anyhow!("curl multi remove: {}", e))?;
            let handler = easy.get_mut();
            let chunk = handler.chunk.clone();
            let outcome = handler.outcome(Ok(()));
            manager.on_connection_done(a.download, &chunk, outcome, now);
        }
        Ok(())
    }

    /// Unpause handles whose chunk may take bytes again.
    fn unpause_ready(&mut self, now: Instant) -> Result<()> {
        for a in &mut self.active {
            let handler = a.handle.get_mut();
            if !handler.paused {
                continue;
            }
            let ready = {
                let mut c = lock_chunk(&handler.chunk);
                if !c.is_suspended() {
                    true
                } else if c.resume_due(now) {
                    match c.run(now) {
                        Ok(ready) => ready,
                        Err(e) => {
                            tracing::warn!(chunk = %c, error = %e, "chunk resume failed");
                            handler.error = Some(ConnectionError::Storage(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                e.to_string(),
                            )));
                            true
                        }
                    }
                } else {
                    false
                }
            };
            if ready {
                handler.paused = false;
                // The write callback may run right away and lock the chunk again.
                a.handle
                    .unpause_write()
                    .map_err(|e| anyhow::anyhow!("curl unpause: {}", e))?;
            }
        }
        Ok(())
    }
}
