//! Splitting and merging of a running download's chunks.

use std::sync::Arc;

use crate::bucket::BucketPool;
use crate::chunk::{Chunk, ChunkStorage};
use crate::memory::MemoryReporter;

use super::{lock_chunk, share, Download, DownloadError, DownloadState, SharedChunk};

/// What the manager knows when a download may grow.
pub struct ResumeContext<'a> {
    pub offline: bool,
    pub min_chunk_size: u64,
    /// Bytes carved off the tail of a single-chunk download first; 0 = off.
    pub load_end_first: u64,
    /// Connections this download may hold on its server given the other downloads' load.
    pub server_slots: Option<usize>,
    pub buckets: &'a BucketPool,
    pub server_speed_limit: i64,
    pub memory: MemoryReporter,
}

impl Download {
    /// Chunk cap for this scheduling opportunity.
    fn chunk_cap(&self, ctx: &ResumeContext<'_>) -> usize {
        let cap = if self.resumable { self.max_chunks() } else { 1 };
        match ctx.server_slots {
            Some(slots) => cap.min(slots.max(1)),
            None => cap,
        }
    }

    /// Merge adjacent complete, idle, unbuffered chunks, walking backwards.
    pub(crate) fn merge_finished_chunks(&mut self) {
        let mut i = self.chunks.len();
        while i > 1 {
            i -= 1;
            let (left, right) = (&self.chunks[i - 1], &self.chunks[i]);
            let merged = {
                let next = lock_chunk(right);
                let mut prev = lock_chunk(left);
                let mergeable = |c: &Chunk| c.complete() && !c.running() && c.buffered() == 0;
                if mergeable(&prev) && mergeable(&next) && !next.is_starter() {
                    prev.merge(&next).is_ok()
                } else {
                    false
                }
            };
            if merged {
                self.chunks.remove(i);
            }
        }
    }

    /// Start connections up to the chunk cap: resume paused chunks first, then carve
    /// off the tail when configured, then split the biggest running chunk.
    ///
    /// Returns the chunks that were opened and now need a connection.
    pub fn resume_download(
        &mut self,
        ctx: &ResumeContext<'_>,
    ) -> Result<Vec<SharedChunk>, DownloadError> {
        if self.state != DownloadState::Running {
            return Ok(Vec::new());
        }
        self.merge_finished_chunks();
        let cap = self.chunk_cap(ctx);
        let mut active = self.active_chunks();
        if ctx.offline || active >= cap {
            return Ok(Vec::new());
        }
        let storage = self.storage.clone().ok_or(DownloadError::NoStorage)?;
        let mut started = Vec::new();

        if self.chunks.is_empty() {
            let starter = share(Chunk::starter());
            self.open_chunk(&starter, &storage, ctx)?;
            self.chunks.push(Arc::clone(&starter));
            started.push(starter);
            return Ok(started);
        }

        let mut paused: Vec<usize> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                let c = lock_chunk(c);
                !c.running() && !c.complete()
            })
            .map(|(i, _)| i)
            .collect();
        paused.reverse();
        // Indices shift when new chunks are inserted, so paused chunks go first.
        while active < cap {
            let Some(i) = paused.pop() else { break };
            let reopen = lock_chunk(&self.chunks[i]).was_opened();
            if reopen {
                let fresh = lock_chunk(&self.chunks[i]).clone_for_resume();
                self.chunks[i] = share(fresh);
            }
            let chunk = Arc::clone(&self.chunks[i]);
            self.open_chunk(&chunk, &storage, ctx)?;
            started.push(chunk);
            active += 1;
        }

        while active < cap {
            let Some((at, chunk)) = self.carve_chunk(ctx)? else {
                break;
            };
            self.open_chunk(&chunk, &storage, ctx)?;
            self.chunks.insert(at, Arc::clone(&chunk));
            started.push(chunk);
            active += 1;
        }

        if active == 0 {
            let stalled = self.chunks.iter().any(|c| {
                let c = lock_chunk(c);
                !c.running() && !c.complete()
            });
            if stalled {
                tracing::error!(download = self.id, "no chunk running although some are incomplete");
                self.dump_scoreboard();
                return Err(DownloadError::Inconsistent);
            }
        }
        Ok(started)
    }

    /// Pick the next new chunk: the tail of a lone chunk when load-end-first applies,
    /// otherwise the back half of the biggest running chunk. Returns the insert position.
    fn carve_chunk(
        &mut self,
        ctx: &ResumeContext<'_>,
    ) -> Result<Option<(usize, SharedChunk)>, DownloadError> {
        let lef = ctx.load_end_first;
        if self.chunks.len() == 1 && lef > 0 {
            let mut c = lock_chunk(&self.chunks[0]);
            if let (Some(end), Some(rem)) = (c.end(), c.remainder()) {
                if rem > 3 * lef {
                    let new_end = end - lef;
                    c.set_end(Some(new_end))?;
                    drop(c);
                    let tail = Chunk::new(new_end + 1, Some(end), 0)?;
                    tracing::debug!(download = self.id, tail = %tail, "loading end first");
                    return Ok(Some((1, share(tail))));
                }
            }
        }

        let mut biggest: Option<(usize, u64)> = None;
        for (i, shared) in self.chunks.iter().enumerate() {
            let c = lock_chunk(shared);
            if !c.running() {
                continue;
            }
            if let Some(r) = c.remainder() {
                if r > 2 * ctx.min_chunk_size && biggest.map_or(true, |(_, br)| r > br) {
                    biggest = Some((i, r));
                }
            }
        }
        let Some((i, remainder)) = biggest else {
            return Ok(None);
        };
        let mut c = lock_chunk(&self.chunks[i]);
        let Some(end) = c.end() else {
            return Ok(None);
        };
        let new_end = c.position() + remainder / 2;
        c.set_end(Some(new_end))?;
        let back = Chunk::new(new_end + 1, Some(end), 0)?;
        tracing::debug!(download = self.id, front = %c, back = %back, "split chunk");
        Ok(Some((i + 1, share(back))))
    }

    fn open_chunk(
        &self,
        chunk: &SharedChunk,
        storage: &Arc<dyn ChunkStorage>,
        ctx: &ResumeContext<'_>,
    ) -> Result<(), DownloadError> {
        let tee = ctx
            .buckets
            .tee(self.bucket.clone(), &self.host, ctx.server_speed_limit);
        lock_chunk(chunk).open(storage.as_ref(), tee, ctx.memory.clone())?;
        Ok(())
    }
}
