//! Persisted form of a download.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::checksum::HashSpec;
use crate::chunk::{Chunk, ChunkError};

use super::{
    lock_chunk, share, Compression, Download, DownloadError, DownloadId, DownloadOptions,
    DownloadState, Failure,
};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("bad chunk in snapshot: {0}")]
    Chunk(#[from] ChunkError),
}

/// `written` is the chunk's durable mark, the offset a reload resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub start: u64,
    #[serde(default)]
    pub end: Option<u64>,
    pub written: u64,
}

/// Every persisted field of a download. Fields missing from a stored record take
/// the values of [`DownloadSnapshot::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSnapshot {
    pub url: String,
    pub destination_dir: PathBuf,
    pub file_name: Option<String>,
    /// The name was given by the user and must not follow Content-Disposition.
    pub file_name_fixed: bool,
    pub mask: Option<String>,
    pub temp_path: Option<PathBuf>,
    pub state: DownloadState,
    pub total_size: u64,
    pub chunks: Vec<ChunkSnapshot>,
    /// 0 = default.
    pub max_chunks: usize,
    pub speed_limit: i64,
    pub resumable: bool,
    pub compression: Option<Compression>,
    pub hash: Option<HashSpec>,
    pub conflicts: u32,
    pub failure: Option<Failure>,
    pub started_at: Option<i64>,
}

impl Default for DownloadSnapshot {
    fn default() -> Self {
        Self {
            url: String::new(),
            destination_dir: PathBuf::new(),
            file_name: None,
            file_name_fixed: false,
            mask: None,
            temp_path: None,
            state: DownloadState::Queued,
            total_size: 0,
            chunks: Vec::new(),
            max_chunks: 0,
            speed_limit: -1,
            resumable: true,
            compression: None,
            hash: None,
            conflicts: 0,
            failure: None,
            started_at: None,
        }
    }
}

impl Download {
    pub fn to_snapshot(&self) -> DownloadSnapshot {
        let state = match self.state {
            DownloadState::Running => DownloadState::Queued,
            DownloadState::Paused if self.is_auto_retrying() => DownloadState::Queued,
            s => s,
        };
        let keeps_progress = self.resumable
            && matches!(
                self.state,
                DownloadState::Running
                    | DownloadState::Paused
                    | DownloadState::Queued
                    | DownloadState::Finishing
            );
        let chunks = if keeps_progress {
            self.chunks
                .iter()
                .map(|c| {
                    let c = lock_chunk(c);
                    ChunkSnapshot {
                        start: c.start(),
                        end: c.end(),
                        written: c.safe_bytes(),
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        let total_size = if self.resumable || self.state == DownloadState::Complete {
            self.total_size
        } else {
            0
        };
        DownloadSnapshot {
            url: self.url.clone(),
            destination_dir: self.destination_dir.clone(),
            file_name: Some(self.file_name.clone()),
            file_name_fixed: self.file_name_fixed,
            mask: self.mask.clone(),
            temp_path: self.temp_file.clone(),
            state,
            total_size,
            chunks,
            max_chunks: self.max_chunks,
            speed_limit: self.speed_limit,
            resumable: self.resumable,
            compression: self.compression,
            hash: self.hash.clone(),
            conflicts: self.conflicts,
            failure: self.failure.clone(),
            started_at: self.started_at,
        }
    }

    /// Rebuild a download from its record; chunks resume at their stored `written`.
    pub fn load(
        id: DownloadId,
        snap: DownloadSnapshot,
        default_chunks: usize,
    ) -> Result<Download, SnapshotError> {
        let opts = DownloadOptions {
            url: snap.url,
            destination_dir: snap.destination_dir,
            file_name: snap.file_name,
            mask: snap.mask,
            max_chunks: snap.max_chunks,
            speed_limit: snap.speed_limit,
            hash: snap.hash,
        };
        let mut d = Download::new(id, opts, default_chunks)?;
        d.file_name_fixed = snap.file_name_fixed;
        d.temp_file = snap.temp_path;
        d.total_size = snap.total_size;
        d.resumable = snap.resumable;
        d.compression = snap.compression;
        d.conflicts = snap.conflicts;
        d.failure = snap.failure;
        d.started_at = snap.started_at;
        d.state = match snap.state {
            DownloadState::Running | DownloadState::Finishing => DownloadState::Queued,
            s => s,
        };

        for c in &snap.chunks {
            d.chunks.push(share(Chunk::new(c.start, c.end, c.written)?));
        }
        d.chunks.sort_by_key(|c| lock_chunk(c).start());
        if !d.partitions_total() {
            tracing::warn!(download = id, "stored chunks do not cover the file; starting over");
            d.chunks.clear();
        }

        if d.state == DownloadState::Complete {
            d.partial_size = d.total_size;
        } else {
            d.refresh_partial_size();
        }
        Ok(d)
    }

    /// Chunks cover `[0, total_size)` without gaps or overlaps.
    fn partitions_total(&self) -> bool {
        if self.total_size == 0 {
            return self.chunks.len() <= 1 && self.chunks.iter().all(|c| lock_chunk(c).start() == 0);
        }
        let mut next = 0u64;
        for shared in &self.chunks {
            let c = lock_chunk(shared);
            let Some(end) = c.end() else {
                return false;
            };
            if c.start() != next {
                return false;
            }
            next = end + 1;
        }
        self.chunks.is_empty() || next == self.total_size
    }
}
