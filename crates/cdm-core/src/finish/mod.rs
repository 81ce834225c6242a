//! Finishing a transferred download: verify, decompress or move into place.
//!
//! Runs off the control thread; the manager hands a [`FinishJob`] to a
//! [`Finisher`] and applies the result with `on_finished`.

mod mover;

#[cfg(test)]
mod tests;

pub use mover::{conflict_name, move_file, resolve_destination};

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::checksum::{piece_mismatches, sha256_path, ByteRange, HashSpec};
use crate::config::VerifyErrorAction;
use crate::download::{Compression, DownloadId};

/// Everything the finisher needs; produced by `Download::finish_download`.
#[derive(Debug, Clone)]
pub struct FinishJob {
    pub id: DownloadId,
    pub temp_path: PathBuf,
    pub destination: PathBuf,
    pub total_size: u64,
    pub hash: Option<HashSpec>,
    pub compression: Option<Compression>,
    pub conflicts: u32,
}

/// Where the file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub path: PathBuf,
    pub conflicts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FinishError {
    /// Whole-file hash mismatch. `mismatches` lists bad ranges when piece hashes
    /// located them; empty means the whole file is suspect.
    #[error("checksum mismatch ({} bad ranges)", mismatches.len())]
    Verification { mismatches: Vec<ByteRange> },
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("cannot move to destination: {0}")]
    Move(String),
}

pub trait Finisher: Send + Sync {
    fn finish(&self, job: &FinishJob) -> Result<Finished, FinishError>;
}

/// Finisher working on local files.
#[derive(Debug, Clone)]
pub struct FileFinisher {
    pub overwrite: bool,
    pub on_verify_error: VerifyErrorAction,
    pub move_attempts: u32,
}

impl Default for FileFinisher {
    fn default() -> Self {
        Self {
            overwrite: false,
            on_verify_error: VerifyErrorAction::Recover,
            move_attempts: 5,
        }
    }
}

impl FileFinisher {
    pub fn new(on_verify_error: VerifyErrorAction) -> Self {
        Self {
            on_verify_error,
            ..Self::default()
        }
    }

    /// Check the received bytes against the expected hashes.
    fn verify(&self, job: &FinishJob) -> Result<(), FinishError> {
        let Some(hash) = &job.hash else {
            return Ok(());
        };
        let mut mismatches = Vec::new();
        let mut bad = false;
        if let Some(expected) = &hash.sha256 {
            let actual = sha256_path(&job.temp_path).map_err(io::Error::other)?;
            if !actual.eq_ignore_ascii_case(expected) {
                tracing::warn!(download = job.id, %expected, %actual, "sha256 mismatch");
                bad = true;
            }
        }
        if let Some(pieces) = &hash.pieces {
            mismatches = piece_mismatches(&job.temp_path, pieces, job.total_size)
                .map_err(io::Error::other)?;
            bad |= !mismatches.is_empty();
        }
        if !bad {
            tracing::debug!(download = job.id, "verified");
            return Ok(());
        }
        if self.on_verify_error == VerifyErrorAction::Keep {
            tracing::warn!(download = job.id, "keeping file despite checksum mismatch");
            return Ok(());
        }
        Err(FinishError::Verification { mismatches })
    }
}

impl Finisher for FileFinisher {
    fn finish(&self, job: &FinishJob) -> Result<Finished, FinishError> {
        trim_to_size(&job.temp_path, job.total_size)?;
        self.verify(job)?;
        let (dest, conflicts) = resolve_destination(&job.destination, job.conflicts, self.overwrite)
            .map_err(|e| FinishError::Move(format!("{}: {e}", job.destination.display())))?;
        match job.compression {
            Some(c) => decompress(&job.temp_path, &dest, c)?,
            None => move_file(&job.temp_path, &dest, self.move_attempts)
                .map_err(|e| FinishError::Move(format!("{}: {e}", dest.display())))?,
        }
        tracing::info!(download = job.id, path = %dest.display(), "download finished");
        Ok(Finished {
            path: dest,
            conflicts,
        })
    }
}

/// Preallocation can leave the file longer than the data when the size was
/// unknown at first; cut it to what was received.
fn trim_to_size(path: &Path, total_size: u64) -> io::Result<()> {
    if total_size == 0 {
        return Ok(());
    }
    let f = OpenOptions::new().write(true).open(path)?;
    if f.metadata()?.len() > total_size {
        f.set_len(total_size)?;
    }
    Ok(())
}

/// Decode `src` into `dest` and remove `src`. Deflate bodies are usually zlib
/// wrapped; raw deflate is tried when that fails.
fn decompress(src: &Path, dest: &Path, compression: Compression) -> io::Result<()> {
    let result = match compression {
        Compression::Gzip => decode_with(src, dest, |r| {
            Box::new(flate2::bufread::MultiGzDecoder::new(r))
        }),
        Compression::Deflate => decode_with(src, dest, |r| {
            Box::new(flate2::bufread::ZlibDecoder::new(r))
        })
        .or_else(|_| {
            decode_with(src, dest, |r| {
                Box::new(flate2::bufread::DeflateDecoder::new(r))
            })
        }),
    };
    match result {
        Ok(()) => std::fs::remove_file(src),
        Err(e) => {
            let _ = std::fs::remove_file(dest);
            Err(e)
        }
    }
}

fn decode_with(
    src: &Path,
    dest: &Path,
    decoder: impl FnOnce(BufReader<File>) -> Box<dyn io::Read>,
) -> io::Result<()> {
    let mut reader = decoder(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dest)?);
    io::copy(&mut reader, &mut writer)?;
    let f = writer.into_inner().map_err(|e| e.into_error())?;
    f.sync_all()
}
