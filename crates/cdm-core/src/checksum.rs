//! Checksum verification (SHA-256) of finished downloads.
//!
//! Runs on the finisher, not inline with the transfer path. Besides the
//! whole-file digest, optional piece hashes locate the byte ranges that need
//! to be fetched again.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Expected hashes for a download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSpec {
    /// Lowercase hex SHA-256 of the whole file.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub pieces: Option<PieceHashes>,
}

impl HashSpec {
    pub fn sha256(hex: impl Into<String>) -> Self {
        Self {
            sha256: Some(hex.into().to_ascii_lowercase()),
            pieces: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sha256.is_none() && self.pieces.is_none()
    }
}

/// SHA-256 of consecutive `piece_size` pieces; the last one may be short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceHashes {
    pub piece_size: u64,
    pub sha256: Vec<String>,
}

/// Inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Compute SHA-256 of a file and return the digest as lowercase hex.
pub fn sha256_path(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash the file piece by piece and return the mismatching ranges, adjacent ones coalesced.
/// Pieces beyond the end of the file count as mismatches.
pub fn piece_mismatches(path: &Path, pieces: &PieceHashes, total_size: u64) -> Result<Vec<ByteRange>> {
    anyhow::ensure!(pieces.piece_size > 0, "piece size must be positive");
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out: Vec<ByteRange> = Vec::new();
    let mut buf = vec![0u8; BUF_SIZE];
    for (i, expected) in pieces.sha256.iter().enumerate() {
        let start = i as u64 * pieces.piece_size;
        if start >= total_size {
            break;
        }
        let end = (start + pieces.piece_size).min(total_size) - 1;
        let mut left = end - start + 1;
        let mut hasher = Sha256::new();
        let mut short = false;
        while left > 0 {
            let want = left.min(BUF_SIZE as u64) as usize;
            let n = f
                .read(&mut buf[..want])
                .with_context(|| format!("read {}", path.display()))?;
            if n == 0 {
                short = true;
                break;
            }
            hasher.update(&buf[..n]);
            left -= n as u64;
        }
        let ok = !short && hex::encode(hasher.finalize()).eq_ignore_ascii_case(expected);
        if !ok {
            match out.last_mut() {
                Some(last) if last.end + 1 == start => last.end = end,
                _ => out.push(ByteRange { start, end }),
            }
        }
    }
    Ok(out)
}
