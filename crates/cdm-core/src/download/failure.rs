//! User-visible failure categories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

use crate::chunk::ChunkError;
use crate::retry::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AccessError,
    RangeRejected,
    PathTooLong,
    DestinationInaccessible,
    DiskFull,
    Timeout,
    Network,
    Http(u32),
    Verification,
    Move,
    Internal,
}

impl FailureKind {
    pub fn message(self) -> String {
        match self {
            FailureKind::AccessError => "cannot write the download file".into(),
            FailureKind::RangeRejected => "server does not support resuming".into(),
            FailureKind::PathTooLong => "path is too long".into(),
            FailureKind::DestinationInaccessible => "destination is not accessible".into(),
            FailureKind::DiskFull => "disk is full".into(),
            FailureKind::Timeout => "timed out".into(),
            FailureKind::Network => "network error".into(),
            FailureKind::Http(code) => format!("server responded with HTTP {code}"),
            FailureKind::Verification => "checksum mismatch".into(),
            FailureKind::Move => "could not move the file to its destination".into(),
            FailureKind::Internal => "internal error".into(),
        }
    }

    /// Category for a failed disk operation.
    pub fn from_io(e: &io::Error) -> Self {
        #[cfg(unix)]
        {
            match e.raw_os_error() {
                Some(libc::ENOSPC) | Some(libc::EDQUOT) => return FailureKind::DiskFull,
                Some(libc::ENAMETOOLONG) => return FailureKind::PathTooLong,
                Some(libc::EROFS) => return FailureKind::DestinationInaccessible,
                _ => {}
            }
        }
        match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                FailureKind::DestinationInaccessible
            }
            _ => FailureKind::AccessError,
        }
    }

    pub fn from_connection(e: &ConnectionError) -> Self {
        match e {
            ConnectionError::Curl(ce) if ce.is_operation_timedout() => FailureKind::Timeout,
            ConnectionError::Curl(_) | ConnectionError::PartialTransfer { .. } => {
                FailureKind::Network
            }
            ConnectionError::Http(code) => FailureKind::Http(*code),
            ConnectionError::RangeRejected => FailureKind::RangeRejected,
            ConnectionError::Storage(io) => FailureKind::from_io(io),
        }
    }

    pub fn from_chunk(e: &ChunkError) -> Self {
        match e {
            ChunkError::Io(io) => FailureKind::from_io(io),
            _ => FailureKind::Internal,
        }
    }
}

/// Why a download stopped, shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            f.write_str(&self.kind.message())
        } else {
            write!(f, "{}: {}", self.kind.message(), self.detail)
        }
    }
}
