//! Failure reported by a connection when its transfer ends unsuccessfully.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Curl reported an error (timeout, connection, etc.).
    #[error("{0}")]
    Curl(#[from] curl::Error),
    /// HTTP response had a non-2xx status.
    #[error("HTTP {0}")]
    Http(u32),
    /// A bounded chunk got something other than a matching 206 response.
    #[error("server does not honour the range request")]
    RangeRejected,
    /// Connection closed before the bounded chunk was filled.
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },
    /// Writing the received bytes failed.
    #[error("storage: {0}")]
    Storage(io::Error),
}
