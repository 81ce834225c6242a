//! Contract between a chunk and the disk side of its write pipeline.

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Bounded, ordered byte sink for one chunk session.
pub trait ChunkSink: Send {
    /// Queue up to `data.len()` bytes. Returns how many were taken; a full sink
    /// returns `ErrorKind::WouldBlock`. Any other error is a failed disk write.
    fn offer(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Bytes queued but not yet durable.
    fn pending(&self) -> u64;

    /// Block until the sink can take more bytes, at most `timeout`.
    fn wait_writable(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }

    /// Stop accepting bytes and wait until everything queued is on disk.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// The temp file a download's chunks write into.
pub trait ChunkStorage: Send + Sync {
    /// Open a sink writing at absolute file `position`.
    fn open_sink(&self, position: u64) -> io::Result<Box<dyn ChunkSink>>;

    /// Reserve `size` bytes on disk.
    fn preallocate(&self, size: u64) -> io::Result<()>;
}

/// Opens the temp file for a download.
pub trait StorageFactory: Send + Sync {
    /// `keep_existing` keeps bytes already present (resume); otherwise the file is truncated.
    fn open(&self, path: &std::path::Path, keep_existing: bool) -> io::Result<Arc<dyn ChunkStorage>>;
}
