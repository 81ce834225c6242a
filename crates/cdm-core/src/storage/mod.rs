//! Disk I/O for chunk pipelines.
//!
//! Every chunk session writes through a bounded [`PipeSink`] into the one
//! [`DiskWriter`] thread of the process, which performs positional writes on the
//! download's [`TempFile`] in the order the bytes were received.

mod file;
mod pipe;
mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use file::TempFile;
pub use pipe::PipeSink;
pub use writer::DiskWriter;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk::{ChunkSink, ChunkStorage, StorageFactory, MAX_PIPE_SEGMENTS, PIPE_SEGMENT_SIZE};
use crate::memory::MemoryReporter;

/// Temporary file suffix used before the final move.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: appends `.part` to the final path (e.g. `file.iso` → `file.iso.part`).
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

/// A download's temp file plus the shared writer feeding it.
pub struct DiskStorage {
    file: TempFile,
    writer: DiskWriter,
    memory: MemoryReporter,
}

impl DiskStorage {
    pub fn new(file: TempFile, writer: DiskWriter, memory: MemoryReporter) -> Self {
        Self {
            file,
            writer,
            memory,
        }
    }

    pub fn file(&self) -> &TempFile {
        &self.file
    }
}

impl ChunkStorage for DiskStorage {
    fn open_sink(&self, position: u64) -> io::Result<Box<dyn ChunkSink>> {
        Ok(Box::new(PipeSink::new(
            self.file.clone(),
            self.writer.clone(),
            self.memory.clone(),
            position,
            PIPE_SEGMENT_SIZE * MAX_PIPE_SEGMENTS,
        )))
    }

    fn preallocate(&self, size: u64) -> io::Result<()> {
        self.file.preallocate(size)
    }
}

/// Opens temp files on the local filesystem, creating the parent directory.
#[derive(Clone)]
pub struct DiskStorageFactory {
    writer: DiskWriter,
    memory: MemoryReporter,
}

impl DiskStorageFactory {
    pub fn new(writer: DiskWriter, memory: MemoryReporter) -> Self {
        Self { writer, memory }
    }
}

impl StorageFactory for DiskStorageFactory {
    fn open(&self, path: &Path, keep_existing: bool) -> io::Result<Arc<dyn ChunkStorage>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = TempFile::open(path, keep_existing)?;
        Ok(Arc::new(DiskStorage::new(
            file,
            self.writer.clone(),
            self.memory.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn temp_path_appends_part() {
        let p = temp_path(Path::new("file.iso"));
        assert_eq!(p.to_string_lossy(), "file.iso.part");
        let p2 = temp_path(Path::new("/tmp/archive.zip"));
        assert_eq!(p2.to_string_lossy(), "/tmp/archive.zip.part");
    }

    #[test]
    fn pipe_sinks_write_in_order_through_one_writer() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::spawn().unwrap();
        let memory = MemoryReporter::new(1 << 20);
        let factory = DiskStorageFactory::new(writer, memory.clone());
        let path = dir.path().join("sub").join("out.part");
        let storage = factory.open(&path, false).unwrap();
        storage.preallocate(20).unwrap();

        let mut a = storage.open_sink(0).unwrap();
        let mut b = storage.open_sink(10).unwrap();
        assert_eq!(a.offer(b"aaaa").unwrap(), 4);
        assert_eq!(b.offer(b"bbbb").unwrap(), 4);
        assert_eq!(a.offer(b"cccc").unwrap(), 4);
        a.finish().unwrap();
        b.finish().unwrap();
        assert_eq!(memory.pending_bytes(), 0);

        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content[0..8], b"aaaacccc");
        assert_eq!(&content[10..14], b"bbbb");
    }

    #[test]
    fn full_pipe_would_block_until_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.part");
        let writer = DiskWriter::spawn().unwrap();
        let memory = MemoryReporter::new(1 << 20);
        let file = TempFile::open(&path, false).unwrap();
        let mut sink = PipeSink::new(file, writer, memory, 0, 8);

        let first = sink.offer(&[1u8; 12]).unwrap();
        assert!(first <= 8, "never more than capacity in flight");
        let mut taken = first;
        while taken < 12 {
            match sink.offer(&[1u8; 12][taken..]) {
                Ok(n) => taken += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    sink.wait_writable(Duration::from_millis(10))
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        Box::new(sink).finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1u8; 12]);
    }
}
