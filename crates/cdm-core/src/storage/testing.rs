//! In-memory storage for unit tests of chunks, downloads and the manager.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::chunk::{ChunkSink, ChunkStorage, StorageFactory};

#[derive(Debug, Default)]
pub(crate) struct MemState {
    pub(crate) data: Vec<u8>,
    pub(crate) preallocated: u64,
    /// Scripted per-offer behaviour: `Some(n)` accepts at most n bytes, `None` would-blocks.
    pub(crate) script: VecDeque<Option<usize>>,
    /// Offers fail with this error kind once set.
    pub(crate) fail_with: Option<io::ErrorKind>,
    /// `finish` fails once set.
    pub(crate) fail_finish: bool,
    pub(crate) opened_at: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemStorage {
    pub(crate) state: Arc<Mutex<MemState>>,
}

impl MemStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut MemState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn data(&self) -> Vec<u8> {
        self.with(|s| s.data.clone())
    }
}

struct MemSink {
    storage: MemStorage,
    position: u64,
}

impl ChunkSink for MemSink {
    fn offer(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut st = self.storage.state.lock().unwrap();
        if let Some(kind) = st.fail_with {
            return Err(kind.into());
        }
        let n = match st.script.pop_front() {
            Some(None) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(Some(n)) => n.min(data.len()),
            None => data.len(),
        };
        let start = self.position as usize;
        let end = start + n;
        if st.data.len() < end {
            st.data.resize(end, 0);
        }
        st.data[start..end].copy_from_slice(&data[..n]);
        self.position += n as u64;
        Ok(n)
    }

    fn pending(&self) -> u64 {
        0
    }

    fn wait_writable(&self, _timeout: Duration) {}

    fn finish(self: Box<Self>) -> io::Result<()> {
        if self.storage.with(|s| s.fail_finish) {
            return Err(io::Error::new(io::ErrorKind::Other, "finish failed"));
        }
        Ok(())
    }
}

impl ChunkStorage for MemStorage {
    fn open_sink(&self, position: u64) -> io::Result<Box<dyn ChunkSink>> {
        self.with(|s| s.opened_at.push(position));
        Ok(Box::new(MemSink {
            storage: self.clone(),
            position,
        }))
    }

    fn preallocate(&self, size: u64) -> io::Result<()> {
        self.with(|s| s.preallocated = s.preallocated.max(size));
        Ok(())
    }
}

/// Factory handing out one shared [`MemStorage`] per path.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemStorageFactory {
    pub(crate) files: Arc<Mutex<std::collections::HashMap<std::path::PathBuf, MemStorage>>>,
    pub(crate) fail_open: Arc<Mutex<Option<io::ErrorKind>>>,
}

impl MemStorageFactory {
    pub(crate) fn get(&self, path: &std::path::Path) -> Option<MemStorage> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

impl StorageFactory for MemStorageFactory {
    fn open(&self, path: &std::path::Path, keep_existing: bool) -> io::Result<Arc<dyn ChunkStorage>> {
        if let Some(kind) = *self.fail_open.lock().unwrap() {
            return Err(kind.into());
        }
        let mut files = self.files.lock().unwrap();
        let storage = files.entry(path.to_path_buf()).or_default().clone();
        if !keep_existing {
            storage.with(|s| s.data.clear());
        }
        Ok(Arc::new(storage))
    }
}
