//! Bounded pipe between one chunk session and the disk writer.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::chunk::ChunkSink;
use crate::memory::MemoryReporter;

use super::file::TempFile;
use super::writer::{DiskWriter, WriteJob};

#[derive(Debug, Default)]
struct PipeState {
    in_flight: u64,
    error: Option<(io::ErrorKind, String)>,
}

/// Shared between a [`PipeSink`] and the write jobs it submitted.
#[derive(Debug)]
pub(crate) struct Pipe {
    state: Mutex<PipeState>,
    cond: Condvar,
    memory: MemoryReporter,
}

impl Pipe {
    fn new(memory: MemoryReporter) -> Self {
        Self {
            state: Mutex::new(PipeState::default()),
            cond: Condvar::new(),
            memory,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn complete(&self, len: u64) {
        let mut st = self.lock();
        st.in_flight = st.in_flight.saturating_sub(len);
        self.memory.sub(len);
        self.cond.notify_all();
    }

    pub(crate) fn fail(&self, err: io::Error, len: u64) {
        let mut st = self.lock();
        st.in_flight = st.in_flight.saturating_sub(len);
        if st.error.is_none() {
            st.error = Some((err.kind(), err.to_string()));
        }
        self.memory.sub(len);
        self.cond.notify_all();
    }
}

fn to_io((kind, msg): &(io::ErrorKind, String)) -> io::Error {
    io::Error::new(*kind, msg.clone())
}

/// Sink feeding the disk writer, holding at most `capacity` bytes in flight.
pub struct PipeSink {
    pipe: Arc<Pipe>,
    file: TempFile,
    writer: DiskWriter,
    position: u64,
    capacity: u64,
}

impl PipeSink {
    pub(crate) fn new(
        file: TempFile,
        writer: DiskWriter,
        memory: MemoryReporter,
        position: u64,
        capacity: u64,
    ) -> Self {
        Self {
            pipe: Arc::new(Pipe::new(memory)),
            file,
            writer,
            position,
            capacity: capacity.max(1),
        }
    }
}

impl ChunkSink for PipeSink {
    fn offer(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let n = {
            let mut st = self.pipe.lock();
            if let Some(err) = &st.error {
                return Err(to_io(err));
            }
            let room = self.capacity.saturating_sub(st.in_flight);
            if room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = room.min(data.len() as u64);
            st.in_flight += n;
            n as usize
        };
        self.pipe.memory.add(n as u64);
        self.writer.submit(WriteJob {
            file: self.file.clone(),
            offset: self.position,
            data: data[..n].to_vec(),
            pipe: Arc::clone(&self.pipe),
        })?;
        self.position += n as u64;
        Ok(n)
    }

    fn pending(&self) -> u64 {
        self.pipe.lock().in_flight
    }

    fn wait_writable(&self, timeout: Duration) {
        let st = self.pipe.lock();
        if st.in_flight < self.capacity || st.error.is_some() {
            return;
        }
        let _ = self.pipe.cond.wait_timeout(st, timeout);
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut st = self.pipe.lock();
        while st.in_flight > 0 && st.error.is_none() {
            st = self
                .pipe
                .cond
                .wait(st)
                .unwrap_or_else(|p| p.into_inner());
        }
        match &st.error {
            Some(err) => Err(to_io(err)),
            None => Ok(()),
        }
    }
}
