//! The single disk writer thread. Jobs from every chunk are written in FIFO order.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use super::file::TempFile;
use super::pipe::Pipe;

pub(crate) struct WriteJob {
    pub(crate) file: TempFile,
    pub(crate) offset: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) pipe: Arc<Pipe>,
}

/// Cloneable handle to the writer thread. The thread exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct DiskWriter {
    tx: mpsc::Sender<WriteJob>,
}

impl DiskWriter {
    pub fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        thread::Builder::new()
            .name("cdm-disk-writer".into())
            .spawn(move || run(rx))?;
        Ok(Self { tx })
    }

    pub(crate) fn submit(&self, job: WriteJob) -> io::Result<()> {
        self.tx.send(job).map_err(|e| {
            // Nothing will ever drain these bytes.
            e.0.pipe.fail(io::Error::new(io::ErrorKind::BrokenPipe, "disk writer stopped"), e.0.data.len() as u64);
            io::Error::new(io::ErrorKind::BrokenPipe, "disk writer stopped")
        })
    }
}

fn run(rx: mpsc::Receiver<WriteJob>) {
    tracing::debug!("disk writer started");
    for job in rx {
        let len = job.data.len() as u64;
        match job.file.write_at(job.offset, &job.data) {
            Ok(()) => job.pipe.complete(len),
            Err(e) => {
                tracing::warn!(
                    path = %job.file.path().display(),
                    offset = job.offset,
                    len,
                    "disk write failed: {}",
                    e
                );
                job.pipe.fail(e, len);
            }
        }
    }
    tracing::debug!("disk writer stopped");
}
