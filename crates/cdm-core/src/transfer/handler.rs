//! Easy2 handler for one chunk connection.
//! Validates the response before the first body byte and feeds the body into the chunk.

use std::io;
use std::str;
use std::time::Instant;

use curl::easy::{Handler, WriteError};

use crate::chunk::{ChunkError, WriteStatus};
use crate::download::{lock_chunk, ConnectionOutcome, ResponseInfo, SharedChunk};
use crate::retry::ConnectionError;

pub struct ChunkHandler {
    pub(super) chunk: SharedChunk,
    /// Absolute offset the request started at.
    pub(super) position: u64,
    pub(super) headers: Vec<String>,
    /// None = not checked yet.
    pub(super) response: Option<ResponseInfo>,
    /// Response checked but not yet handed to the manager.
    pub(super) response_new: bool,
    pub(super) error: Option<ConnectionError>,
    /// Last write returned `WriteError::Pause`.
    pub(super) paused: bool,
}

impl ChunkHandler {
    pub(super) fn new(chunk: SharedChunk, position: u64) -> Self {
        Self {
            chunk,
            position,
            headers: Vec::new(),
            response: None,
            response_new: false,
            error: None,
            paused: false,
        }
    }

    /// Parse and validate the response headers once. Returns false when the
    /// response can not be used for this chunk or the connection already failed.
    fn check_response(&mut self) -> bool {
        if self.response.is_none() {
            let info = ResponseInfo::from_header_lines(self.headers.iter().map(String::as_str));
            if let Err(e) = info.validate(self.position) {
                tracing::debug!(status = info.status, position = self.position, error = %e, "response rejected");
                self.error = Some(e);
            } else {
                self.response_new = true;
            }
            self.response = Some(info);
        }
        self.error.is_none()
    }

    /// The validated response, once, for the manager.
    pub(super) fn take_response(&mut self) -> Option<ResponseInfo> {
        if !self.response_new {
            return None;
        }
        self.response_new = false;
        self.response.clone()
    }

    /// Validate a response that came without any body (empty file, error page).
    pub(super) fn check_bodyless(&mut self) {
        if self.error.is_none() && !self.headers.is_empty() {
            self.check_response();
        }
    }

    /// How the transfer ended given curl's result for the handle.
    pub(super) fn outcome(&mut self, result: Result<(), curl::Error>) -> ConnectionOutcome {
        let mut c = lock_chunk(&self.chunk);
        if !c.running() {
            return ConnectionOutcome::Aborted;
        }
        if let Some(e) = self.error.take() {
            c.set_errored();
            return ConnectionOutcome::Failed(e);
        }
        let received_all = c.received_all() || c.complete();
        let done = received_all || (c.end().is_none() && self.response.is_some());
        match result {
            Ok(()) if done => ConnectionOutcome::Completed,
            Ok(()) => {
                c.set_errored();
                ConnectionOutcome::Failed(ConnectionError::PartialTransfer {
                    expected: c.total().unwrap_or(0),
                    received: c.written(),
                })
            }
            Err(_) if received_all => ConnectionOutcome::Completed,
            Err(e) => {
                c.set_errored();
                ConnectionOutcome::Failed(ConnectionError::Curl(e))
            }
        }
    }
}

impl Handler for ChunkHandler {
    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(s) = str::from_utf8(data) {
            let line = s.trim_end();
            if line.starts_with("HTTP/") {
                self.headers.clear();
            }
            if !line.is_empty() {
                self.headers.push(line.to_string());
            }
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.paused = false;
        if !self.check_response() {
            return Ok(0);
        }
        let mut c = lock_chunk(&self.chunk);
        match c.write(data, Instant::now()) {
            Ok(WriteStatus::Accepted(n)) => Ok(n),
            Ok(WriteStatus::WouldBlock) => {
                self.paused = true;
                Err(WriteError::Pause)
            }
            Ok(WriteStatus::Finished) => Ok(0),
            Err(ChunkError::NotOpen) => Ok(0),
            Err(ChunkError::Io(e)) => {
                self.error = Some(ConnectionError::Storage(e));
                Ok(0)
            }
            Err(e) => {
                self.error = Some(ConnectionError::Storage(io::Error::new(
                    io::ErrorKind::Other,
                    e.to_string(),
                )));
                Ok(0)
            }
        }
    }
}
