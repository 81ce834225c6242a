//! What a chunk's HTTP response tells the download.

use crate::retry::ConnectionError;

use super::{lock_chunk, Compression, Download, DownloadError, SharedChunk};

/// Parsed response head of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u32,
    /// `(start, end, complete_length)` from `Content-Range: bytes start-end/len`.
    pub content_range: Option<(u64, u64, Option<u64>)>,
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
}

impl ResponseInfo {
    /// Build from raw header lines. Only the last response block counts; a new
    /// status line (after a redirect or `100 Continue`) resets what was seen.
    pub fn from_header_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut info = ResponseInfo::default();
        for line in lines {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.starts_with("HTTP/") {
                info = ResponseInfo {
                    status: parse_status_line(line).unwrap_or(0),
                    ..ResponseInfo::default()
                };
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-range" => info.content_range = parse_content_range(value),
                "content-length" => info.content_length = value.parse().ok(),
                "accept-ranges" => info.accept_ranges = value.eq_ignore_ascii_case("bytes"),
                "content-encoding" => info.content_encoding = Some(value.to_string()),
                "content-disposition" => info.content_disposition = Some(value.to_string()),
                _ => {}
            }
        }
        info
    }

    /// Check the response fits a request that started at `position`: a 206 must start
    /// exactly there, a 200 is only usable when the request started at 0.
    pub fn validate(&self, position: u64) -> Result<(), ConnectionError> {
        match self.status {
            206 => match self.content_range {
                Some((start, _, _)) if start == position => Ok(()),
                _ => Err(ConnectionError::RangeRejected),
            },
            200 if position == 0 => Ok(()),
            200 => Err(ConnectionError::RangeRejected),
            code => Err(ConnectionError::Http(code)),
        }
    }
}

/// Status code from a line like `HTTP/1.1 206 Partial Content`.
pub fn parse_status_line(line: &str) -> Option<u32> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// `bytes 0-499/1234` → `(0, 499, Some(1234))`; `bytes 0-499/*` → `(0, 499, None)`.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

impl Download {
    /// Apply the first response of the starter chunk: total size, resumability,
    /// compression and file name. Responses of other chunks carry nothing new.
    pub fn apply_response(
        &mut self,
        chunk: &SharedChunk,
        info: &ResponseInfo,
    ) -> Result<(), DownloadError> {
        let mut c = lock_chunk(chunk);
        if !c.is_starter() {
            return Ok(());
        }
        let (resumable, size) = match (info.status, info.content_range) {
            (206, Some((_, _, total))) => (true, total),
            _ => (info.accept_ranges, info.content_length),
        };
        self.resumable = resumable && size.is_some();
        self.compression = info
            .content_encoding
            .as_deref()
            .and_then(Compression::from_header);
        if let Some(cd) = &info.content_disposition {
            self.suggest_file_name(cd);
        }
        match size {
            Some(size) if size > 0 => {
                c.set_end(Some(size - 1))?;
                drop(c);
                self.set_total_size(size)?;
            }
            _ => {
                drop(c);
                self.total_size = 0;
            }
        }
        tracing::info!(
            download = self.id,
            status = info.status,
            total = self.total_size,
            resumable = self.resumable,
            "response received"
        );
        Ok(())
    }
}
