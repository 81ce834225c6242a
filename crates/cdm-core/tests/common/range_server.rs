//! Minimal HTTP/1.1 server that supports Range GET for integration tests.
//!
//! Serves a single static body at one path; every other path is a 404. One
//! request per connection.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Send the body in pieces of this size with `piece_delay` in between.
    pub piece_size: usize,
    pub piece_delay: Duration,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            piece_size: 16 * 1024,
            piece_delay: Duration::from_millis(5),
        }
    }
}

pub struct RangeServer {
    /// Base URL, e.g. "http://127.0.0.1:12345".
    pub base: String,
    gets: Arc<AtomicUsize>,
}

impl RangeServer {
    /// URL of the served body.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// GET requests answered so far.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

/// Serve `body` at `path` from a background thread until the process exits.
pub fn start(path: &str, body: Vec<u8>) -> RangeServer {
    start_with_options(path, body, RangeServerOptions::default())
}

pub fn start_with_options(path: &str, body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let path = Arc::new(path.to_string());
    let gets = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&gets);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let path = Arc::clone(&path);
            let counter = Arc::clone(&counter);
            thread::spawn(move || handle(stream, &path, &body, opts, &counter));
        }
    });
    RangeServer {
        base: format!("http://127.0.0.1:{}", port),
        gets,
    }
}

fn handle(
    mut stream: std::net::TcpStream,
    served_path: &str,
    body: &[u8],
    opts: RangeServerOptions,
    gets: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, path, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }
    gets.fetch_add(1, Ordering::SeqCst);
    if path != served_path {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }
    let total = body.len() as u64;
    let (head, slice) = match range.filter(|_| opts.support_ranges) {
        Some((start, end_incl)) => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                let head = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n",
                    total
                );
                (head, &body[0..0])
            } else {
                let slice = &body[start as usize..=end_incl as usize];
                let head = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\n",
                    slice.len(),
                    start,
                    end_incl,
                    total
                );
                (head, slice)
            }
        }
        None => {
            let accept = if opts.support_ranges { "Accept-Ranges: bytes\r\n" } else { "" };
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}", total, accept);
            (head, body)
        }
    };
    let _ = stream.write_all(format!("{}Connection: close\r\n\r\n", head).as_bytes());
    for piece in slice.chunks(opts.piece_size.max(1)) {
        if stream.write_all(piece).is_err() {
            return;
        }
        let _ = stream.flush();
        if !opts.piece_delay.is_zero() {
            thread::sleep(opts.piece_delay);
        }
    }
}

/// Returns (method, path, optional (start, end_inclusive) for Range: bytes=X-Y).
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut method = "";
    let mut path = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            let mut parts = line.split_whitespace();
            method = parts.next().unwrap_or("");
            path = parts.next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if value.to_lowercase().starts_with("bytes=") {
                    let part = value[6..].trim();
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, path, range)
}
