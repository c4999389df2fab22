//! Minimal HTTP/1.1 server with Range support for integration tests.
//!
//! Serves one static body. Understands `GET` with an optional
//! `Range: bytes=a-b` header and can inject failures: every Nth request
//! answered 500, or everything after the first N requests answered 403.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Default)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub ignore_ranges: bool,
    /// If true, omit `Accept-Ranges: bytes` even when ranges work.
    pub hide_accept_ranges: bool,
    /// Every Nth request (1-based) fails with 500.
    pub fail_every_nth: Option<u32>,
    /// Requests after the first N are refused with 403.
    pub forbid_after: Option<u32>,
    /// ETag header value to send, quotes included.
    pub etag: Option<String>,
    /// Last-Modified header value to send.
    pub last_modified: Option<String>,
    /// Content-Disposition header value to send.
    pub content_disposition: Option<String>,
}

/// Running test server handle.
pub struct RangeServer {
    pub url: String,
    requests: Arc<AtomicU32>,
}

impl RangeServer {
    /// GET requests seen so far.
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Start a server for `body` with default options.
#[allow(dead_code)]
pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

/// Start a server with custom behavior. Runs until the process exits.
pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let requests = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&requests);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let opts = opts.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || handle(stream, &body, &opts, &counter));
        }
    });
    RangeServer {
        url: format!("http://127.0.0.1:{}/payload.bin", port),
        requests,
    }
}

fn handle(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    counter: &AtomicU32,
) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }

    let seq = counter.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(limit) = opts.forbid_after {
        if seq > limit {
            let _ = stream.write_all(
                b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
    }
    if let Some(nth) = opts.fail_every_nth {
        if nth > 0 && seq % nth == 0 {
            let _ = stream.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
    }

    let total = body.len() as u64;
    let use_range = !opts.ignore_ranges && total > 0;
    let (status, content_range, slice) = match range {
        Some((start, end_incl)) if use_range => {
            let start = start.min(total.saturating_sub(1));
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                let _ = stream.write_all(
                    format!(
                        "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        total
                    )
                    .as_bytes(),
                );
                return;
            }
            let slice = &body[start as usize..=(end_incl as usize)];
            (
                "206 Partial Content",
                Some(format!("bytes {}-{}/{}", start, end_incl, total)),
                slice,
            )
        }
        _ => ("200 OK", None, body),
    };

    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n",
        status,
        slice.len()
    );
    if let Some(cr) = content_range {
        response.push_str(&format!("Content-Range: {}\r\n", cr));
    }
    if !opts.ignore_ranges && !opts.hide_accept_ranges {
        response.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(etag) = &opts.etag {
        response.push_str(&format!("ETag: {}\r\n", etag));
    }
    if let Some(lm) = &opts.last_modified {
        response.push_str(&format!("Last-Modified: {}\r\n", lm));
    }
    if let Some(cd) = &opts.content_disposition {
        response.push_str(&format!("Content-Disposition: {}\r\n", cd));
    }
    response.push_str("Connection: close\r\n\r\n");
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(slice);
}

/// Returns (method, optional (start, end_inclusive)) from the request head.
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("range") {
            continue;
        }
        let value = value.trim();
        if let Some(spec) = value.strip_prefix("bytes=") {
            if let Some((a, b)) = spec.split_once('-') {
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
    (method, range)
}
