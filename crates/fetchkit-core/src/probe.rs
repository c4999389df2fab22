//! Metadata probe: a single GET with `Range: bytes=0-0`.
//!
//! A ranged GET works where HEAD is blocked and tells us range support
//! directly: a `206 Partial Content` reply proves it and its
//! `Content-Range: bytes a-b/TOTAL` carries the full size. Plain `2xx`
//! replies fall back to `Accept-Ranges`/`Content-Length` headers. ETag and
//! Last-Modified are captured as resume validators, Content-Disposition as a
//! filename hint.

use std::collections::HashMap;
use std::str;
use std::time::Duration;

use thiserror::Error;

use crate::error::{classify_curl_error, classify_probe_status, ErrorKind};
use crate::naming;

/// Probe deadline, connect included.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parsed result of the probe request.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Total size in bytes, when the server reported one.
    pub size: Option<u64>,
    /// Derived filename (Content-Disposition, else URL basename, else fallback).
    pub filename: String,
    /// True if the server honors byte ranges.
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Final HTTP status after redirects.
    pub status: u32,
}

/// Probe failure, classified per the engine taxonomy.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("authentication required (HTTP {0})")]
    NeedsAuth(u32),
    #[error("not found (HTTP 404)")]
    NotFound,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("probe failed: {0}")]
    Fatal(String),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::NeedsAuth(_) => ErrorKind::NeedsAuth,
            ProbeError::NotFound => ErrorKind::NotFound,
            ProbeError::Transient(_) => ErrorKind::Transient,
            ProbeError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    fn from_status(code: u32) -> Self {
        match classify_probe_status(code) {
            ErrorKind::NeedsAuth => ProbeError::NeedsAuth(code),
            ErrorKind::NotFound => ProbeError::NotFound,
            ErrorKind::Transient => ProbeError::Transient(format!("HTTP {}", code)),
            _ => ProbeError::Fatal(format!("HTTP {}", code)),
        }
    }

    fn from_curl(e: curl::Error) -> Self {
        match classify_curl_error(&e) {
            ErrorKind::Transient => ProbeError::Transient(e.to_string()),
            _ => ProbeError::Fatal(e.to_string()),
        }
    }
}

/// Probe `url` with the task's headers and optional pre-joined cookie value.
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn probe(
    url: &str,
    custom_headers: &HashMap<String, String>,
    cookie: Option<&str>,
    user_agent: &str,
) -> Result<ProbeResult, ProbeError> {
    let mut header_lines: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(ProbeError::from_curl)?;
    easy.get(true).map_err(ProbeError::from_curl)?;
    easy.range("0-0").map_err(ProbeError::from_curl)?;
    easy.follow_location(true).map_err(ProbeError::from_curl)?;
    easy.max_redirections(10).map_err(ProbeError::from_curl)?;
    easy.connect_timeout(Duration::from_secs(15))
        .map_err(ProbeError::from_curl)?;
    easy.timeout(PROBE_TIMEOUT).map_err(ProbeError::from_curl)?;
    easy.useragent(user_agent).map_err(ProbeError::from_curl)?;

    let mut list = curl::easy::List::new();
    list.append("Accept: */*").map_err(ProbeError::from_curl)?;
    list.append("Connection: keep-alive")
        .map_err(ProbeError::from_curl)?;
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(ProbeError::from_curl)?;
    }
    if let Some(c) = cookie {
        list.append(&format!("Cookie: {}", c.trim()))
            .map_err(ProbeError::from_curl)?;
    }
    easy.http_headers(list).map_err(ProbeError::from_curl)?;

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    let line = s.trim_end();
                    // Keep only the final response's headers across redirects.
                    if line.starts_with("HTTP/") {
                        header_lines.clear();
                    }
                    header_lines.push(line.to_string());
                }
                true
            })
            .map_err(ProbeError::from_curl)?;
        transfer
            .write_function(|data| Ok(data.len()))
            .map_err(ProbeError::from_curl)?;
        transfer.perform().map_err(ProbeError::from_curl)?;
    }

    let status = easy.response_code().map_err(ProbeError::from_curl)?;
    if status >= 400 {
        return Err(ProbeError::from_status(status));
    }

    let final_url = easy
        .effective_url()
        .ok()
        .flatten()
        .unwrap_or(url)
        .to_string();
    Ok(parse_probe_response(status, &header_lines, &final_url))
}

/// Build a ProbeResult from the final status, headers and effective URL.
fn parse_probe_response(status: u32, lines: &[String], final_url: &str) -> ProbeResult {
    let mut content_length: Option<u64> = None;
    let mut content_range_total: Option<u64> = None;
    let mut accept_ranges_header = false;
    let mut etag = None;
    let mut last_modified = None;
    let mut content_disposition: Option<String> = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<u64>().ok();
        } else if name.eq_ignore_ascii_case("content-range") {
            content_range_total = parse_content_range_total(value);
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            accept_ranges_header = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("etag") {
            etag = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("last-modified") {
            last_modified = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-disposition") {
            content_disposition = Some(value.to_string());
        }
    }

    let (accept_ranges, size) = if status == 206 {
        (true, content_range_total)
    } else {
        (accept_ranges_header, content_length)
    };

    ProbeResult {
        size,
        filename: naming::derive_filename(final_url, content_disposition.as_deref()),
        accept_ranges,
        etag,
        last_modified,
        status,
    }
}

/// Total from `bytes a-b/TOTAL`; `*` means unknown.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn partial_content_reply_proves_ranges() {
        let r = parse_probe_response(
            206,
            &lines(&[
                "HTTP/1.1 206 Partial Content",
                "Content-Length: 1",
                "Content-Range: bytes 0-0/1048576",
                "ETag: \"v1\"",
            ]),
            "https://example.com/big.iso",
        );
        assert!(r.accept_ranges);
        assert_eq!(r.size, Some(1_048_576));
        assert_eq!(r.etag.as_deref(), Some("\"v1\""));
        assert_eq!(r.filename, "big.iso");
    }

    #[test]
    fn plain_ok_uses_content_length_and_accept_ranges() {
        let r = parse_probe_response(
            200,
            &lines(&[
                "HTTP/1.1 200 OK",
                "Content-Length: 4096",
                "Accept-Ranges: bytes",
                "Last-Modified: Wed, 21 Oct 2015 07:28:00 GMT",
            ]),
            "https://example.com/file.bin",
        );
        assert!(r.accept_ranges);
        assert_eq!(r.size, Some(4096));
        assert_eq!(
            r.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[test]
    fn accept_ranges_none_means_unsupported() {
        let r = parse_probe_response(
            200,
            &lines(&["HTTP/1.1 200 OK", "Accept-Ranges: none", "Content-Length: 9"]),
            "https://example.com/f",
        );
        assert!(!r.accept_ranges);
        assert_eq!(r.size, Some(9));
    }

    #[test]
    fn unknown_total_in_content_range() {
        let r = parse_probe_response(
            206,
            &lines(&["HTTP/1.1 206 Partial Content", "Content-Range: bytes 0-0/*"]),
            "https://example.com/f.bin",
        );
        assert!(r.accept_ranges);
        assert_eq!(r.size, None);
    }

    #[test]
    fn filename_from_disposition_header() {
        let r = parse_probe_response(
            206,
            &lines(&[
                "HTTP/1.1 206 Partial Content",
                "Content-Range: bytes 0-0/10",
                "Content-Disposition: attachment; filename=\"report.pdf\"",
            ]),
            "https://example.com/dl?id=9",
        );
        assert_eq!(r.filename, "report.pdf");
    }

    #[test]
    fn content_range_total_parser() {
        assert_eq!(parse_content_range_total("bytes 0-0/500"), Some(500));
        assert_eq!(parse_content_range_total("bytes 100-199/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/5"), None);
    }

    #[test]
    fn status_classification_to_probe_error() {
        assert!(matches!(ProbeError::from_status(401), ProbeError::NeedsAuth(401)));
        assert!(matches!(ProbeError::from_status(403), ProbeError::NeedsAuth(403)));
        assert!(matches!(ProbeError::from_status(404), ProbeError::NotFound));
        assert!(matches!(ProbeError::from_status(429), ProbeError::Transient(_)));
        assert!(matches!(ProbeError::from_status(503), ProbeError::Transient(_)));
        assert!(matches!(ProbeError::from_status(400), ProbeError::Fatal(_)));
    }
}
