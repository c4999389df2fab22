//! Chunk fetch workers.
//!
//! A worker loops over the task's part queue (retries first), performing one
//! ranged GET per part and writing the body straight to its absolute file
//! offset. The bandwidth shaper gates every buffer before it is consumed and
//! the cancellation token is observed both there and in curl's progress
//! callback, so a worker stops within one buffer read of a cancel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::congestion::CongestionController;
use crate::error::{classify_curl_error, classify_worker_status, ErrorKind};
use crate::part::{Part, MAX_ATTEMPTS};
use crate::shaper::BandwidthShaper;
use crate::storage::FileWriter;
use crate::task::TaskId;

/// Upper bound on a single buffered read; also curl's receive buffer size.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Failure of one fetch attempt, typed so retry classification happens
/// before conversion to a task-level error.
#[derive(Debug)]
pub enum PartError {
    /// Transport failure (DNS, connect, TLS, timeout, reset).
    Curl(curl::Error),
    /// Non-acceptable HTTP status.
    Http(u32),
    /// Server closed early: fewer bytes than the part's length.
    PartialTransfer { expected: u64, received: u64 },
    /// Local write failed. Not retried.
    Storage(std::io::Error),
    /// The task's cancellation token fired mid-transfer.
    Cancelled,
}

impl PartError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PartError::Curl(e) => classify_curl_error(e),
            PartError::Http(code) => classify_worker_status(*code),
            PartError::PartialTransfer { .. } => ErrorKind::Transient,
            PartError::Storage(_) => ErrorKind::Io,
            PartError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for PartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartError::Curl(e) => write!(f, "{}", e),
            PartError::Http(code) => write!(f, "HTTP {}", code),
            PartError::PartialTransfer { expected, received } => {
                write!(f, "short body: {} of {} bytes", received, expected)
            }
            PartError::Storage(e) => write!(f, "storage: {}", e),
            PartError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for PartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PartError::Curl(e) => Some(e),
            PartError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-attempt outcome delivered to the executor's monitor loop.
#[derive(Debug)]
pub enum PartOutcome {
    Done { index: usize, bytes: u64 },
    Failed { part: Part, error: PartError },
}

/// Work source shared by a task's workers. Retried parts are handed out
/// before fresh ones.
#[derive(Debug)]
pub struct PartQueue {
    inner: Mutex<Queues>,
}

#[derive(Debug)]
struct Queues {
    fresh: VecDeque<Part>,
    retry: VecDeque<Part>,
}

impl PartQueue {
    pub fn new(parts: Vec<Part>) -> Self {
        Self {
            inner: Mutex::new(Queues {
                fresh: parts.into_iter().collect(),
                retry: VecDeque::new(),
            }),
        }
    }

    pub fn pop(&self) -> Option<Part> {
        let mut q = self.inner.lock().unwrap();
        q.retry.pop_front().or_else(|| q.fresh.pop_front())
    }

    pub fn push_retry(&self, part: Part) {
        self.inner.lock().unwrap().retry.push_back(part);
    }

    pub fn remaining(&self) -> usize {
        let q = self.inner.lock().unwrap();
        q.fresh.len() + q.retry.len()
    }
}

/// Everything one worker needs. Handles (shaper, controller, storage) are
/// passed downward; results go upward through the outcome channel only.
pub struct WorkerContext {
    pub task: TaskId,
    pub url: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub user_agent: String,
    /// False for the single-part fallback (no `Range` header sent).
    pub ranged: bool,
    /// Expected total size, when known; bounds the unranged fallback.
    pub total_size: Option<u64>,
    /// True when the plan has exactly one part (a 200 may then stand in
    /// for a 206).
    pub single_part: bool,
    pub storage: FileWriter,
    pub shaper: Arc<BandwidthShaper>,
    pub controller: Arc<CongestionController>,
    pub cancel: Arc<AtomicBool>,
    pub queue: Arc<PartQueue>,
    pub outcomes: mpsc::Sender<PartOutcome>,
}

/// Worker thread body: drain the queue until empty, cancelled, or the
/// outcome channel is gone. One curl handle lives as long as the worker, so
/// the connection stays warm across parts.
pub fn run_worker(ctx: Arc<WorkerContext>) {
    let mut easy = match setup_easy(&ctx) {
        Ok(e) => e,
        Err(error) => {
            if let Some(part) = ctx.queue.pop() {
                let _ = ctx.outcomes.send(PartOutcome::Failed { part, error });
            }
            return;
        }
    };
    loop {
        if ctx.cancel.load(Ordering::Relaxed) {
            return;
        }
        let Some(mut part) = ctx.queue.pop() else {
            return;
        };
        part.attempts += 1;
        let started = Instant::now();
        match fetch_part(&ctx, &mut easy, &part) {
            Ok(bytes) => {
                ctx.controller.record(&ctx.host, started.elapsed(), true);
                if ctx
                    .outcomes
                    .send(PartOutcome::Done {
                        index: part.index,
                        bytes,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(PartError::Cancelled) => return,
            Err(error) => {
                ctx.controller.record(&ctx.host, started.elapsed(), false);
                if error.kind().is_retryable() && part.attempts < MAX_ATTEMPTS {
                    tracing::debug!(
                        task = ctx.task,
                        part = part.index,
                        attempt = part.attempts,
                        %error,
                        "part failed, requeueing"
                    );
                    ctx.queue.push_retry(part);
                } else if ctx
                    .outcomes
                    .send(PartOutcome::Failed { part, error })
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Reason the write callback aborted the transfer, so the curl "write
/// error" can be mapped back to its cause.
const ABORT_NONE: u32 = 0;
const ABORT_BAD_STATUS: u32 = 1;
const ABORT_STORAGE: u32 = 2;
const ABORT_CANCELLED: u32 = 3;

/// Configure a worker's long-lived curl handle: everything but the range.
fn setup_easy(ctx: &WorkerContext) -> Result<curl::easy::Easy, PartError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(&ctx.url).map_err(PartError::Curl)?;
    easy.get(true).map_err(PartError::Curl)?;
    easy.follow_location(true).map_err(PartError::Curl)?;
    easy.max_redirections(10).map_err(PartError::Curl)?;
    easy.connect_timeout(Duration::from_secs(30))
        .map_err(PartError::Curl)?;
    // Abort when throughput sits under 1 KiB/s for 60 s rather than using a
    // hard wall-clock limit that would kill large parts on slow links.
    easy.low_speed_limit(1024).map_err(PartError::Curl)?;
    easy.low_speed_time(Duration::from_secs(60))
        .map_err(PartError::Curl)?;
    easy.buffer_size(READ_BUFFER_SIZE).map_err(PartError::Curl)?;
    easy.useragent(&ctx.user_agent).map_err(PartError::Curl)?;
    easy.progress(true).map_err(PartError::Curl)?;

    let mut list = curl::easy::List::new();
    list.append("Accept: */*").map_err(PartError::Curl)?;
    list.append("Connection: keep-alive").map_err(PartError::Curl)?;
    for (k, v) in &ctx.headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(PartError::Curl)?;
    }
    if let Some(c) = &ctx.cookie {
        list.append(&format!("Cookie: {}", c.trim()))
            .map_err(PartError::Curl)?;
    }
    easy.http_headers(list).map_err(PartError::Curl)?;
    Ok(easy)
}

/// One GET attempt for `part`. Returns bytes written on success.
fn fetch_part(
    ctx: &WorkerContext,
    easy: &mut curl::easy::Easy,
    part: &Part,
) -> Result<u64, PartError> {
    let bytes_written = Arc::new(AtomicU64::new(0));
    let status = Arc::new(AtomicU32::new(0));
    let abort_reason = Arc::new(AtomicU32::new(ABORT_NONE));
    let storage_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));

    if ctx.ranged {
        easy.range(&part.range_value()).map_err(PartError::Curl)?;
    }

    let perform_result = {
        let mut transfer = easy.transfer();
        {
            let status = Arc::clone(&status);
            transfer
                .header_function(move |data| {
                    if let Ok(s) = std::str::from_utf8(data) {
                        if let Some(code) = parse_status_line(s.trim_end()) {
                            status.store(code, Ordering::Relaxed);
                        }
                    }
                    true
                })
                .map_err(PartError::Curl)?;
        }
        {
            let cancel = Arc::clone(&ctx.cancel);
            transfer
                .progress_function(move |_, _, _, _| !cancel.load(Ordering::Relaxed))
                .map_err(PartError::Curl)?;
        }
        {
            let status = Arc::clone(&status);
            let abort_reason = Arc::clone(&abort_reason);
            let bytes_written = Arc::clone(&bytes_written);
            let storage_error = Arc::clone(&storage_error);
            let cancel = Arc::clone(&ctx.cancel);
            let shaper = Arc::clone(&ctx.shaper);
            let storage = ctx.storage.clone();
            let task = ctx.task;
            let start = part.start;
            let ranged = ctx.ranged;
            let single_part = ctx.single_part;
            transfer
                .write_function(move |data| {
                    let code = status.load(Ordering::Relaxed);
                    let acceptable = if ranged {
                        code == 206 || (code == 200 && single_part)
                    } else {
                        (200..300).contains(&code)
                    };
                    if !acceptable {
                        abort_reason.store(ABORT_BAD_STATUS, Ordering::Relaxed);
                        return Ok(0);
                    }
                    if shaper.wait(task, data.len() as u64, &cancel).is_err() {
                        abort_reason.store(ABORT_CANCELLED, Ordering::Relaxed);
                        return Ok(0);
                    }
                    let off = bytes_written.load(Ordering::Relaxed);
                    match storage.write_at(start + off, data) {
                        Ok(()) => {
                            bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
                            Ok(data.len())
                        }
                        Err(e) => {
                            storage_error.lock().unwrap().replace(e);
                            abort_reason.store(ABORT_STORAGE, Ordering::Relaxed);
                            Ok(0)
                        }
                    }
                })
                .map_err(PartError::Curl)?;
        }
        transfer.perform()
    };

    if ctx.cancel.load(Ordering::Relaxed) {
        return Err(PartError::Cancelled);
    }

    if let Err(e) = perform_result {
        match abort_reason.load(Ordering::Relaxed) {
            ABORT_STORAGE => {
                let io = storage_error
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| std::io::Error::other("storage write failed"));
                return Err(PartError::Storage(io));
            }
            ABORT_BAD_STATUS => {
                return Err(PartError::Http(status.load(Ordering::Relaxed)));
            }
            ABORT_CANCELLED => return Err(PartError::Cancelled),
            _ => return Err(PartError::Curl(e)),
        }
    }

    let code = easy.response_code().map_err(PartError::Curl)?;
    if !(200..300).contains(&code) {
        return Err(PartError::Http(code));
    }
    if ctx.ranged && code == 200 {
        tracing::warn!(
            task = ctx.task,
            part = part.index,
            "server ignored Range and replied 200 for a single-part request"
        );
    }

    let received = bytes_written.load(Ordering::Relaxed);
    let expected = if ctx.ranged {
        Some(part.len())
    } else {
        ctx.total_size
    };
    if let Some(expected) = expected {
        if received != expected {
            return Err(PartError::PartialTransfer { expected, received });
        }
    }
    Ok(received)
}

/// Status code from an `HTTP/x.y NNN ...` line.
fn parse_status_line(line: &str) -> Option<u32> {
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::CHUNK_SIZE;

    fn part(index: usize) -> Part {
        Part {
            index,
            start: index as u64 * CHUNK_SIZE,
            end: (index as u64 + 1) * CHUNK_SIZE - 1,
            attempts: 0,
        }
    }

    #[test]
    fn queue_hands_out_retries_first() {
        let q = PartQueue::new(vec![part(0), part(1)]);
        let mut retried = part(7);
        retried.attempts = 2;
        q.push_retry(retried);
        assert_eq!(q.pop().unwrap().index, 7);
        assert_eq!(q.pop().unwrap().index, 0);
        assert_eq!(q.pop().unwrap().index, 1);
        assert!(q.pop().is_none());
    }

    #[test]
    fn queue_remaining_counts_both_lanes() {
        let q = PartQueue::new(vec![part(0)]);
        assert_eq!(q.remaining(), 1);
        q.push_retry(part(1));
        assert_eq!(q.remaining(), 2);
        q.pop();
        q.pop();
        assert_eq!(q.remaining(), 0);
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 206 Partial Content"), Some(206));
        assert_eq!(parse_status_line("HTTP/2 200"), Some(200));
        assert_eq!(parse_status_line("Content-Length: 5"), None);
    }

    #[test]
    fn part_error_kinds() {
        assert_eq!(PartError::Http(500).kind(), ErrorKind::Transient);
        assert_eq!(PartError::Http(403).kind(), ErrorKind::NeedsAuth);
        assert_eq!(PartError::Http(401).kind(), ErrorKind::NeedsAuth);
        assert_eq!(
            PartError::PartialTransfer {
                expected: 10,
                received: 3
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            PartError::Storage(std::io::Error::other("x")).kind(),
            ErrorKind::Io
        );
        assert_eq!(PartError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
