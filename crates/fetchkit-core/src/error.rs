//! Error taxonomy surfaced to callers.
//!
//! Failures bubble up as a display string plus a machine-readable kind so
//! control surfaces can branch (retry, ask for a fresh URL, free disk space)
//! without parsing messages.

use thiserror::Error;

/// Classification of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network timeout, connection reset, 429 or 5xx. Retried at part level.
    Transient,
    /// 401/403: the link needs refreshed credentials or a new signed URL.
    NeedsAuth,
    /// 404 from the origin.
    NotFound,
    /// Unrecoverable protocol or client error (4xx other than auth/404).
    Fatal,
    /// Target filesystem cannot hold the file.
    DiskFull,
    /// Local file I/O failure.
    Io,
    /// Finished file did not match the expected hash.
    IntegrityMismatch,
    /// Stopped on purpose (pause/stop/shutdown). Not reported as an error.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::NeedsAuth => "needs_auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Fatal => "fatal",
            ErrorKind::DiskFull => "disk_full",
            ErrorKind::Io => "io",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// True if a part-level failure of this kind should be retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Task-level failure: one display string plus a taxonomy tag.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Classify an HTTP status code seen by a worker mid-transfer.
pub fn classify_worker_status(code: u32) -> ErrorKind {
    match code {
        401 | 403 => ErrorKind::NeedsAuth,
        _ => ErrorKind::Transient,
    }
}

/// Classify an HTTP status code from the initial probe.
pub fn classify_probe_status(code: u32) -> ErrorKind {
    match code {
        401 | 403 => ErrorKind::NeedsAuth,
        404 => ErrorKind::NotFound,
        429 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

/// Classify a curl transport error (DNS, connect, TLS, timeout, reset).
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout()
        || e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return ErrorKind::Transient;
    }
    if e.is_ssl_connect_error() {
        return ErrorKind::Transient;
    }
    ErrorKind::Fatal
}
