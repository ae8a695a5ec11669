use serde::{Deserialize, Serialize};
use std::{fmt, io, time::Duration};
use tokio::time::Instant;

use crate::Severity;

/// Stable classification of a failed attempt.
///
/// Well-known I/O conditions get their own variant so loggers and counters can
/// group them; anything else keeps the raw OS error number when there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TimedOut,
    /// The operation was abandoned because the run is shutting down.
    Cancelled,
    WouldBlock,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    BrokenPipe,
    UnexpectedEof,
    NotConnected,
    /// The reply could not be parsed by the configured proto.
    Parse,
    Os(i32),
    Other,
}

impl ErrorCode {
    /// Human readable description, in the spirit of `strerror`.
    pub fn description(&self) -> String {
        match self {
            ErrorCode::TimedOut => "operation timed out".into(),
            ErrorCode::Cancelled => "operation cancelled".into(),
            ErrorCode::WouldBlock => "operation would block".into(),
            ErrorCode::ConnectionRefused => "connection refused".into(),
            ErrorCode::ConnectionReset => "connection reset by peer".into(),
            ErrorCode::ConnectionAborted => "connection aborted".into(),
            ErrorCode::BrokenPipe => "broken pipe".into(),
            ErrorCode::UnexpectedEof => "connection closed mid-reply".into(),
            ErrorCode::NotConnected => "transport not connected".into(),
            ErrorCode::Parse => "malformed reply".into(),
            ErrorCode::Os(code) => io::Error::from_raw_os_error(*code).to_string(),
            ErrorCode::Other => "unknown error".into(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ErrorCode::TimedOut,
            io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
            io::ErrorKind::BrokenPipe => ErrorCode::BrokenPipe,
            io::ErrorKind::UnexpectedEof => ErrorCode::UnexpectedEof,
            io::ErrorKind::NotConnected => ErrorCode::NotConnected,
            _ => err.raw_os_error().map_or(ErrorCode::Other, ErrorCode::Os),
        }
    }
}

impl From<io::Error> for ErrorCode {
    fn from(err: io::Error) -> Self {
        ErrorCode::from(&err)
    }
}

/// Outcome of one request/response attempt.
///
/// Built fresh inside every `test()` call, handed by reference to each logger,
/// then dropped. Phase timestamps are monotonic and never decrease from one
/// phase to the next: marking a phase also moves every later phase up to the
/// same instant, so a phase that does not apply to a transport ends up equal
/// to the nearest completed one.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub size_out: usize,
    pub size_in: usize,
    pub time_start: Instant,
    pub time_conn: Instant,
    pub time_send: Instant,
    pub time_recv: Instant,
    pub time_end: Instant,
    /// `time_end - time_start`.
    pub interval_event: Duration,
    pub err: Option<ErrorCode>,
    /// Status reported by the proto, if it parsed one.
    pub res_code: Option<u32>,
    pub log_level: Severity,
}

/// Phase timestamps expressed relative to `time_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseOffsets {
    pub conn: Duration,
    pub send: Duration,
    pub recv: Duration,
    pub end: Duration,
}

impl AttemptResult {
    /// Starts a new attempt for a request of `size_out` bytes.
    pub fn start(size_out: usize) -> Self {
        let now = Instant::now();
        Self {
            size_out,
            size_in: 0,
            time_start: now,
            time_conn: now,
            time_send: now,
            time_recv: now,
            time_end: now,
            interval_event: Duration::ZERO,
            err: None,
            res_code: None,
            log_level: Severity::Ok,
        }
    }

    pub fn mark_conn(&mut self) {
        let now = Instant::now();
        self.time_conn = now;
        self.time_send = now;
        self.time_recv = now;
        self.time_end = now;
    }

    pub fn mark_send(&mut self) {
        let now = Instant::now();
        self.time_send = now;
        self.time_recv = now;
        self.time_end = now;
    }

    pub fn mark_recv(&mut self) {
        let now = Instant::now();
        self.time_recv = now;
        self.time_end = now;
    }

    /// Closes the attempt: stamps `time_end` and computes `interval_event`.
    pub fn finish(&mut self) {
        self.time_end = Instant::now();
        self.interval_event = self.time_end.duration_since(self.time_start);
    }

    /// Records a failure, escalating the severity but never lowering it.
    pub fn fail(&mut self, code: ErrorCode, severity: Severity) {
        self.err = Some(code);
        self.log_level = self.log_level.max(severity);
    }

    /// Records a cooperative cancellation. The severity is left untouched.
    pub fn cancel(&mut self) {
        self.err = Some(ErrorCode::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.err == Some(ErrorCode::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        self.err.is_none() && self.log_level == Severity::Ok
    }

    pub fn offsets(&self) -> PhaseOffsets {
        PhaseOffsets {
            conn: self.time_conn.duration_since(self.time_start),
            send: self.time_send.duration_since(self.time_start),
            recv: self.time_recv.duration_since(self.time_start),
            end: self.time_end.duration_since(self.time_start),
        }
    }
}
