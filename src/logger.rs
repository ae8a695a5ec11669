//! Result recorders and the ordered set a method dispatches to.
//!
//! A [`Logger`] decides nothing about the attempt it is handed: it only
//! records. Filtering is the set's job and is a single comparison against
//! each logger's [`Logger::level`].
use async_trait::async_trait;
use serde::Serialize;
use std::{
    borrow::Cow,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Mutex,
};

use crate::{AttemptResult, Error, ErrorCode, Result, Severity, Tag};

/// A pluggable, severity-filtered result recorder.
///
/// `commit` is called concurrently from every worker of the method, so any
/// internal state must be protected by the logger itself. A logger may add to
/// the `tag` (the next logger in the set sees the change) but must leave the
/// request and the result alone, which the shared references enforce.
#[async_trait]
pub trait Logger: Send + Sync {
    /// Lowest severity this logger wants to see.
    fn level(&self) -> Severity {
        Severity::Ok
    }

    async fn commit(&self, request: &[u8], tag: &mut Tag, res: &AttemptResult);

    async fn init(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn run(&self, _name: &str) {}

    async fn stat_print(&self, _name: &str) {}

    async fn fini(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Ordered, fixed collection of loggers. The configured order is the commit
/// order and the lifecycle order.
#[derive(Clone, Default)]
pub struct Loggers {
    items: Vec<Arc<dyn Logger>>,
}

impl Loggers {
    pub fn new(items: Vec<Arc<dyn Logger>>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hands the result to every logger whose threshold it reaches, in order.
    pub async fn commit(&self, request: &[u8], tag: &mut Tag, res: &AttemptResult) {
        for logger in &self.items {
            if res.log_level >= logger.level() {
                logger.commit(request, tag, res).await;
            }
        }
    }

    pub async fn init(&self, name: &str) -> Result<()> {
        for logger in &self.items {
            logger.init(name).await?;
        }
        Ok(())
    }

    pub async fn run(&self, name: &str) {
        for logger in &self.items {
            logger.run(name).await;
        }
    }

    pub async fn stat_print(&self, name: &str) {
        for logger in &self.items {
            logger.stat_print(name).await;
        }
    }

    /// Finalizes every logger even if one fails; the first failure is returned.
    pub async fn fini(&self, name: &str) -> Result<()> {
        let mut first = None;
        for logger in &self.items {
            if let Err(e) = logger.fini(name).await {
                tracing::error!("Logger fini failed for {name}: {e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl FromIterator<Arc<dyn Logger>> for Loggers {
    fn from_iter<T: IntoIterator<Item = Arc<dyn Logger>>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Forwards every result it receives as a `tracing` event.
///
/// Successful attempts are emitted at `TRACE`, warnings at `WARN` and errors
/// at `ERROR`.
#[derive(Debug, Default)]
pub struct TracingLogger {
    level: Severity,
}

impl TracingLogger {
    pub fn new(level: Severity) -> Self {
        Self { level }
    }
}

#[async_trait]
impl Logger for TracingLogger {
    fn level(&self) -> Severity {
        self.level
    }

    async fn commit(&self, _request: &[u8], tag: &mut Tag, res: &AttemptResult) {
        let tag = String::from_utf8_lossy(tag);
        let latency_us = res.interval_event.as_micros() as u64;
        let err = res.err.map(|e| e.to_string());
        match res.log_level {
            Severity::Ok => tracing::trace!(
                %tag,
                size_out = res.size_out,
                size_in = res.size_in,
                latency_us,
                res_code = ?res.res_code,
                "attempt ok"
            ),
            Severity::ProtoWarning | Severity::NetworkWarning => tracing::warn!(
                %tag,
                level = %res.log_level,
                latency_us,
                err = ?err,
                res_code = ?res.res_code,
                "attempt degraded"
            ),
            Severity::ProtoError | Severity::NetworkError => tracing::error!(
                %tag,
                level = %res.log_level,
                latency_us,
                err = ?err,
                res_code = ?res.res_code,
                "attempt failed"
            ),
        }
    }

    async fn init(&self, name: &str) -> Result<()> {
        tracing::debug!("Tracing logger attached to {name} at level {}", self.level);
        Ok(())
    }
}

/// One line of [`JsonLinesLogger`] output.
#[derive(Debug, Serialize)]
struct Record<'a> {
    tag: Cow<'a, str>,
    size_out: usize,
    size_in: usize,
    conn_us: u64,
    send_us: u64,
    recv_us: u64,
    interval_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    res_code: Option<u32>,
    level: Severity,
}

impl<'a> Record<'a> {
    fn new(tag: &'a [u8], res: &AttemptResult) -> Self {
        let offsets = res.offsets();
        Self {
            tag: String::from_utf8_lossy(tag),
            size_out: res.size_out,
            size_in: res.size_in,
            conn_us: offsets.conn.as_micros() as u64,
            send_us: offsets.send.as_micros() as u64,
            recv_us: offsets.recv.as_micros() as u64,
            interval_us: res.interval_event.as_micros() as u64,
            err: res.err,
            res_code: res.res_code,
            level: res.log_level,
        }
    }
}

type Sink = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Writes one JSON object per committed result.
pub struct JsonLinesLogger {
    level: Severity,
    sink: Mutex<Sink>,
    written: AtomicU64,
    failed: AtomicU64,
}

impl JsonLinesLogger {
    pub fn from_writer<W>(writer: W, level: Severity) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            level,
            sink: Mutex::new(BufWriter::new(writer)),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Creates (or truncates) `path` and logs into it.
    pub async fn create(path: impl AsRef<Path>, level: Severity) -> Result<Self> {
        let file = tokio::fs::File::create(path.as_ref()).await?;
        Ok(Self::from_writer(file, level))
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Logger for JsonLinesLogger {
    fn level(&self) -> Severity {
        self.level
    }

    async fn commit(&self, _request: &[u8], tag: &mut Tag, res: &AttemptResult) {
        let mut line = match serde_json::to_vec(&Record::new(tag, res)) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Cannot serialize result: {e}");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        line.push(b'\n');

        let mut sink = self.sink.lock().await;
        match sink.write_all(&line).await {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("Cannot write result line: {e}");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn stat_print(&self, name: &str) {
        tracing::info!(
            "{name}: json logger wrote {} lines, {} failed",
            self.written(),
            self.failed()
        );
    }

    async fn fini(&self, name: &str) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.flush().await.map_err(|e| Error::Logger {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        sink.shutdown().await.map_err(|e| Error::Logger {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}
