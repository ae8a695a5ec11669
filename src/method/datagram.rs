//! Fire-and-forget datagram method.
//!
//! Every worker writes through one connected socket. No reply is read, so the
//! receive phase collapses onto the send phase.
//!
//! # The duplicate-descriptor retry
//!
//! A readiness-based multiplexer cannot have the same descriptor waited on
//! twice for the same event. When many workers share one socket, a write can
//! give up with "would block" (or run out its deadline waiting for
//! writability) while another worker's wait on that descriptor is still
//! registered. For that case only, the write is retried exactly once through a
//! duplicate of the socket, which carries its own registration, within what is
//! left of the attempt's deadline. The duplicate is closed right after,
//! whatever the outcome. Any other write error is recorded as is.
use async_trait::async_trait;
use serde_json::json;
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{check_limits, check_target, Method, MethodCore, MethodReport};
use crate::{
    shutdown::{bounded, Bounded},
    transport::{connect_datagram, resolve, DatagramSocket},
    AttemptResult, Error, ErrorCode, Logger, Result, Severity, Shutdown, Source,
    StatSnapshot,
};

/// Configuration of a [`DatagramMethod`].
#[derive(TypedBuilder)]
pub struct DatagramConfig {
    #[builder(default = String::from("datagram"), setter(into))]
    pub name: String,
    /// `host:port` of the target.
    #[builder(setter(into))]
    pub target: String,
    pub source: Arc<dyn Source>,
    /// Recorders, in commit order.
    #[builder(default)]
    pub loggers: Vec<Arc<dyn Logger>>,
    /// Budget for one write.
    #[builder(default = Duration::from_secs(1))]
    pub timeout: Duration,
    /// Workers sharing the socket. One by default, since they all contend
    /// for the same descriptor.
    #[builder(default = 1)]
    pub maxi: usize,
}

impl DatagramConfig {
    pub fn check(&self) -> Result<()> {
        check_target(&self.target)?;
        check_limits(self.timeout, self.maxi)
    }
}

type SharedSocket = Arc<dyn DatagramSocket>;

pub struct DatagramMethod {
    core: MethodCore,
    target: String,
    maxi: usize,
    socket: RwLock<Option<SharedSocket>>,
    dup_retries: AtomicU64,
}

impl DatagramMethod {
    pub fn new(config: DatagramConfig) -> Result<Self> {
        let DatagramConfig {
            name,
            target,
            source,
            loggers,
            timeout,
            maxi,
        } = config;
        Ok(Self {
            core: MethodCore::new(name, source, loggers, timeout)?,
            target,
            maxi,
            socket: RwLock::new(None),
            dup_retries: AtomicU64::new(0),
        })
    }

    /// Uses an already connected socket instead of connecting in `init()`.
    pub fn with_socket(config: DatagramConfig, socket: SharedSocket) -> Result<Self> {
        let method = Self::new(config)?;
        *method.socket.write().unwrap_or_else(|e| e.into_inner()) = Some(socket);
        Ok(method)
    }

    /// How many times the duplicate-descriptor retry fired.
    pub fn dup_retries(&self) -> u64 {
        self.dup_retries.load(Ordering::Relaxed)
    }

    fn socket(&self) -> Option<SharedSocket> {
        self.socket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_connected(&self) -> bool {
        self.socket().is_some()
    }

    async fn send(
        &self,
        socket: &dyn DatagramSocket,
        payload: &[u8],
        deadline: Instant,
        shutdown: &Shutdown,
        res: &mut AttemptResult,
    ) {
        match bounded(shutdown, deadline, socket.send(payload)).await {
            Bounded::Done(_) => {}
            Bounded::Cancelled => res.cancel(),
            Bounded::TimedOut => {
                self.retry_on_duplicate(socket, payload, deadline, shutdown, res)
                    .await
            }
            Bounded::Failed(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.retry_on_duplicate(socket, payload, deadline, shutdown, res)
                    .await
            }
            Bounded::Failed(e) => res.fail(ErrorCode::from(&e), Severity::NetworkError),
        }
    }

    async fn retry_on_duplicate(
        &self,
        socket: &dyn DatagramSocket,
        payload: &[u8],
        deadline: Instant,
        shutdown: &Shutdown,
        res: &mut AttemptResult,
    ) {
        self.dup_retries.fetch_add(1, Ordering::Relaxed);
        let dup = match socket.duplicate() {
            Ok(dup) => dup,
            Err(e) => {
                tracing::warn!("{}: cannot duplicate socket: {e}", self.core.name());
                res.fail(ErrorCode::from(&e), Severity::NetworkError);
                return;
            }
        };
        match bounded(shutdown, deadline, dup.send(payload)).await {
            Bounded::Done(_) => {}
            Bounded::Cancelled => res.cancel(),
            Bounded::TimedOut => res.fail(ErrorCode::TimedOut, Severity::NetworkError),
            Bounded::Failed(e) => res.fail(ErrorCode::from(&e), Severity::NetworkError),
        }
        drop(dup);
    }
}

#[async_trait]
impl Method for DatagramMethod {
    type Worker = ();

    fn name(&self) -> &str {
        self.core.name()
    }

    fn maxi(&self) -> usize {
        self.maxi
    }

    async fn init(&self) -> Result<()> {
        if !self.is_connected() {
            check_target(&self.target)?;
        }
        check_limits(self.core.timeout(), self.maxi)?;

        self.core.init_source().await?;

        if !self.is_connected() {
            let addr = resolve(&self.target).await?;
            if addr.port() == 0 {
                return Err(Error::Config(format!("target {addr} has no port")));
            }
            let socket = connect_datagram(addr).await?;
            tracing::info!("{}: datagram socket connected to {addr}", self.core.name());
            *self.socket.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(socket));
        }

        self.core.init_loggers().await
    }

    async fn run(&self) {
        self.core.run().await;
    }

    async fn test(&self, _worker: &mut (), shutdown: &Shutdown) -> bool {
        let Some(request) = self.core.next_request().await else {
            return false;
        };
        let _in_flight = self.core.stat().enter();

        let mut res = AttemptResult::start(request.payload.len());
        let deadline = res.time_start + self.core.timeout();
        match self.socket() {
            Some(socket) => {
                self.send(&*socket, &request.payload, deadline, shutdown, &mut res)
                    .await
            }
            None => res.fail(ErrorCode::NotConnected, Severity::NetworkError),
        }
        res.mark_send();

        self.core.complete(request, res).await;
        true
    }

    fn stat(&self) -> StatSnapshot {
        self.core.stat().snapshot()
    }

    async fn stat_print(&self) -> MethodReport {
        self.core
            .stat_print(Some(json!({ "dup_retries": self.dup_retries() })))
            .await
    }

    async fn fini(&self) -> Result<()> {
        let core = self.core.fini().await;
        let socket = self
            .socket
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match socket {
            Some(socket) => {
                if Arc::strong_count(&socket) > 1 {
                    tracing::warn!(
                        "{}: socket still referenced at fini, it closes with the last user",
                        self.core.name()
                    );
                }
                drop(socket);
                tracing::info!("{}: datagram socket closed", self.core.name());
            }
            None => tracing::debug!("{}: no socket to close", self.core.name()),
        }
        core
    }
}
