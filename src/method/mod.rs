//! Methods: one configured way of hitting a target each.
//!
//! A [`Method`] bundles a transport, a request [`Source`], an ordered set of
//! [`Logger`]s and (for stream transports) a [`Proto`](crate::Proto). The
//! [`Runner`](crate::Runner) drives its lifecycle and calls [`Method::test`]
//! from `maxi()` concurrent workers.
//!
//! The built-in methods share their plumbing through [`MethodCore`]: pulling
//! requests, closing an attempt, dispatching it to the loggers and feeding
//! the live counters.
pub mod datagram;
pub mod stream;

pub use datagram::{DatagramConfig, DatagramMethod};
pub use stream::{StreamConfig, StreamMethod, StreamWorker};

use async_trait::async_trait;
use serde::Serialize;
use std::{sync::Arc, time::Duration};

use crate::{
    AttemptResult, Error, Logger, Loggers, Request, Result, Shutdown, Source, Stat, StatSnapshot,
};

/// The engine of one benchmark scenario.
///
/// Lifecycle calls happen once each, in order: `init`, `run`, any number of
/// `stat_print`, `fini`. The [`Runner`](crate::Runner) enforces the order.
#[async_trait]
pub trait Method: Send + Sync + 'static {
    /// State a worker carries from one attempt to the next (a connection, a
    /// read buffer). Created fresh for each worker.
    type Worker: Default + Send;

    fn name(&self) -> &str;

    /// Most workers allowed inside `test()` at once.
    fn maxi(&self) -> usize;

    /// Opens the transport and initializes the source and loggers. An error
    /// here means the method cannot start at all.
    async fn init(&self) -> Result<()>;

    /// Called once, right before the workers start.
    async fn run(&self);

    /// Performs one attempt.
    ///
    /// Returns `false` without side effects once the source is exhausted;
    /// otherwise records the attempt (whatever its outcome) and returns
    /// `true`.
    async fn test(&self, worker: &mut Self::Worker, shutdown: &Shutdown) -> bool;

    /// Live counters. Safe to call while workers run.
    fn stat(&self) -> StatSnapshot;

    async fn stat_print(&self) -> MethodReport;

    /// Releases the transport and finalizes the source and loggers. Called
    /// only once no worker is inside `test()` any more.
    async fn fini(&self) -> Result<()>;
}

/// What `stat_print` reports for a method.
#[derive(Debug, Clone, Serialize)]
pub struct MethodReport {
    pub method: String,
    pub stat: StatSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<serde_json::Value>,
    /// Method or proto specific counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Plumbing shared by the built-in methods.
pub struct MethodCore {
    name: String,
    source: Arc<dyn Source>,
    loggers: Loggers,
    timeout: Duration,
    stat: Stat,
}

impl MethodCore {
    pub fn new(
        name: String,
        source: Arc<dyn Source>,
        loggers: Vec<Arc<dyn Logger>>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            name,
            source,
            loggers: Loggers::new(loggers),
            timeout,
            stat: Stat::new()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stat(&self) -> &Stat {
        &self.stat
    }

    pub fn loggers(&self) -> &Loggers {
        &self.loggers
    }

    pub async fn init_source(&self) -> Result<()> {
        self.source.init().await
    }

    pub async fn init_loggers(&self) -> Result<()> {
        self.loggers.init(&self.name).await
    }

    pub async fn next_request(&self) -> Option<Request> {
        self.source.get_request().await
    }

    /// Closes the attempt and hands it to the loggers, then to the counters.
    pub async fn complete(&self, request: Request, mut res: AttemptResult) {
        let Request { payload, mut tag } = request;
        res.finish();
        self.loggers.commit(&payload, &mut tag, &res).await;
        self.stat.record(&res);
    }

    pub async fn run(&self) {
        self.loggers.run(&self.name).await;
    }

    pub async fn stat_print(&self, extra: Option<serde_json::Value>) -> MethodReport {
        let report = MethodReport {
            method: self.name.clone(),
            stat: self.stat.snapshot(),
            source: self.source.stat(),
            extra,
        };
        match serde_json::to_string(&report) {
            Ok(json) => tracing::info!("{}: {json}", self.name),
            Err(e) => tracing::warn!("{}: cannot serialize stat: {e}", self.name),
        }
        self.loggers.stat_print(&self.name).await;
        report
    }

    /// Finalizes the source, then the loggers. Both are attempted even if
    /// the first one fails.
    pub async fn fini(&self) -> Result<()> {
        let source = self.source.fini().await;
        if let Err(e) = &source {
            tracing::error!("{}: source fini failed: {e}", self.name);
        }
        let loggers = self.loggers.fini(&self.name).await;
        source.and(loggers)
    }
}

pub(crate) fn check_target(target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(Error::Config("target is required".into()));
    }
    Ok(())
}

pub(crate) fn check_limits(timeout: Duration, maxi: usize) -> Result<()> {
    if timeout.is_zero() {
        return Err(Error::Config("timeout must be positive".into()));
    }
    if maxi == 0 {
        return Err(Error::Config("maxi must be at least 1".into()));
    }
    Ok(())
}
