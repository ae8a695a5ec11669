//! The [`Runner`] drives a [`Method`] through its lifecycle and runs its
//! worker pool.
//!
//! # High-level flow
//! 1. `init()` opens the method's transport, source and loggers. A failure
//!    here is fatal: the method is finalized best-effort and the runner ends
//!    up `Finalized`.
//! 2. `run()` spawns `maxi()` worker tasks sharing one execution context.
//!    Each worker calls [`Method::test`] in a loop until the source is
//!    exhausted or the shutdown signal is raised, and `run()` returns once the
//!    last worker has left its loop.
//! 3. `stop()` raises the shutdown signal from outside; pending I/O inside
//!    `test()` is cancelled cooperatively and the workers wind down.
//! 4. `fini()` raises the signal too, waits until no worker is left inside
//!    `test()` (and until a `run()` that is still setting up has decided not
//!    to spawn), then finalizes the method, which closes the transport.
//!
//! # States
//! ```text
//! Created -> Initialized -> Running -> Stopped -> Finalizing -> Finalized
//! ```
//! `fini()` is accepted from `Initialized`, `Running` and `Stopped`. No state
//! is ever entered twice; an out-of-order call returns
//! [`Error::Lifecycle`] and changes nothing.
use futures::future::join_all;
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

use crate::{Error, Method, MethodReport, Result};
use internals::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Created,
    Initialized,
    Running,
    Stopped,
    /// Workers are being drained and the method finalized.
    Finalizing,
    Finalized,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Initialized => "initialized",
            State::Running => "running",
            State::Stopped => "stopped",
            State::Finalizing => "finalizing",
            State::Finalized => "finalized",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn illegal(operation: &'static str, state: State) -> Error {
    Error::Lifecycle {
        operation,
        state: state.as_str(),
    }
}

/// Lifecycle driver and worker pool for one method.
pub struct Runner<M: Method> {
    method: Arc<M>,
    state: Mutex<State>,
    ctx: ExecutionContext,
    shutdown_tx: watch::Sender<bool>,
    /// Guards the spawn-or-not decision against a concurrent shutdown.
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<M: Method> Runner<M> {
    pub fn new(method: M) -> Self {
        let (ctx, shutdown_tx) = ExecutionContext::new();
        Self {
            method: Arc::new(method),
            state: Mutex::new(State::Created),
            ctx,
            shutdown_tx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn method(&self) -> &Arc<M> {
        &self.method
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    /// Workers currently inside their loop.
    pub fn live_workers(&self) -> usize {
        self.ctx.live()
    }

    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != State::Created {
            return Err(illegal("init", *state));
        }

        tracing::info!("Initializing method: {}", self.method.name());
        match self.method.init().await {
            Ok(()) => {
                *state = State::Initialized;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Init of {} failed: {e}", self.method.name());
                if let Err(fini) = self.method.fini().await {
                    tracing::warn!("Cleanup of {} failed: {fini}", self.method.name());
                }
                *state = State::Finalized;
                Err(e)
            }
        }
    }

    /// Runs the worker pool until the source is exhausted or the run is
    /// stopped.
    pub async fn run(&self) -> Result<()> {
        // Counted live from here, so a concurrent `fini()` waits for the run
        // hook and the spawn decision too.
        let setup = {
            let mut state = self.state.lock().await;
            if *state != State::Initialized {
                return Err(illegal("run", *state));
            }
            *state = State::Running;
            self.ctx.enter()
        };

        self.method.run().await;

        {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            if self.ctx.shutdown.is_signalled() {
                tracing::info!("Shutdown raised before start, no workers spawned");
            } else {
                let workers = self.method.maxi();
                tracing::info!("Spawning {workers} workers...");
                *handles = spawn_workers(self.ctx.clone(), workers, self.method.clone());
            }
        }
        drop(setup);

        tracing::info!("Running method: {}!", self.method.name());
        self.ctx.wait_idle().await;

        let mut state = self.state.lock().await;
        if *state == State::Running {
            *state = State::Stopped;
        }
        tracing::info!("Done running method: {}!", self.method.name());
        Ok(())
    }

    /// Raises the shutdown signal without finalizing anything.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::info!("Stopping method: {}", self.method.name());
        }
    }

    pub async fn stat_print(&self) -> Result<MethodReport> {
        let state = *self.state.lock().await;
        match state {
            State::Initialized | State::Running | State::Stopped => {
                Ok(self.method.stat_print().await)
            }
            other => Err(illegal("stat_print", other)),
        }
    }

    /// Stops the workers, waits for every in-flight attempt to return, then
    /// finalizes the method.
    pub async fn fini(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !matches!(
                *state,
                State::Initialized | State::Running | State::Stopped
            ) {
                return Err(illegal("fini", *state));
            }
            *state = State::Finalizing;
        }

        tracing::info!("Signaling shutdown...");
        let handles = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            self.shutdown_tx.send_replace(true);
            std::mem::take(&mut *handles)
        };

        self.ctx.wait_idle().await;
        tracing::info!("Joining {} workers...", handles.len());
        for res in join_all(handles).await {
            if let Err(e) = res {
                // the pool keeps going without it, so only log
                tracing::error!("Worker panicked with error: {e}");
            }
        }

        let out = self.method.fini().await;
        *self.state.lock().await = State::Finalized;
        tracing::info!("Method {} finalized", self.method.name());
        out
    }

    /// Runs the whole lifecycle once and returns the final report.
    pub async fn drive(&self) -> Result<MethodReport> {
        self.init().await?;
        if let Err(e) = self.run().await {
            let _ = self.fini().await;
            return Err(e);
        }
        let report = self.stat_print().await;
        self.fini().await?;
        report
    }
}

impl<M: Method> Drop for Runner<M> {
    fn drop(&mut self) {
        // let detached workers wind down
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Worker pool internals.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;
    use crate::Shutdown;

    /// Shared state of every worker of a run.
    #[derive(Clone)]
    pub struct ExecutionContext {
        /// Broadcasts the signal to stop all workers.
        pub shutdown: Shutdown,
        /// Number of workers still inside their loop.
        pub live: Arc<watch::Sender<usize>>,
    }

    impl ExecutionContext {
        pub fn new() -> (Self, watch::Sender<bool>) {
            let (shutdown, tx) = Shutdown::new();
            let (live, _) = watch::channel(0);
            (
                Self {
                    shutdown,
                    live: Arc::new(live),
                },
                tx,
            )
        }

        /// Counts one more live worker until the guard is dropped.
        pub fn enter(&self) -> LiveGuard {
            self.live.send_modify(|n| *n += 1);
            LiveGuard(self.live.clone())
        }

        pub fn live(&self) -> usize {
            *self.live.borrow()
        }

        /// Resolves once no worker is live.
        pub async fn wait_idle(&self) {
            let mut rx = self.live.subscribe();
            // the sender lives in `self`, so this cannot see a closed channel
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }

    pub struct LiveGuard(Arc<watch::Sender<usize>>);

    impl Drop for LiveGuard {
        fn drop(&mut self) {
            self.0.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Spawns `workers` Tokio tasks, each acting as a test worker.
    ///
    /// Every worker is counted live before this returns, so a caller waiting
    /// for idleness right after cannot miss one. A worker stops on source
    /// exhaustion or once the shutdown signal is observed between attempts.
    pub fn spawn_workers<M: Method>(
        ctx: ExecutionContext,
        workers: usize,
        method: Arc<M>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|i| {
                let live = ctx.enter();
                let ctx = ctx.clone();
                let method = method.clone();
                tokio::spawn(async move {
                    let _live = live;
                    let mut worker = M::Worker::default();
                    tracing::debug!("Worker {i} spawned.");

                    while !ctx.shutdown.is_signalled() {
                        if !method.test(&mut worker, &ctx.shutdown).await {
                            tracing::debug!("Worker {i} found the source exhausted.");
                            break;
                        }
                    }

                    tracing::debug!("Worker {i} shutting down.");
                })
            })
            .collect()
    }
}
