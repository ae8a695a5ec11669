//! Cooperative cancellation and per-operation deadlines.
use std::{future::Future, io};
use tokio::{
    sync::watch::{self, Receiver, Sender},
    time::{timeout_at, Instant},
};

/// Receiving side of the run-wide stop signal.
///
/// Cloned into every worker. Raising it never interrupts a worker between
/// two statements: it only makes the I/O wait the worker is currently
/// suspended in (if any) return early, and makes the worker loop exit before
/// pulling its next request.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { rx }, tx)
    }

    /// A signal that is never raised, for driving `test()` by hand.
    pub fn never() -> Self {
        Self::new().0
    }

    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised.
    pub async fn signalled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            // sender gone without raising: nobody can stop us any more
            std::future::pending::<()>().await;
        }
    }
}

/// How a bounded I/O operation ended.
#[derive(Debug)]
pub enum Bounded<T> {
    Done(T),
    Failed(io::Error),
    /// The deadline passed before the operation completed.
    TimedOut,
    /// Shutdown was raised while the operation was pending.
    Cancelled,
}

/// Runs one I/O operation under a deadline and the shutdown signal.
///
/// Expiry or cancellation drops only this operation; the socket it was
/// using stays usable. The operation is polled at least once even when the
/// deadline has already passed, so an immediately ready write still lands.
pub async fn bounded<T, F>(shutdown: &Shutdown, deadline: Instant, op: F) -> Bounded<T>
where
    F: Future<Output = io::Result<T>>,
{
    if shutdown.is_signalled() {
        return Bounded::Cancelled;
    }
    tokio::select! {
        res = timeout_at(deadline, op) => match res {
            Ok(Ok(v)) => Bounded::Done(v),
            Ok(Err(e)) => Bounded::Failed(e),
            Err(_) => Bounded::TimedOut,
        },
        _ = shutdown.signalled() => Bounded::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_before_deadline() {
        let (shutdown, _tx) = Shutdown::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let out = bounded(&shutdown, deadline, async { Ok::<_, io::Error>(7) }).await;
        assert!(matches!(out, Bounded::Done(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let (shutdown, _tx) = Shutdown::new();
        let deadline = Instant::now() + Duration::from_millis(10);
        let out = bounded(&shutdown, deadline, std::future::pending::<io::Result<()>>()).await;
        assert!(matches!(out, Bounded::TimedOut));
    }

    #[tokio::test]
    async fn past_deadline_still_polls_once() {
        let shutdown = Shutdown::never();
        let deadline = Instant::now() - Duration::from_millis(1);
        let out = bounded(&shutdown, deadline, async { Ok::<_, io::Error>(()) }).await;
        assert!(matches!(out, Bounded::Done(())));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_op() {
        let (shutdown, tx) = Shutdown::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                bounded(&shutdown, deadline, std::future::pending::<io::Result<()>>()).await
            })
        };
        tx.send(true).unwrap();
        assert!(matches!(waiter.await.unwrap(), Bounded::Cancelled));
        assert!(shutdown.is_signalled());
    }

    #[tokio::test]
    async fn raised_signal_skips_the_op() {
        let (shutdown, tx) = Shutdown::new();
        tx.send(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        let out = bounded(&shutdown, deadline, async { Ok::<_, io::Error>(1) }).await;
        assert!(matches!(out, Bounded::Cancelled));
    }

    #[tokio::test]
    async fn dropped_sender_does_not_cancel() {
        let (shutdown, tx) = Shutdown::new();
        drop(tx);
        let deadline = Instant::now() + Duration::from_millis(20);
        let out = bounded(&shutdown, deadline, std::future::pending::<io::Result<()>>()).await;
        assert!(matches!(out, Bounded::TimedOut));
    }
}
