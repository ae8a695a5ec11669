use std::{io, net::SocketAddr};

/// Setup and lifecycle failures.
///
/// Only conditions that prevent a method from starting (or an illegal
/// lifecycle call) are reported through this type. Failures of a single
/// attempt never become an `Error`; they are recorded in the attempt's
/// [`AttemptResult`](crate::AttemptResult) and handed to the loggers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The method configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The target address could not be resolved to any socket address.
    #[error("cannot resolve target `{target}`: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Creating the local socket failed.
    #[error("socket: {0}")]
    Socket(#[source] io::Error),

    /// Connecting to the target failed.
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A lifecycle call was made from a state that does not allow it.
    #[error("cannot {operation} from the {state} state")]
    Lifecycle {
        operation: &'static str,
        state: &'static str,
    },

    /// The request source failed during its own lifecycle.
    #[error("source: {0}")]
    Source(String),

    /// A logger failed during its own lifecycle.
    #[error("logger `{name}`: {message}")]
    Logger { name: String, message: String },

    /// The latency histogram could not be created.
    #[error("latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    /// Two latency histograms could not be merged.
    #[error("latency histogram merge: {0}")]
    HistogramMerge(#[from] hdrhistogram::AdditionError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
