//! Volley: an async load-generation engine for datagram and stream targets.
//!
//! Volley fires requests at a network target from a pool of concurrent
//! workers, times every attempt phase by phase, classifies its outcome by
//! severity and hands the result to a set of pluggable loggers. It is built on
//! tokio and keeps the hot path small: one attempt is one `test()` call.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Source`]: supplies requests (payload plus an opaque [`Tag`]) until it is
//!   exhausted. [`ListSource`] replays a fixed list.
//! - [`Method`]: owns the transport, the source, the loggers and (for stream
//!   transports) a [`Proto`]. [`DatagramMethod`] fires datagrams through one
//!   shared socket; [`StreamMethod`] does request/response over one
//!   connection per worker.
//! - [`AttemptResult`]: the outcome of one attempt, with its phase timestamps,
//!   error code and [`Severity`].
//! - [`Logger`]: a severity-filtered recorder. [`TracingLogger`] and
//!   [`JsonLinesLogger`] are built in.
//! - [`Stat`]: live counters readable while the workers run.
//! - [`Runner`]: drives a method through `init`, `run`, `stat_print` and
//!   `fini`, and runs its worker pool.
//!
//! Per-attempt failures never surface as [`Error`]s: they are recorded in the
//! attempt's result. Only setup and lifecycle problems do.
//!
//! # Feature flags
//! - `internals`: enable access to internal (and unstable) worker pool pieces
//!
//! # Where to start
//!
//! Build a [`DatagramConfig`] or [`StreamConfig`], wrap the method in a
//! [`Runner`] and call [`Runner::drive`]. `demos/datagram.rs` shows a full run.

/// Setup and lifecycle errors
pub mod error;
/// Result recorders
pub mod logger;
/// Methods and the plumbing they share
pub mod method;
/// Reply framing for stream transports
pub mod proto;
/// Requests and request sources
pub mod request;
/// Outcome of a single attempt
pub mod result;
/// Lifecycle driver and worker pool
pub mod runner;
pub mod severity;
pub mod shutdown;
pub mod stat;
pub mod transport;

pub use error::{Error, Result};
pub use logger::{JsonLinesLogger, Logger, Loggers, TracingLogger};
pub use method::{
    DatagramConfig, DatagramMethod, Method, MethodCore, MethodReport, StreamConfig, StreamMethod,
    StreamWorker,
};
pub use proto::{LengthPrefixed, ParseStatus, Proto, DEFAULT_MAX_LENGTH};
pub use request::{ListSource, Request, Source, Tag};
pub use result::{AttemptResult, ErrorCode, PhaseOffsets};
pub use runner::{Runner, State};
pub use severity::Severity;
pub use shutdown::{bounded, Bounded, Shutdown};
pub use stat::{Stat, StatSnapshot};
pub use transport::{Connector, DatagramSocket, TcpConnector};
