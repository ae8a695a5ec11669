//! Request/response over a byte stream, one connection per worker.
//!
//! Each worker owns its connection and read buffer ([`StreamWorker`]). The
//! connection is opened lazily on the worker's first attempt and reused until
//! an attempt fails, at which point it is dropped and the next attempt
//! reconnects. Replies are delimited by the configured [`Proto`].
use async_trait::async_trait;
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::{check_limits, check_target, Method, MethodCore, MethodReport};
use crate::{
    shutdown::{bounded, Bounded},
    transport::{resolve, Connector},
    AttemptResult, Error, ErrorCode, Logger, ParseStatus, Proto, Result, Severity, Shutdown,
    Source, StatSnapshot,
};

#[derive(TypedBuilder)]
pub struct StreamConfig<C, P> {
    #[builder(default = String::from("stream"), setter(into))]
    pub name: String,
    /// `host:port` of the target.
    #[builder(setter(into))]
    pub target: String,
    pub source: Arc<dyn Source>,
    #[builder(default)]
    pub loggers: Vec<Arc<dyn Logger>>,
    pub connector: C,
    pub proto: P,
    /// Budget for one whole attempt: connect, write and read.
    #[builder(default = Duration::from_secs(1))]
    pub timeout: Duration,
    #[builder(default = num_cpus::get() * 120)]
    pub maxi: usize,
}

impl<C, P> StreamConfig<C, P> {
    pub fn check(&self) -> Result<()> {
        check_target(&self.target)?;
        check_limits(self.timeout, self.maxi)
    }
}

/// Per-worker connection state.
pub struct StreamWorker<S> {
    conn: Option<S>,
    /// Received bytes not yet claimed by a reply.
    buf: Vec<u8>,
}

impl<S> Default for StreamWorker<S> {
    fn default() -> Self {
        Self {
            conn: None,
            buf: Vec::new(),
        }
    }
}

impl<S> StreamWorker<S> {
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn reset(&mut self) {
        self.conn = None;
        self.buf.clear();
    }
}

pub struct StreamMethod<C, P> {
    core: MethodCore,
    target: String,
    maxi: usize,
    connector: C,
    proto: P,
    addr: OnceLock<SocketAddr>,
    connects: AtomicU64,
}

impl<C, P> StreamMethod<C, P>
where
    C: Connector + 'static,
    P: Proto + 'static,
{
    pub fn new(config: StreamConfig<C, P>) -> Result<Self> {
        let StreamConfig {
            name,
            target,
            source,
            loggers,
            connector,
            proto,
            timeout,
            maxi,
        } = config;
        Ok(Self {
            core: MethodCore::new(name, source, loggers, timeout)?,
            target,
            maxi,
            connector,
            proto,
            addr: OnceLock::new(),
            connects: AtomicU64::new(0),
        })
    }

    /// Connections opened by workers so far (the trial connect in `init` excluded).
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    async fn attempt(
        &self,
        worker: &mut StreamWorker<C::Stream>,
        payload: &[u8],
        deadline: Instant,
        shutdown: &Shutdown,
        res: &mut AttemptResult,
    ) {
        let Some(addr) = self.addr.get().copied() else {
            res.fail(ErrorCode::NotConnected, Severity::NetworkError);
            return;
        };

        let StreamWorker { conn, buf } = worker;
        if conn.is_none() {
            match bounded(shutdown, deadline, self.connector.connect(addr)).await {
                Bounded::Done(stream) => {
                    self.connects.fetch_add(1, Ordering::Relaxed);
                    buf.clear();
                    *conn = Some(stream);
                }
                other => return record_failure(other, res),
            }
        }
        let Some(conn) = conn.as_mut() else {
            return;
        };
        res.mark_conn();

        match bounded(shutdown, deadline, conn.write_all(payload)).await {
            Bounded::Done(()) => res.mark_send(),
            other => return record_failure(other, res),
        }

        loop {
            let mut cursor = &buf[..];
            match self.proto.reply_parse(&mut cursor, payload) {
                ParseStatus::Complete { res_code, severity } => {
                    let consumed = buf.len() - cursor.len();
                    buf.drain(..consumed);
                    res.size_in = consumed;
                    res.res_code = Some(res_code);
                    res.log_level = res.log_level.max(severity);
                    res.mark_recv();
                    return;
                }
                ParseStatus::Failed => {
                    res.fail(ErrorCode::Parse, Severity::ProtoError);
                    return;
                }
                ParseStatus::NeedMore => {}
            }

            match bounded(shutdown, deadline, conn.read_buf(buf)).await {
                Bounded::Done(0) => {
                    res.fail(ErrorCode::UnexpectedEof, Severity::NetworkError);
                    return;
                }
                Bounded::Done(_) => {}
                other => return record_failure(other, res),
            }
        }
    }
}

/// Records a bounded operation that did not complete.
fn record_failure<T>(outcome: Bounded<T>, res: &mut AttemptResult) {
    match outcome {
        Bounded::Done(_) => {}
        Bounded::Failed(e) => res.fail(ErrorCode::from(&e), Severity::NetworkError),
        Bounded::TimedOut => res.fail(ErrorCode::TimedOut, Severity::NetworkError),
        Bounded::Cancelled => res.cancel(),
    }
}

#[async_trait]
impl<C, P> Method for StreamMethod<C, P>
where
    C: Connector + 'static,
    C::Stream: 'static,
    P: Proto + 'static,
{
    type Worker = StreamWorker<C::Stream>;

    fn name(&self) -> &str {
        self.core.name()
    }

    fn maxi(&self) -> usize {
        self.maxi
    }

    async fn init(&self) -> Result<()> {
        check_target(&self.target)?;
        check_limits(self.core.timeout(), self.maxi)?;

        self.core.init_source().await?;

        let addr = resolve(&self.target).await?;
        if addr.port() == 0 {
            return Err(Error::Config(format!("target {addr} has no port")));
        }
        // unreachable targets fail here rather than on every attempt
        match tokio::time::timeout(self.core.timeout(), self.connector.connect(addr)).await {
            Ok(Ok(trial)) => drop(trial),
            Ok(Err(source)) => return Err(Error::Connect { addr, source }),
            Err(_) => {
                return Err(Error::Connect {
                    addr,
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        }
        if self.addr.set(addr).is_err() {
            return Err(Error::Lifecycle {
                operation: "init",
                state: "initialized",
            });
        }
        tracing::info!("{}: target {addr} reachable", self.core.name());

        self.core.init_loggers().await
    }

    async fn run(&self) {
        self.core.run().await;
    }

    async fn test(&self, worker: &mut StreamWorker<C::Stream>, shutdown: &Shutdown) -> bool {
        let Some(request) = self.core.next_request().await else {
            return false;
        };
        let _in_flight = self.core.stat().enter();

        let mut res = AttemptResult::start(request.payload.len());
        let deadline = res.time_start + self.core.timeout();
        self.attempt(worker, &request.payload, deadline, shutdown, &mut res)
            .await;
        if res.err.is_some() {
            // the stream may be mid-reply; never reuse it
            worker.reset();
        }

        self.core.complete(request, res).await;
        true
    }

    fn stat(&self) -> StatSnapshot {
        self.core.stat().snapshot()
    }

    async fn stat_print(&self) -> MethodReport {
        let extra = json!({
            "connects": self.connects(),
            "proto": self.proto.stat(),
        });
        self.core.stat_print(Some(extra)).await
    }

    async fn fini(&self) -> Result<()> {
        tracing::debug!(
            "{}: {} connections opened",
            self.core.name(),
            self.connects()
        );
        self.core.fini().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{transport::TcpConnector, LengthPrefixed, ListSource, Tag};
    use std::sync::Mutex;
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct Collect(Mutex<Vec<AttemptResult>>);

    #[async_trait]
    impl Logger for Collect {
        async fn commit(&self, _: &[u8], _: &mut Tag, res: &AttemptResult) {
            self.0.lock().unwrap().push(res.clone());
        }
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    /// Serves every accepted connection with `handle`.
    async fn serve<F, Fut>(handle: F) -> SocketAddr
    where
        F: Fn(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream));
            }
        });
        addr
    }

    /// Echoes length-prefixed frames back.
    async fn echo(mut stream: TcpStream) {
        loop {
            let mut header = [0u8; 4];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }
            if stream.write_all(&framed(&body)).await.is_err() {
                return;
            }
        }
    }

    fn method(
        addr: SocketAddr,
        bodies: &[&[u8]],
        proto: LengthPrefixed,
        timeout: Duration,
    ) -> (StreamMethod<TcpConnector, LengthPrefixed>, Arc<Collect>) {
        let collect = Arc::new(Collect::default());
        let config = StreamConfig::builder()
            .target(addr.to_string())
            .source(Arc::new(ListSource::from_payloads(
                bodies.iter().map(|b| framed(b)),
            )))
            .loggers(vec![collect.clone() as Arc<dyn Logger>])
            .connector(TcpConnector::default())
            .proto(proto)
            .timeout(timeout)
            .maxi(1)
            .build();
        (StreamMethod::new(config).unwrap(), collect)
    }

    #[tokio::test]
    async fn echoes_reuse_one_connection() {
        let addr = serve(echo).await;
        let (method, collect) = method(
            addr,
            &[b"one", b"two", b"three"],
            LengthPrefixed::default(),
            Duration::from_secs(2),
        );
        method.init().await.unwrap();

        let mut worker = StreamWorker::default();
        let shutdown = Shutdown::never();
        while method.test(&mut worker, &shutdown).await {}

        let results = collect.0.lock().unwrap();
        assert_eq!(results.len(), 3);
        for (res, body) in results.iter().zip([3, 3, 5]) {
            assert_eq!(res.err, None);
            assert_eq!(res.log_level, Severity::Ok);
            assert_eq!(res.res_code, Some(crate::proto::GENERIC_SUCCESS));
            assert_eq!(res.size_in, 4 + body);
            assert!(res.time_send <= res.time_recv);
        }
        assert_eq!(method.connects(), 1);
        assert!(worker.is_connected());
    }

    #[tokio::test]
    async fn close_mid_reply_is_a_network_error() {
        // announces 10 bytes, sends 2, hangs up
        let addr = serve(|mut stream: TcpStream| async move {
            let mut request = [0u8; 5];
            let _ = stream.read_exact(&mut request).await;
            let _ = stream.write_all(&[0, 0, 0, 10, b'a', b'b']).await;
        })
        .await;
        let (method, collect) = method(
            addr,
            &[b"x", b"y"],
            LengthPrefixed::default(),
            Duration::from_secs(2),
        );
        method.init().await.unwrap();

        let mut worker = StreamWorker::default();
        let shutdown = Shutdown::never();
        assert!(method.test(&mut worker, &shutdown).await);
        assert!(!worker.is_connected());
        assert!(method.test(&mut worker, &shutdown).await);

        let results = collect.0.lock().unwrap();
        for res in results.iter() {
            assert!(matches!(
                res.err,
                Some(ErrorCode::UnexpectedEof | ErrorCode::ConnectionReset)
            ));
            assert_eq!(res.log_level, Severity::NetworkError);
        }
        // the second attempt reconnected
        assert_eq!(method.connects(), 2);
    }

    #[tokio::test]
    async fn malformed_reply_is_a_proto_error() {
        let addr = serve(|mut stream: TcpStream| async move {
            let mut header = [0u8; 5];
            let _ = stream.read_exact(&mut header).await;
            let _ = stream.write_all(&framed(&[0u8; 64])).await;
            std::future::pending::<()>().await;
        })
        .await;
        let proto = LengthPrefixed::builder().max_length(16u32).build();
        let (method, collect) = method(addr, &[b"q"], proto, Duration::from_secs(2));
        method.init().await.unwrap();

        let mut worker = StreamWorker::default();
        assert!(method.test(&mut worker, &Shutdown::never()).await);

        let res = collect.0.lock().unwrap()[0].clone();
        assert_eq!(res.err, Some(ErrorCode::Parse));
        assert_eq!(res.log_level, Severity::ProtoError);
        assert!(!worker.is_connected());
    }

    #[tokio::test]
    async fn oversized_announcement_fails_without_buffering() {
        let addr = serve(|mut stream: TcpStream| async move {
            let mut header = [0u8; 5];
            let _ = stream.read_exact(&mut header).await;
            let _ = stream.write_all(&u32::MAX.to_be_bytes()).await;
            std::future::pending::<()>().await;
        })
        .await;
        let (method, collect) = method(
            addr,
            &[b"q"],
            LengthPrefixed::default(),
            Duration::from_secs(2),
        );
        method.init().await.unwrap();

        let mut worker = StreamWorker::default();
        assert!(method.test(&mut worker, &Shutdown::never()).await);

        let res = collect.0.lock().unwrap()[0].clone();
        assert_eq!(res.err, Some(ErrorCode::Parse));
        assert_eq!(res.log_level, Severity::ProtoError);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let addr = serve(|stream: TcpStream| async move {
            let _hold = stream;
            std::future::pending::<()>().await;
        })
        .await;
        let (method, collect) = method(
            addr,
            &[b"q"],
            LengthPrefixed::default(),
            Duration::from_millis(100),
        );
        method.init().await.unwrap();

        let mut worker = StreamWorker::default();
        assert!(method.test(&mut worker, &Shutdown::never()).await);

        let res = collect.0.lock().unwrap()[0].clone();
        assert_eq!(res.err, Some(ErrorCode::TimedOut));
        assert_eq!(res.log_level, Severity::NetworkError);
        assert!(res.interval_event >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn shutdown_cancels_the_read() {
        let addr = serve(|stream: TcpStream| async move {
            let _hold = stream;
            std::future::pending::<()>().await;
        })
        .await;
        let (method, collect) = method(
            addr,
            &[b"q"],
            LengthPrefixed::default(),
            Duration::from_secs(30),
        );
        method.init().await.unwrap();
        let method = Arc::new(method);

        let (shutdown, tx) = Shutdown::new();
        let attempt = {
            let method = method.clone();
            tokio::spawn(async move {
                let mut worker = StreamWorker::default();
                method.test(&mut worker, &shutdown).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        assert!(attempt.await.unwrap());

        let res = collect.0.lock().unwrap()[0].clone();
        assert!(res.is_cancelled());
        assert_ne!(res.log_level, Severity::NetworkError);
    }

    #[tokio::test]
    async fn refused_connect_fails_init() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (method, _) = method(
            addr,
            &[],
            LengthPrefixed::default(),
            Duration::from_secs(1),
        );
        let err = method.init().await.unwrap_err();
        assert!(matches!(err, Error::Connect { addr: a, .. } if a == addr));
    }
}
