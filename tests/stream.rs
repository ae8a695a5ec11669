use async_trait::async_trait;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use volley::{
    AttemptResult, Error, ErrorCode, LengthPrefixed, ListSource, Logger, Method, Runner, Severity,
    State, StreamConfig, StreamMethod, Tag, TcpConnector,
};

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

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
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
            });
        }
    });
    addr
}

/// Accepts connections and never answers.
async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held: Vec<TcpStream> = vec![];
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

fn runner(
    addr: SocketAddr,
    source: ListSource,
    collect: Arc<Collect>,
    timeout: Duration,
    maxi: usize,
) -> Runner<StreamMethod<TcpConnector, LengthPrefixed>> {
    Runner::new(
        StreamMethod::new(
            StreamConfig::builder()
                .name("echo")
                .target(addr.to_string())
                .source(Arc::new(source))
                .loggers(vec![collect as Arc<dyn Logger>])
                .connector(TcpConnector::default())
                .proto(LengthPrefixed::default())
                .timeout(timeout)
                .maxi(maxi)
                .build(),
        )
        .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_run_reuses_connections() {
    let addr = echo_server().await;
    let collect = Arc::new(Collect::default());
    let source = ListSource::from_payloads([framed(b"hello"), framed(b"")]).passes(100);
    let runner = runner(addr, source, collect.clone(), Duration::from_secs(5), 4);

    let report = runner.drive().await.unwrap();

    assert_eq!(report.method, "echo");
    assert_eq!(report.stat.count, 200);
    assert_eq!(report.stat.failures(), 0);
    assert_eq!(report.stat.bytes_in, 100 * (4 + 5) + 100 * 4);
    assert!(report.stat.percentile(0.5).is_some());
    // one connection per worker at most
    assert!(report.extra.unwrap()["connects"].as_u64().unwrap() <= 4);

    let results = collect.0.lock().unwrap();
    assert!(results.iter().all(|r| r.res_code == Some(200)));
    assert!(results
        .iter()
        .all(|r| r.time_conn <= r.time_send && r.time_send <= r.time_recv));
}

#[tokio::test]
async fn silent_target_times_out_every_attempt() {
    let addr = silent_server().await;
    let collect = Arc::new(Collect::default());
    let source = ListSource::from_payloads([framed(b"ping")]).passes(6);
    let runner = runner(addr, source, collect.clone(), Duration::from_millis(50), 2);

    let report = runner.drive().await.unwrap();

    assert_eq!(report.stat.count, 6);
    assert_eq!(report.stat.level(Severity::NetworkError), 6);
    for res in collect.0.lock().unwrap().iter() {
        assert_eq!(res.err, Some(ErrorCode::TimedOut));
        assert!(res.interval_event >= Duration::from_millis(50));
    }
}

#[tokio::test]
async fn fini_cancels_pending_reads() {
    let addr = silent_server().await;
    let collect = Arc::new(Collect::default());
    let source = ListSource::from_payloads([framed(b"ping")]).passes(100);
    let runner = Arc::new(runner(
        addr,
        source,
        collect.clone(),
        Duration::from_secs(60),
        3,
    ));
    runner.init().await.unwrap();

    let run = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.method().stat().in_flight < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), runner.fini())
        .await
        .expect("fini must not wait for the 60s timeout")
        .unwrap();
    run.await.unwrap().unwrap();

    let results = collect.0.lock().unwrap();
    assert_eq!(results.len(), 3);
    for res in results.iter() {
        assert!(res.is_cancelled());
        assert_ne!(res.log_level, Severity::NetworkError);
    }
    let stat = runner.method().stat();
    assert_eq!(stat.cancelled, 3);
    assert_eq!(stat.count, 0);
}

#[tokio::test]
async fn refused_target_is_fatal_at_init() {
    let addr = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let collect = Arc::new(Collect::default());
    let runner = runner(
        addr,
        ListSource::from_payloads([framed(b"x")]),
        collect.clone(),
        Duration::from_secs(1),
        2,
    );

    assert!(matches!(runner.init().await, Err(Error::Connect { .. })));
    assert_eq!(runner.state().await, State::Finalized);
    assert!(runner.run().await.is_err());
    assert!(collect.0.lock().unwrap().is_empty());
}
