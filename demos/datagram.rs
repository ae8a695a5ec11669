use std::{sync::Arc, time::Duration};

use tokio::net::UdpSocket;
use volley::{
    DatagramConfig, DatagramMethod, JsonLinesLogger, ListSource, Logger, Runner, Severity,
    TracingLogger,
};

#[tokio::main]
async fn main() -> volley::Result<()> {
    tracing_subscriber::fmt().init();

    // A local sink so the demo needs no server; it just counts what arrives
    let sink = UdpSocket::bind("127.0.0.1:0").await?;
    let target = sink.local_addr()?;
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        let mut received = 0u64;
        while sink.recv(&mut buf).await.is_ok() {
            received += 1;
            if received % 1000 == 0 {
                tracing::info!("Sink received {received} datagrams");
            }
        }
    });

    let source = ListSource::from_payloads((0..100).map(|i| format!("ping {i}"))).passes(50);
    let loggers: Vec<Arc<dyn Logger>> = vec![
        Arc::new(TracingLogger::new(Severity::NetworkWarning)),
        // Failures only, one JSON object per line
        Arc::new(JsonLinesLogger::from_writer(
            tokio::io::stdout(),
            Severity::ProtoError,
        )),
    ];

    let method = DatagramMethod::new(
        DatagramConfig::builder()
            .name("udp demo")
            .target(target.to_string())
            .source(Arc::new(source))
            .loggers(loggers)
            .timeout(Duration::from_millis(200))
            .maxi(4)
            .build(),
    )?;
    let runner = Runner::new(method);

    let report = runner.drive().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_default()
    );
    if let Some(p99) = report.stat.percentile(0.99) {
        println!("p99 latency: {p99:?}");
    }
    Ok(())
}
