use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder and serve `/metrics` on `port`.
pub fn start_metrics_server(port: u16) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;

    info!(port, "configuring metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "metrics server ready at /metrics");
    Ok(addr)
}
