use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its own HTTP listener serving
/// `/metrics`. Without an address nothing is installed and the `metrics`
/// macros stay no-ops.
pub fn install_exporter(listen: Option<&str>) -> Result<()> {
    let Some(listen) = listen else {
        return Ok(());
    };
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics.listen address {listen:?}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("prometheus: install exporter")?;

    gauge!("collector_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}
