//! Consumes the job destination and applies every message to an in-memory
//! store keyed by fingerprint. Runs until Ctrl+C.

use std::sync::Arc;

use anyhow::{bail, Result};
use job_leads_collector::config;
use job_leads_collector::queue::listener::{Listener, MemoryJobStore};
use job_leads_collector::queue::stomp::StompConnector;
use job_leads_collector::{logging, metrics, shutdown};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cfg = config::load_config_default()?;
    logging::init_tracing(&cfg.logging);
    metrics::install_exporter(cfg.metrics.listen.as_deref())?;
    if !cfg.broker.enabled {
        bail!("broker.enabled is false; nothing to listen to");
    }

    let connector = Arc::new(StompConnector::from_config(&cfg.broker));
    let store = MemoryJobStore::new();
    let listener = Listener::new(connector, Arc::new(store.clone()));

    let cancel = CancellationToken::new();
    shutdown::spawn_ctrl_c(cancel.clone());

    tracing::info!(
        destination = %cfg.broker.destination,
        host = %cfg.broker.host,
        port = cfg.broker.port,
        "listening"
    );
    let stats = listener.run(cancel).await;
    tracing::info!(
        stored = store.len().await,
        received = stats.received,
        "listener exited"
    );
    Ok(())
}
