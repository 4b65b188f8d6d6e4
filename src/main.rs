//! Collector binary: loads `.env` and configuration, then either runs a
//! single cycle (`RUN_ONCE=1`) or ticks the scheduler until Ctrl+C.

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use job_leads_collector::config::{self, CollectorConfig};
use job_leads_collector::ingest::dedup::Deduplicator;
use job_leads_collector::ingest::normalize::Normalizer;
use job_leads_collector::ingest::providers::session::launcher_for;
use job_leads_collector::ingest::providers::ConfiguredConnectors;
use job_leads_collector::ingest::scheduler::Scheduler;
use job_leads_collector::ingest::Pipeline;
use job_leads_collector::queue::publisher::Publisher;
use job_leads_collector::queue::stomp::StompConnector;
use job_leads_collector::queue::{DisabledConnector, QueueConnector};
use job_leads_collector::{logging, metrics, shutdown};
use tokio_util::sync::CancellationToken;

fn run_once_requested() -> bool {
    std::env::var("RUN_ONCE")
        .ok()
        .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
}

async fn build_dedup(cfg: &CollectorConfig) -> Deduplicator {
    let retention = Duration::days(i64::from(cfg.dedup.retention_days.max(1)));
    match &cfg.dedup.state_path {
        Some(path) => Deduplicator::load(path, retention).await,
        None => Deduplicator::in_memory(retention),
    }
}

fn build_connector(cfg: &CollectorConfig) -> Arc<dyn QueueConnector> {
    if cfg.broker.enabled {
        Arc::new(StompConnector::from_config(&cfg.broker))
    } else {
        tracing::warn!("broker disabled, records will not be published");
        Arc::new(DisabledConnector)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let config_path = config::default_config_path()?;
    let cfg = match &config_path {
        Some(p) => config::load_config_from(p)?,
        None => config::load_config_default()?,
    };
    logging::init_tracing(&cfg.logging);
    metrics::install_exporter(cfg.metrics.listen.as_deref())?;

    let dedup = build_dedup(&cfg).await;
    let publisher = Publisher::new(build_connector(&cfg), cfg.broker.destination.clone());
    let pipeline = Pipeline::new(
        Normalizer::new(cfg.dedup.fingerprint),
        dedup,
        publisher,
        &cfg.scheduler,
    );
    let factory = Arc::new(ConfiguredConnectors::new(
        config_path,
        cfg.clone(),
        launcher_for(&cfg.browser)?,
    ));
    let mut scheduler = Scheduler::new(pipeline, factory, &cfg.scheduler);

    let cancel = CancellationToken::new();
    shutdown::spawn_ctrl_c(cancel.clone());

    if run_once_requested() {
        let report = scheduler.run_cycle_now(&cancel).await;
        tracing::info!(
            published = report.published,
            delivery_failures = report.delivery_failures,
            "single cycle complete"
        );
        return Ok(());
    }

    let cycles = scheduler.run(cancel).await;
    tracing::info!(cycles, "collector stopped");
    Ok(())
}
