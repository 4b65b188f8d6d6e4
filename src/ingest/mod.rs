// src/ingest/mod.rs
pub mod dedup;
pub mod fingerprint;
pub mod normalize;
pub mod providers;
pub mod scheduler;
pub mod types;

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::errors::{PublishError, SourceFetchError};
use crate::ingest::dedup::Deduplicator;
use crate::ingest::normalize::Normalizer;
use crate::ingest::types::{Job, RawListing, SourceConnector, SourceKind};
use crate::queue::publisher::Publisher;
use crate::queue::CycleFailure;

pub use crate::ingest::normalize::normalize_text;

/// How long a connector gets to wind down after the cycle deadline.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_cycles_total", "Collection cycles run.");
        describe_counter!("ingest_fetched_total", "Raw listings fetched, by source.");
        describe_counter!(
            "ingest_malformed_total",
            "Raw listings dropped by the normalizer."
        );
        describe_counter!(
            "ingest_dedup_total",
            "Records suppressed as already published."
        );
        describe_counter!(
            "ingest_published_total",
            "Records acknowledged by the broker."
        );
        describe_counter!(
            "ingest_delivery_errors_total",
            "Records the broker did not acknowledge."
        );
        describe_counter!(
            "ingest_provider_errors_total",
            "Connector fetch failures and timeouts."
        );
        describe_histogram!("ingest_parse_ms", "Source page parse time in milliseconds.");
        describe_histogram!("ingest_cycle_ms", "Wall time of one cycle in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when ingest pipeline last ran."
        );
    });
}

/// Outcome of one connector within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub name: &'static str,
    pub source: SourceKind,
    pub fetched: usize,
    pub timed_out: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources: Vec<SourceReport>,
    pub fetched: usize,
    pub normalized: usize,
    pub malformed: usize,
    /// Repeats within this cycle's own batch.
    pub in_cycle_duplicates: usize,
    /// Already published in an earlier cycle, within retention.
    pub duplicates: usize,
    pub published: usize,
    pub delivery_failures: usize,
    /// Records not attempted because the broker was unreachable.
    pub unpublished: usize,
    pub broker_unavailable: bool,
    pub pruned: usize,
    pub cancelled: bool,
    /// A cycle-failure message reached the broker.
    pub failure_reported: bool,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration_ms: 0,
            sources: Vec::new(),
            fetched: 0,
            normalized: 0,
            malformed: 0,
            in_cycle_duplicates: 0,
            duplicates: 0,
            published: 0,
            delivery_failures: 0,
            unpublished: 0,
            broker_unavailable: false,
            pruned: 0,
            cancelled: false,
            failure_reported: false,
        }
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }

    /// The cycle failed when it had sources and none of them delivered.
    pub fn failure(&self) -> Option<CycleFailure> {
        if self.sources.is_empty() || self.failed_sources() < self.sources.len() {
            return None;
        }
        Some(CycleFailure {
            started_at: self.started_at,
            reason: format!("all {} sources failed", self.sources.len()),
            sources: self
                .sources
                .iter()
                .filter_map(|s| Some((s.name.to_string(), s.error.clone()?)))
                .collect(),
        })
    }
}

/// Fetch → normalize → dedup check → publish → mark seen, once per cycle.
pub struct Pipeline {
    normalizer: Normalizer,
    dedup: Deduplicator,
    publisher: Publisher,
    cycle_timeout: Duration,
    max_concurrent: usize,
}

impl Pipeline {
    pub fn new(
        normalizer: Normalizer,
        dedup: Deduplicator,
        publisher: Publisher,
        cfg: &SchedulerConfig,
    ) -> Self {
        Self {
            normalizer,
            dedup,
            publisher,
            cycle_timeout: Duration::from_secs(cfg.cycle_timeout_secs.max(1)),
            max_concurrent: cfg.max_concurrent_sources.max(1),
        }
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Run one full cycle over `connectors`. Never fails: every error is
    /// logged and counted in the report.
    pub async fn run_cycle(
        &mut self,
        connectors: &[Box<dyn SourceConnector>],
        cancel: &CancellationToken,
    ) -> CycleReport {
        ensure_metrics_described();
        let t0 = Instant::now();
        let mut report = CycleReport::new(Utc::now());
        tracing::info!(target: "ingest", sources = connectors.len(), "cycle started");
        counter!("ingest_cycles_total").increment(1);

        let raw = self.fetch_all(connectors, cancel, &mut report).await;
        if cancel.is_cancelled() {
            report.cancelled = true;
            return self.finish(report, t0);
        }

        let jobs = self.normalize_all(raw, &mut report);
        self.publisher.begin_cycle();
        self.publish_all(jobs, cancel, &mut report).await;
        if let Some(failure) = report.failure() {
            self.report_failure(&failure, &mut report).await;
        }
        self.publisher.end_cycle().await;

        report.pruned = self.dedup.prune(Utc::now());
        if let Err(e) = self.dedup.persist().await {
            tracing::error!(target: "ingest", stage = "persist", error = ?e, "seen-set not persisted");
        }
        self.finish(report, t0)
    }

    async fn fetch_all(
        &self,
        connectors: &[Box<dyn SourceConnector>],
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Vec<RawListing> {
        let deadline = Instant::now() + self.cycle_timeout;
        let timeout_secs = self.cycle_timeout.as_secs();

        let mut results: Vec<(usize, Result<Vec<RawListing>, SourceFetchError>, bool)> =
            stream::iter(connectors.iter().enumerate())
                .map(|(i, c)| {
                    let token = cancel.child_token();
                    async move {
                        let fut = c.fetch(&token);
                        tokio::pin!(fut);
                        tokio::select! {
                            r = &mut fut => (i, r, false),
                            _ = cancel.cancelled() => {
                                let _ = tokio::time::timeout(CANCEL_GRACE, &mut fut).await;
                                (i, Err(SourceFetchError::Cancelled { source_name: c.name() }), false)
                            }
                            _ = tokio::time::sleep_until(deadline) => {
                                token.cancel();
                                let _ = tokio::time::timeout(CANCEL_GRACE, &mut fut).await;
                                let err = SourceFetchError::Timeout { source_name: c.name(), secs: timeout_secs };
                                (i, Err(err), true)
                            }
                        }
                    }
                })
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;
        results.sort_by_key(|(i, _, _)| *i);

        let mut raw = Vec::new();
        for (i, result, timed_out) in results {
            let c = &connectors[i];
            let mut sr = SourceReport {
                name: c.name(),
                source: c.source(),
                fetched: 0,
                timed_out,
                error: None,
            };
            match result {
                Ok(listings) => {
                    sr.fetched = listings.len();
                    counter!("ingest_fetched_total", "source" => c.name())
                        .increment(listings.len() as u64);
                    tracing::info!(target: "ingest", source = c.name(), fetched = listings.len(), "source fetched");
                    raw.extend(listings);
                }
                Err(e) => {
                    counter!("ingest_provider_errors_total", "source" => c.name()).increment(1);
                    tracing::warn!(target: "ingest", error = ?e, provider = c.name(), stage = "fetch", "provider error");
                    sr.error = Some(e.to_string());
                }
            }
            report.fetched += sr.fetched;
            report.sources.push(sr);
        }
        raw
    }

    fn normalize_all(&self, raw: Vec<RawListing>, report: &mut CycleReport) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(raw.len());
        for listing in &raw {
            match self.normalizer.normalize(listing) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    report.malformed += 1;
                    counter!("ingest_malformed_total", "source" => e.source_kind.as_str()).increment(1);
                    tracing::warn!(target: "ingest", source = %e.source_kind, reason = %e.reason, stage = "normalize", "malformed record dropped");
                }
            }
        }
        report.normalized = jobs.len();
        jobs
    }

    async fn publish_all(
        &mut self,
        jobs: Vec<Job>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) {
        let now = Utc::now();
        let mut in_cycle: HashSet<String> = HashSet::new();

        for job in jobs {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !in_cycle.insert(job.fingerprint.clone()) {
                report.in_cycle_duplicates += 1;
                continue;
            }
            if self.dedup.is_duplicate(&job.fingerprint, now) {
                report.duplicates += 1;
                continue;
            }
            if report.broker_unavailable {
                report.unpublished += 1;
                continue;
            }
            match self.publisher.publish(&job).await {
                Ok(()) => {
                    self.dedup.mark_seen(&job.fingerprint, Utc::now());
                    report.published += 1;
                }
                Err(PublishError::BrokerUnavailable(e)) => {
                    report.broker_unavailable = true;
                    report.unpublished += 1;
                    tracing::error!(target: "ingest", stage = "publish", error = %e, "broker unavailable, no further publishes this cycle");
                }
                Err(e) => {
                    report.delivery_failures += 1;
                    tracing::warn!(
                        target: "ingest",
                        stage = "publish",
                        source = %job.source,
                        fingerprint = %job.fingerprint,
                        error = %e,
                        "delivery failed, will retry next cycle"
                    );
                }
            }
        }
    }

    async fn report_failure(&mut self, failure: &CycleFailure, report: &mut CycleReport) {
        match self.publisher.publish_cycle_failure(failure).await {
            Ok(()) => {
                report.failure_reported = true;
                tracing::warn!(target: "ingest", reason = %failure.reason, "cycle failure published");
            }
            Err(e) => {
                tracing::error!(target: "ingest", stage = "publish", error = %e, "cycle failure not published");
            }
        }
    }

    fn finish(&self, mut report: CycleReport, t0: Instant) -> CycleReport {
        report.duration_ms = t0.elapsed().as_millis() as u64;
        let dups = (report.duplicates + report.in_cycle_duplicates) as u64;
        counter!("ingest_dedup_total").increment(dups);
        counter!("ingest_published_total").increment(report.published as u64);
        counter!("ingest_delivery_errors_total").increment(report.delivery_failures as u64);
        histogram!("ingest_cycle_ms").record(report.duration_ms as f64);
        gauge!("ingest_pipeline_last_run_ts").set(Utc::now().timestamp() as f64);

        tracing::info!(
            target: "ingest",
            fetched = report.fetched,
            normalized = report.normalized,
            malformed = report.malformed,
            duplicates = report.duplicates,
            in_cycle_duplicates = report.in_cycle_duplicates,
            published = report.published,
            delivery_failures = report.delivery_failures,
            unpublished = report.unpublished,
            failed_sources = report.failed_sources(),
            seen = self.dedup.seen().len(),
            pruned = report.pruned,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "cycle finished"
        );
        report
    }
}
