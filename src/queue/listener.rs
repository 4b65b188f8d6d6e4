// src/queue/listener.rs
//! Long-running consumer: decode envelope, upsert by fingerprint, ACK.
//!
//! Undecodable messages are ACKed so they cannot loop; sink failures are
//! NACKed so the broker redelivers them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::errors::{ConsumerDecodeError, QueueError};
use crate::ingest::types::Job;
use crate::queue::{
    CycleFailureEnvelope, Delivery, JobEnvelope, QueueSubscriber, QueueSubscription,
    CYCLE_FAILURE_KIND,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Downstream store. Upserts must be keyed by `job.fingerprint`.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn upsert(&self, job: Job) -> anyhow::Result<UpsertOutcome>;
}

/// Reference sink holding the latest record per fingerprint.
#[derive(Debug, Default, Clone)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn get(&self, fingerprint: &str) -> Option<Job> {
        self.jobs.read().await.get(fingerprint).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, Job> {
        self.jobs.read().await.clone()
    }
}

#[async_trait]
impl JobSink for MemoryJobStore {
    async fn upsert(&self, job: Job) -> anyhow::Result<UpsertOutcome> {
        let mut jobs = self.jobs.write().await;
        let outcome = match jobs.get(&job.fingerprint) {
            None => UpsertOutcome::Inserted,
            Some(existing) if *existing == job => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        if outcome != UpsertOutcome::Unchanged {
            jobs.insert(job.fingerprint.clone(), job);
        }
        Ok(outcome)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    pub received: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub decode_errors: usize,
    pub sink_errors: usize,
    /// Cycle-failure notices from the collector.
    pub cycle_failures: usize,
}

impl ListenerStats {
    fn absorb(&mut self, other: ListenerStats) {
        self.received += other.received;
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.decode_errors += other.decode_errors;
        self.sink_errors += other.sink_errors;
        self.cycle_failures += other.cycle_failures;
    }
}

/// Reconnect delays: doubles from `initial` up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "listener_messages_total",
            "Messages received by the listener, by outcome."
        );
        describe_counter!(
            "listener_decode_errors_total",
            "Messages skipped because they could not be decoded."
        );
    });
}

pub struct Listener {
    subscriber: Arc<dyn QueueSubscriber>,
    sink: Arc<dyn JobSink>,
    backoff: Backoff,
}

impl Listener {
    pub fn new(subscriber: Arc<dyn QueueSubscriber>, sink: Arc<dyn JobSink>) -> Self {
        Self {
            subscriber,
            sink,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Subscribe and consume until `cancel` fires, reconnecting after
    /// connection loss.
    pub async fn run(&self, cancel: CancellationToken) -> ListenerStats {
        ensure_metrics_described();
        let mut total = ListenerStats::default();
        let mut delay = self.backoff.initial;

        while !cancel.is_cancelled() {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                s = self.subscriber.subscribe() => s,
            };
            match subscribed {
                Ok(mut sub) => {
                    delay = self.backoff.initial;
                    let (stats, result) = self.consume(sub.as_mut(), &cancel).await;
                    total.absorb(stats);
                    sub.close().await;
                    match result {
                        Ok(()) if cancel.is_cancelled() => break,
                        Ok(()) => tracing::warn!(target: "listener", "broker closed the subscription"),
                        Err(e) => tracing::warn!(target: "listener", error = %e, "subscription failed"),
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "listener",
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "cannot subscribe"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.backoff.max);
        }

        tracing::info!(
            target: "listener",
            received = total.received,
            applied = total.applied,
            unchanged = total.unchanged,
            decode_errors = total.decode_errors,
            sink_errors = total.sink_errors,
            "listener stopped"
        );
        total
    }

    /// Drain one subscription until it ends, fails, or `cancel` fires.
    pub async fn consume(
        &self,
        sub: &mut dyn QueueSubscription,
        cancel: &CancellationToken,
    ) -> (ListenerStats, Result<(), QueueError>) {
        ensure_metrics_described();
        let mut stats = ListenerStats::default();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return (stats, Ok(())),
                d = sub.next_delivery() => d,
            };
            let delivery = match next {
                Ok(Some(d)) => d,
                Ok(None) => return (stats, Ok(())),
                Err(e) => return (stats, Err(e)),
            };
            stats.received += 1;
            if let Err(e) = self.handle(sub, &delivery, &mut stats).await {
                return (stats, Err(e));
            }
        }
    }

    async fn handle(
        &self,
        sub: &mut dyn QueueSubscription,
        delivery: &Delivery,
        stats: &mut ListenerStats,
    ) -> Result<(), QueueError> {
        let envelope = match JobEnvelope::decode(&delivery.body) {
            Ok(env) => env,
            Err(ConsumerDecodeError::UnsupportedKind(kind)) if kind == CYCLE_FAILURE_KIND => {
                return self.handle_cycle_failure(sub, delivery, stats).await;
            }
            Err(e) => {
                stats.decode_errors += 1;
                counter!("listener_decode_errors_total").increment(1);
                counter!("listener_messages_total", "outcome" => "skipped").increment(1);
                tracing::warn!(
                    target: "listener",
                    message_id = delivery.message_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "skipping undecodable message"
                );
                return sub.ack(delivery).await;
            }
        };

        let fingerprint = envelope.job.fingerprint.clone();
        match self.sink.upsert(envelope.job).await {
            Ok(outcome) => {
                match outcome {
                    UpsertOutcome::Unchanged => stats.unchanged += 1,
                    UpsertOutcome::Inserted | UpsertOutcome::Updated => stats.applied += 1,
                }
                counter!("listener_messages_total", "outcome" => outcome_label(outcome))
                    .increment(1);
                tracing::debug!(target: "listener", %fingerprint, ?outcome, "upserted");
                sub.ack(delivery).await
            }
            Err(e) => {
                stats.sink_errors += 1;
                counter!("listener_messages_total", "outcome" => "nacked").increment(1);
                tracing::error!(target: "listener", %fingerprint, error = ?e, "sink upsert failed");
                sub.nack(delivery).await
            }
        }
    }
}

impl Listener {
    async fn handle_cycle_failure(
        &self,
        sub: &mut dyn QueueSubscription,
        delivery: &Delivery,
        stats: &mut ListenerStats,
    ) -> Result<(), QueueError> {
        match CycleFailureEnvelope::decode(&delivery.body) {
            Ok(env) => {
                stats.cycle_failures += 1;
                counter!("listener_messages_total", "outcome" => "cycle_failure").increment(1);
                tracing::warn!(
                    target: "listener",
                    started_at = %env.failure.started_at,
                    reason = %env.failure.reason,
                    sources = ?env.failure.sources,
                    "collector reported a failed cycle"
                );
            }
            Err(e) => {
                stats.decode_errors += 1;
                counter!("listener_decode_errors_total").increment(1);
                tracing::warn!(target: "listener", error = %e, "skipping undecodable cycle failure");
            }
        }
        sub.ack(delivery).await
    }
}

fn outcome_label(outcome: UpsertOutcome) -> &'static str {
    match outcome {
        UpsertOutcome::Inserted => "inserted",
        UpsertOutcome::Updated => "updated",
        UpsertOutcome::Unchanged => "unchanged",
    }
}
