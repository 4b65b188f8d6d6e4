// tests/listener.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use job_leads_collector::config::SchedulerConfig;
use job_leads_collector::ingest::dedup::Deduplicator;
use job_leads_collector::ingest::normalize::Normalizer;
use job_leads_collector::ingest::types::{FeedPost, Job, RawListing, SourceConnector, SourceKind};
use job_leads_collector::ingest::Pipeline;
use job_leads_collector::queue::listener::{
    Backoff, JobSink, Listener, MemoryJobStore, UpsertOutcome,
};
use job_leads_collector::queue::memory::MemoryBroker;
use job_leads_collector::queue::publisher::Publisher;
use job_leads_collector::queue::{CycleFailure, QueueSubscriber};
use tokio_util::sync::CancellationToken;

struct StaticConnector(Vec<RawListing>);

#[async_trait]
impl SourceConnector for StaticConnector {
    async fn fetch(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<RawListing>, job_leads_collector::errors::SourceFetchError> {
        Ok(self.0.clone())
    }
    fn source(&self) -> SourceKind {
        SourceKind::Feed
    }
    fn name(&self) -> &'static str {
        "static"
    }
}

struct BrokenSink;

#[async_trait]
impl JobSink for BrokenSink {
    async fn upsert(&self, _job: Job) -> anyhow::Result<UpsertOutcome> {
        anyhow::bail!("database is down")
    }
}

fn posts() -> Vec<RawListing> {
    ["Acme | Rust Engineer | Remote", "Globex | SRE | Berlin"]
        .iter()
        .enumerate()
        .map(|(i, body)| {
            RawListing::Feed(FeedPost {
                category: "/technologies/rust".into(),
                body_text: body.to_string(),
                link: Some(format!("https://jobs.test/{i}")),
                ..FeedPost::default()
            })
        })
        .collect()
}

async fn publish_all(broker: &MemoryBroker) {
    let mut pipeline = Pipeline::new(
        Normalizer::default(),
        Deduplicator::in_memory(chrono::Duration::days(30)),
        Publisher::new(Arc::new(broker.clone()), "/queue/etl_job_leads"),
        &SchedulerConfig::default(),
    );
    let connectors: Vec<Box<dyn SourceConnector>> = vec![Box::new(StaticConnector(posts()))];
    let report = pipeline.run_cycle(&connectors, &CancellationToken::new()).await;
    assert_eq!(report.published, 2);
}

fn listener(broker: &MemoryBroker, store: &MemoryJobStore) -> Listener {
    Listener::new(Arc::new(broker.clone()), Arc::new(store.clone()))
}

#[tokio::test]
async fn redelivered_records_are_upserted_once() {
    let broker = MemoryBroker::new();
    publish_all(&broker).await;
    broker.deliver_published();
    broker.deliver_published();

    let store = MemoryJobStore::new();
    let l = listener(&broker, &store);
    let mut sub = broker.subscribe().await.unwrap();
    let (stats, result) = l.consume(sub.as_mut(), &CancellationToken::new()).await;
    result.unwrap();

    assert_eq!(stats.received, 4);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.unchanged, 2);
    assert_eq!(store.len().await, 2);
    assert_eq!(broker.acked().len(), 4);

    for fp in broker.published_fingerprints() {
        assert!(store.get(&fp).await.is_some());
    }
}

#[tokio::test]
async fn undecodable_messages_are_acked_and_skipped() {
    let broker = MemoryBroker::new();
    broker.inject("not json at all");
    broker.inject(r#"{"schema_version": 2, "kind": "job", "job": {}}"#);
    broker.inject(vec![0xff, 0xfe]);

    let store = MemoryJobStore::new();
    let mut sub = broker.subscribe().await.unwrap();
    let (stats, result) = listener(&broker, &store)
        .consume(sub.as_mut(), &CancellationToken::new())
        .await;
    result.unwrap();

    assert_eq!(stats.decode_errors, 3);
    assert_eq!(broker.acked().len(), 3);
    assert!(broker.nacked().is_empty());
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn cycle_failure_notices_are_acked_without_touching_the_store() {
    let broker = MemoryBroker::new();
    let mut publisher = Publisher::new(Arc::new(broker.clone()), "/queue/etl_job_leads");
    publisher.begin_cycle();
    publisher
        .publish_cycle_failure(&CycleFailure {
            started_at: chrono::Utc::now(),
            reason: "all 2 sources failed".into(),
            sources: vec![
                ("search".into(), "rate limited".into()),
                ("feed".into(), "status 503".into()),
            ],
        })
        .await
        .unwrap();
    publisher.end_cycle().await;
    broker.deliver_published();

    let store = MemoryJobStore::new();
    let mut sub = broker.subscribe().await.unwrap();
    let (stats, result) = listener(&broker, &store)
        .consume(sub.as_mut(), &CancellationToken::new())
        .await;
    result.unwrap();

    assert_eq!(stats.received, 1);
    assert_eq!(stats.cycle_failures, 1);
    assert_eq!(stats.decode_errors, 0);
    assert_eq!(broker.acked().len(), 1);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn sink_failure_is_nacked_for_redelivery() {
    let broker = MemoryBroker::new();
    publish_all(&broker).await;
    broker.deliver_published();

    let l = Listener::new(Arc::new(broker.clone()), Arc::new(BrokenSink));
    let mut sub = broker.subscribe().await.unwrap();
    let (stats, result) = l.consume(sub.as_mut(), &CancellationToken::new()).await;
    result.unwrap();

    assert_eq!(stats.sink_errors, 2);
    assert_eq!(broker.nacked().len(), 2);
    assert!(broker.acked().is_empty());
}

#[tokio::test]
async fn changed_record_counts_as_update() {
    let store = MemoryJobStore::new();
    let job = Normalizer::default().normalize(&posts()[0]).unwrap();
    assert_eq!(store.upsert(job.clone()).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(store.upsert(job.clone()).await.unwrap(), UpsertOutcome::Unchanged);

    let edited = Job {
        description: Some("now with more detail".into()),
        ..job
    };
    assert_eq!(store.upsert(edited.clone()).await.unwrap(), UpsertOutcome::Updated);
    assert_eq!(store.get(&edited.fingerprint).await, Some(edited));
}

#[tokio::test(start_paused = true)]
async fn run_resubscribes_until_cancelled() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let store = MemoryJobStore::new();
    let l = listener(&broker, &store).with_backoff(Backoff {
        initial: Duration::from_secs(1),
        max: Duration::from_secs(4),
    });

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { l.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    broker.set_reachable(true);
    publish_all(&broker).await;
    broker.deliver_published();

    tokio::time::sleep(Duration::from_secs(30)).await;
    cancel.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.received, 2);
    assert_eq!(stats.applied, 2);
    assert_eq!(store.len().await, 2);
    // one subscription that drained, then periodic re-subscribes
    assert!(broker.connects() > 2);
}
