// tests/ingest_scheduler.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use job_leads_collector::config::SchedulerConfig;
use job_leads_collector::errors::SourceFetchError;
use job_leads_collector::ingest::dedup::Deduplicator;
use job_leads_collector::ingest::normalize::Normalizer;
use job_leads_collector::ingest::scheduler::{ConnectorFactory, Schedule, Scheduler, SchedulerState};
use job_leads_collector::ingest::types::{FeedPost, RawListing, SourceConnector, SourceKind};
use job_leads_collector::ingest::Pipeline;
use job_leads_collector::queue::memory::MemoryBroker;
use job_leads_collector::queue::publisher::Publisher;
use tokio_util::sync::CancellationToken;

/// Sleeps before answering so the RUNNING-CYCLE state is observable.
struct SlowConnector {
    delay: Duration,
    body: &'static str,
}

#[async_trait]
impl SourceConnector for SlowConnector {
    async fn fetch(&self, _cancel: &CancellationToken) -> Result<Vec<RawListing>, SourceFetchError> {
        tokio::time::sleep(self.delay).await;
        Ok(vec![RawListing::Feed(FeedPost {
            category: "/technologies/rust".into(),
            body_text: self.body.into(),
            link: Some("https://acme.test/rust".into()),
            ..FeedPost::default()
        })])
    }
    fn source(&self) -> SourceKind {
        SourceKind::Feed
    }
    fn name(&self) -> &'static str {
        "slow"
    }
}

fn pipeline(broker: &MemoryBroker) -> Pipeline {
    Pipeline::new(
        Normalizer::default(),
        Deduplicator::in_memory(chrono::Duration::days(30)),
        Publisher::new(Arc::new(broker.clone()), "/queue/etl_job_leads"),
        &SchedulerConfig::default(),
    )
}

fn factory(calls: Arc<AtomicUsize>) -> Arc<dyn ConnectorFactory> {
    Arc::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        vec![Box::new(SlowConnector {
            delay: Duration::from_secs(2),
            body: "Acme | Rust Engineer | Remote",
        }) as Box<dyn SourceConnector>]
    })
}

#[tokio::test(start_paused = true)]
async fn state_moves_through_running_cycle_and_back() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(
        pipeline(&broker),
        factory(calls.clone()),
        &SchedulerConfig::default(),
    );
    let mut rx = scheduler.subscribe();
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 2 && rx.changed().await.is_ok() {
            seen.push(*rx.borrow_and_update());
        }
        seen
    });

    let report = scheduler.run_cycle_now(&CancellationToken::new()).await;
    assert_eq!(report.published, 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(
        observer.await.unwrap(),
        vec![SchedulerState::RunningCycle, SchedulerState::Idle]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn run_ticks_on_interval_and_stops_on_cancel() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(
        pipeline(&broker),
        factory(calls.clone()),
        &SchedulerConfig::default(),
    )
    .with_interval(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        // cycles start at 0s, 60s and 120s
        tokio::time::sleep(Duration::from_secs(150)).await;
        stopper.cancel();
    });

    let cycles = scheduler.run(cancel).await;
    assert_eq!(cycles, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // same listing every cycle: only the first one publishes
    assert_eq!(broker.published().len(), 1);
    assert_eq!(scheduler.pipeline().dedup().seen().len(), 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn deferred_first_tick_waits_one_interval() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let cfg = SchedulerConfig {
        run_on_start: false,
        ..SchedulerConfig::default()
    };
    let mut scheduler = Scheduler::new(pipeline(&broker), factory(calls.clone()), &cfg)
        .with_interval(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        stopper.cancel();
    });

    assert_eq!(scheduler.run(cancel).await, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn long_cycle_delays_the_next_tick_instead_of_overlapping() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow: Arc<dyn ConnectorFactory> = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        vec![Box::new(SlowConnector {
            delay: Duration::from_secs(90),
            body: "Globex | SRE | Berlin",
        }) as Box<dyn SourceConnector>]
    });
    let mut scheduler = Scheduler::new(pipeline(&broker), slow, &SchedulerConfig::default())
        .with_interval(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        // cycle one runs 0..90s; cycle two starts late and is cut short
        tokio::time::sleep(Duration::from_secs(100)).await;
        stopper.cancel();
    });

    let cycles = scheduler.run(cancel).await;
    assert_eq!(cycles, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn daily_schedule_waits_for_its_wall_clock_slot() {
    use chrono::Timelike;

    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let cfg = SchedulerConfig {
        run_on_start: false,
        ..SchedulerConfig::default()
    };
    let slot = (chrono::Utc::now() + chrono::Duration::hours(2)).time();
    let at = chrono::NaiveTime::from_hms_opt(slot.hour(), slot.minute(), 0).unwrap();
    let mut scheduler = Scheduler::new(pipeline(&broker), factory(calls.clone()), &cfg)
        .with_schedule(Schedule::DailyAt(at));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        // the slot comes up within two hours; the next one is a day later
        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        stopper.cancel();
    });

    assert_eq!(scheduler.run(cancel).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.published().len(), 1);
}

#[test]
fn cron_config_selects_the_schedule() {
    let broker = MemoryBroker::new();
    let mut cfg = SchedulerConfig::default();
    cfg.cron.enabled = true;
    cfg.cron.schedule = "15 4 * * *".into();
    let scheduler = Scheduler::new(
        pipeline(&broker),
        factory(Arc::new(AtomicUsize::new(0))),
        &cfg,
    );
    assert_eq!(
        scheduler.schedule(),
        Schedule::DailyAt(chrono::NaiveTime::from_hms_opt(4, 15, 0).unwrap())
    );
}
