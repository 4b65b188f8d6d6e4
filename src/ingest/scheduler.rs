// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::ingest::types::SourceConnector;
use crate::ingest::{CycleReport, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RunningCycle,
}

/// When cycles start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period between cycle starts.
    Every(Duration),
    /// Once a day at this UTC wall-clock time.
    DailyAt(NaiveTime),
}

impl Schedule {
    /// Accepts `M H * * *` where `H` is `*/N` (every N hours) or an hour
    /// (daily at `H:M`). Day, month and weekday fields are not supported.
    pub fn parse_cron(expr: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, rest @ ..] = parts.as_slice() else {
            return Err(format!("cron schedule {expr:?} needs at least minute and hour"));
        };
        if rest.iter().any(|f| *f != "*") {
            return Err(format!("cron schedule {expr:?}: only `*` is supported past the hour field"));
        }
        if let Some(n) = hour.strip_prefix("*/") {
            let hours: u64 = n
                .parse()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| format!("cron schedule {expr:?}: bad hour step {n:?}"))?;
            return Ok(Schedule::Every(Duration::from_secs(hours * 3600)));
        }
        let h: u32 = hour
            .parse()
            .map_err(|_| format!("cron schedule {expr:?}: bad hour {hour:?}"))?;
        let m: u32 = minute
            .parse()
            .map_err(|_| format!("cron schedule {expr:?}: bad minute {minute:?}"))?;
        NaiveTime::from_hms_opt(h, m, 0)
            .map(Schedule::DailyAt)
            .ok_or_else(|| format!("cron schedule {expr:?}: {h}:{m} is not a time of day"))
    }
}

/// First instant strictly after `after` whose UTC time of day is `at`.
pub fn next_daily(at: NaiveTime, after: DateTime<Utc>) -> DateTime<Utc> {
    let same_day = after.date_naive().and_time(at).and_utc();
    if same_day > after {
        same_day
    } else {
        same_day + chrono::Duration::days(1)
    }
}

/// Produces the connectors for one cycle, from that cycle's configuration.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connectors(&self) -> Vec<Box<dyn SourceConnector>>;
}

#[async_trait]
impl<F> ConnectorFactory for F
where
    F: Fn() -> Vec<Box<dyn SourceConnector>> + Send + Sync,
{
    async fn connectors(&self) -> Vec<Box<dyn SourceConnector>> {
        self()
    }
}

/// Drives cycles on a fixed interval or a daily time. At most one cycle runs
/// at a time; ticks missed during a long cycle are delayed, not replayed.
pub struct Scheduler {
    pipeline: Pipeline,
    factory: Arc<dyn ConnectorFactory>,
    schedule: Schedule,
    run_on_start: bool,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, factory: Arc<dyn ConnectorFactory>, cfg: &SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        let schedule = cfg.schedule().unwrap_or_else(|e| {
            tracing::warn!(target: "ingest", error = %e, "bad schedule, using interval_secs");
            Schedule::Every(Duration::from_secs(cfg.interval_secs.max(1)))
        });
        Self {
            pipeline,
            factory,
            schedule,
            run_on_start: cfg.run_on_start,
            state,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.schedule = Schedule::Every(interval);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// IDLE → RUNNING-CYCLE → IDLE around one pipeline cycle.
    pub async fn run_cycle_now(&mut self, cancel: &CancellationToken) -> CycleReport {
        self.state.send_replace(SchedulerState::RunningCycle);
        let connectors = self.factory.connectors().await;
        let report = self.pipeline.run_cycle(&connectors, cancel).await;
        self.state.send_replace(SchedulerState::Idle);

        if !report.sources.is_empty() && report.failed_sources() == report.sources.len() {
            tracing::error!(target: "ingest", sources = report.sources.len(), "every source failed this cycle");
        }
        report
    }

    /// Tick until `cancel` fires. Returns the number of cycles run.
    pub async fn run(&mut self, cancel: CancellationToken) -> usize {
        let cycles = match self.schedule {
            Schedule::Every(interval) => self.run_every(interval, &cancel).await,
            Schedule::DailyAt(at) => self.run_daily(at, &cancel).await,
        };
        tracing::info!(target: "ingest", cycles, "scheduler stopped");
        cycles
    }

    async fn run_every(&mut self, interval: Duration, cancel: &CancellationToken) -> usize {
        let first = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + interval
        };
        let mut ticker = tokio::time::interval_at(first, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            target: "ingest",
            interval_secs = interval.as_secs(),
            run_on_start = self.run_on_start,
            "scheduler started"
        );

        let mut cycles = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle_now(cancel).await;
            cycles += 1;
            if cancel.is_cancelled() {
                break;
            }
        }
        cycles
    }

    async fn run_daily(&mut self, at: NaiveTime, cancel: &CancellationToken) -> usize {
        let mut cycles = 0usize;
        if self.run_on_start {
            self.run_cycle_now(cancel).await;
            cycles += 1;
        }
        let mut target = next_daily(at, Utc::now());
        tracing::info!(target: "ingest", at = %at, next = %target, "scheduler started");

        while !cancel.is_cancelled() {
            let wait = (target - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.run_cycle_now(cancel).await;
            cycles += 1;
            // A cycle that overran the next slot skips it.
            target = next_daily(at, target.max(Utc::now()));
        }
        cycles
    }
}
