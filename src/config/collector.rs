// src/config/collector.rs
//! Typed configuration for the collector and the queue listener.
//!
//! Every section is optional in the file; missing keys fall back to the
//! defaults below, so a minimal config only needs to enable sources.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::fingerprint::FingerprintPolicy;
use crate::ingest::scheduler::Schedule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub scheduler: SchedulerConfig,
    pub dedup: DedupConfig,
    pub broker: BrokerConfig,
    pub search: SearchConfig,
    pub feed: FeedConfig,
    pub browser: BrowserConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed interval between cycle starts (default 6h).
    pub interval_secs: u64,
    /// Deadline for the whole fetch phase of a cycle.
    pub cycle_timeout_secs: u64,
    pub max_concurrent_sources: usize,
    /// Run the first cycle immediately instead of after one interval.
    pub run_on_start: bool,
    /// Cron-style timing; replaces `interval_secs` when enabled.
    pub cron: CronConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 3600,
            cycle_timeout_secs: 1800,
            max_concurrent_sources: 3,
            run_on_start: true,
            cron: CronConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// The timer this configuration asks for.
    pub fn schedule(&self) -> Result<Schedule, String> {
        if self.cron.enabled {
            Schedule::parse_cron(&self.cron.schedule)
        } else {
            Ok(Schedule::Every(Duration::from_secs(self.interval_secs.max(1))))
        }
    }
}

/// `minute hour * * *` with the hour either `*/N` (every N hours) or a
/// number (daily at `hour:minute` UTC). Other fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub enabled: bool,
    pub schedule: String,
    pub description: Option<String>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 */6 * * *".to_string(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// JSON file holding the seen-set; in-memory only when unset.
    pub state_path: Option<String>,
    pub retention_days: u32,
    pub fingerprint: FingerprintPolicy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            state_path: Some("state/seen_jobs.json".to_string()),
            retention_days: 30,
            fingerprint: FingerprintPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// STOMP `host` header; defaults to `host` when unset.
    pub virtual_host: Option<String>,
    pub destination: String,
    pub connect_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
    /// Client heart-beat interval for long-lived consumers (0 disables).
    pub heartbeat_ms: u64,
    pub subscription_id: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 61613,
            username: None,
            password: None,
            virtual_host: None,
            destination: "/queue/etl_job_leads".to_string(),
            connect_timeout_secs: 10,
            receipt_timeout_secs: 10,
            heartbeat_ms: 30_000,
            subscription_id: "listener-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    /// JSON search endpoint returning an array of listings.
    pub endpoint: String,
    pub sites: Vec<String>,
    pub search_terms: Vec<String>,
    pub locations: Vec<String>,
    pub results_wanted: u32,
    pub hours_old: u32,
    pub country: String,
    pub request_delay_ms: u64,
    /// Extra pause after a failed query, on top of `request_delay_ms`.
    pub error_delay_ms: u64,
    /// Pause after finishing every query of one site.
    pub site_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:8000/jobs".to_string(),
            sites: vec!["indeed".to_string()],
            search_terms: Vec::new(),
            locations: vec!["Remote".to_string()],
            results_wanted: 50,
            hours_old: 72,
            country: "USA".to_string(),
            request_delay_ms: 8_000,
            error_delay_ms: 10_000,
            site_delay_ms: 15_000,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Category paths, e.g. `/technologies/rust` or `/locations/remote`.
    pub categories: Vec<String>,
    pub days: Option<u32>,
    pub min_salary: Option<u64>,
    pub max_salary: Option<u64>,
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://hnhiring.com".to_string(),
            categories: Vec::new(),
            days: None,
            min_salary: None,
            max_salary: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserDriver {
    #[default]
    Http,
    Webdriver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub enabled: bool,
    pub base_url: String,
    pub site_root: String,
    /// Falls back to `search.search_terms` when empty.
    pub keywords: Vec<String>,
    pub remote: bool,
    pub all_locations: bool,
    pub max_age_hours: Option<u32>,
    pub per_keyword_limit: Option<usize>,
    pub total_limit: Option<usize>,
    pub max_pages: u32,
    pub start_page: u32,
    /// `http` fetches server-rendered pages; `webdriver` drives a real
    /// browser and needs the `webdriver` cargo feature.
    pub driver: BrowserDriver,
    pub webdriver_url: String,
    pub headless: bool,
    pub slow_mo_ms: u64,
    /// Listing pages count as loaded once this selector matches.
    pub wait_selector: String,
    pub selector_timeout_ms: u64,
    pub page_wait_ms: u64,
    pub detail_wait_ms: u64,
    pub query_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://builtin.com/jobs".to_string(),
            site_root: "https://builtin.com".to_string(),
            keywords: Vec::new(),
            remote: true,
            all_locations: true,
            max_age_hours: Some(72),
            per_keyword_limit: None,
            total_limit: None,
            max_pages: 200,
            start_page: 1,
            driver: BrowserDriver::Http,
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            slow_mo_ms: 0,
            wait_selector: r#"h2 a[data-id="job-card-title"]"#.to_string(),
            selector_timeout_ms: 10_000,
            page_wait_ms: 0,
            detail_wait_ms: 1_500,
            query_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9000`.
    pub listen: Option<String>,
}
