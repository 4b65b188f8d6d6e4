// tests/providers_browser.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use job_leads_collector::config::BrowserConfig;
use job_leads_collector::errors::SourceFetchError;
use job_leads_collector::ingest::providers::browser::{listing_url, BrowserConnector};
use job_leads_collector::ingest::providers::session::{
    BrowserLauncher, BrowserSession, SessionOptions,
};
use job_leads_collector::ingest::types::{RawListing, SourceConnector};
use tokio_util::sync::CancellationToken;

const PYTHON_LISTING: &str = r#"<html><body>
  <div data-id="job-card">
    <h2><a data-id="job-card-title" href="/job/senior-rust-engineer/1001">Senior Rust Engineer</a></h2>
    <span>3 Hours Ago</span>
  </div>
  <div data-id="job-card">
    <h2><a data-id="job-card-title" href="/job/data-engineer/1004">Data Engineer</a></h2>
    <span>5 Hours Ago</span>
  </div>
</body></html>"#;

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    launched_with: Mutex<Vec<SessionOptions>>,
    waited_for: Mutex<Vec<String>>,
}

/// Serves canned pages by URL; navigating to a URL containing `hang_on`
/// never completes.
struct ScriptedLauncher {
    pages: Arc<HashMap<String, String>>,
    hang_on: &'static str,
    counters: Arc<Counters>,
}

struct ScriptedSession {
    pages: Arc<HashMap<String, String>>,
    hang_on: &'static str,
    current: Option<String>,
    counters: Arc<Counters>,
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        opts: &SessionOptions,
    ) -> Result<Box<dyn BrowserSession>, SourceFetchError> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.launched_with.lock().unwrap().push(opts.clone());
        Ok(Box::new(ScriptedSession {
            pages: self.pages.clone(),
            hang_on: self.hang_on,
            current: None,
            counters: self.counters.clone(),
        }))
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn goto(&mut self, url: &str) -> Result<(), SourceFetchError> {
        if url.contains(self.hang_on) {
            tokio::time::sleep(Duration::from_secs(10 * 24 * 3600)).await;
        }
        self.current = Some(url.to_string());
        Ok(())
    }

    async fn content(&mut self) -> Result<String, SourceFetchError> {
        let url = self.current.clone().unwrap_or_default();
        if url.contains("/job/") {
            return Ok(include_str!("fixtures/browser_detail.html").to_string());
        }
        Ok(self
            .pages
            .get(&url)
            .cloned()
            .unwrap_or_else(|| "<html><body></body></html>".to_string()))
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<(), SourceFetchError> {
        self.counters.waited_for.lock().unwrap().push(selector.to_string());
        if selector == "#never-rendered" {
            return Err(SourceFetchError::Browser {
                source_name: "browser",
                reason: "selector timed out".into(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn cfg() -> BrowserConfig {
    BrowserConfig {
        enabled: true,
        keywords: vec!["Rust".into(), "Go".into(), "Python".into()],
        max_pages: 3,
        page_wait_ms: 0,
        detail_wait_ms: 0,
        query_timeout_secs: 60,
        ..BrowserConfig::default()
    }
}

fn connector(cfg: BrowserConfig) -> (BrowserConnector, Arc<Counters>) {
    let mut pages = HashMap::new();
    pages.insert(
        listing_url(&cfg, "Rust", 1).unwrap(),
        include_str!("fixtures/browser_listing.html").to_string(),
    );
    pages.insert(
        listing_url(&cfg, "Python", 1).unwrap(),
        PYTHON_LISTING.to_string(),
    );
    let counters = Arc::new(Counters::default());
    let launcher = ScriptedLauncher {
        pages: Arc::new(pages),
        hang_on: "search=Go",
        counters: counters.clone(),
    };
    (BrowserConnector::new(cfg, &[], Arc::new(launcher)), counters)
}

fn urls(listings: &[RawListing]) -> Vec<String> {
    listings
        .iter()
        .map(|l| match l {
            RawListing::Browser(p) => p.url.clone(),
            other => panic!("unexpected listing {other:?}"),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn one_timed_out_query_does_not_sink_the_others() {
    let (c, counters) = connector(cfg());
    let got = c.fetch(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        urls(&got),
        vec![
            "https://builtin.com/job/senior-rust-engineer/1001",
            "https://builtin.com/job/backend-engineer/1002",
            "https://builtin.com/job/data-engineer/1004",
        ]
    );
    // one session per keyword, every one released
    assert_eq!(counters.opened.load(Ordering::SeqCst), 3);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 3);

    let RawListing::Browser(first) = &got[0] else {
        unreachable!()
    };
    assert_eq!(first.search_keyword, "Rust");
    assert_eq!(first.company.as_deref(), Some("Initrode"));
    assert_eq!(first.posted_text.as_deref(), Some("2 Hours Ago"));
    assert_eq!(first.skills, vec!["Rust", "PostgreSQL", "Kafka"]);
}

#[tokio::test(start_paused = true)]
async fn cards_older_than_the_cutoff_stop_collection() {
    let (c, _) = connector(BrowserConfig {
        keywords: vec!["Rust".into()],
        ..cfg()
    });
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    // the "30+ Days Ago" card ends the walk
    assert_eq!(got.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn limits_cap_results() {
    let (c, _) = connector(BrowserConfig {
        per_keyword_limit: Some(1),
        ..cfg()
    });
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        urls(&got),
        vec![
            "https://builtin.com/job/senior-rust-engineer/1001",
            "https://builtin.com/job/data-engineer/1004",
        ]
    );

    let (c, counters) = connector(BrowserConfig {
        total_limit: Some(2),
        ..cfg()
    });
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_closes_the_open_session() {
    let (c, counters) = connector(BrowserConfig {
        keywords: vec!["Go".into(), "Rust".into()],
        ..cfg()
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let err = c.fetch(&cancel).await.unwrap_err();
    assert!(matches!(err, SourceFetchError::Cancelled { .. }));
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn every_query_timing_out_fails_the_connector() {
    let (c, counters) = connector(BrowserConfig {
        keywords: vec!["Go".into(), "go  remote".into()],
        ..cfg()
    });
    let err = c.fetch(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        SourceFetchError::AllQueriesFailed { attempted: 1, .. }
    ));
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn sessions_follow_display_options_and_wait_for_listing_cards() {
    let (c, counters) = connector(BrowserConfig {
        keywords: vec!["Rust".into()],
        headless: false,
        slow_mo_ms: 250,
        ..cfg()
    });
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    assert_eq!(got.len(), 2);

    let launched = counters.launched_with.lock().unwrap().clone();
    assert_eq!(launched.len(), 1);
    assert!(!launched[0].headless);
    assert_eq!(launched[0].slow_mo_ms, 250);

    let waited = counters.waited_for.lock().unwrap().clone();
    assert!(!waited.is_empty());
    assert!(waited.iter().all(|s| s == r#"h2 a[data-id="job-card-title"]"#));
}

#[tokio::test(start_paused = true)]
async fn unmatched_wait_selector_still_parses_the_page() {
    let (c, counters) = connector(BrowserConfig {
        keywords: vec!["Python".into()],
        wait_selector: "#never-rendered".into(),
        ..cfg()
    });
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        urls(&got),
        vec![
            "https://builtin.com/job/senior-rust-engineer/1001",
            "https://builtin.com/job/data-engineer/1004",
        ]
    );
    assert!(!counters.waited_for.lock().unwrap().is_empty());
}
