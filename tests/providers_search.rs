// tests/providers_search.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use job_leads_collector::config::{CollectorConfig, SearchConfig};
use job_leads_collector::errors::SourceFetchError;
use job_leads_collector::ingest::normalize::Normalizer;
use job_leads_collector::ingest::providers::search::SearchConnector;
use job_leads_collector::ingest::providers::session::HttpBrowserLauncher;
use job_leads_collector::ingest::providers::ConfiguredConnectors;
use job_leads_collector::ingest::scheduler::ConnectorFactory;
use job_leads_collector::ingest::types::{RawListing, SourceConnector};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RUST_HITS: &str = r#"{"jobs": [
  {"id": "in-1", "site": "indeed", "job_url": "https://www.indeed.com/viewjob?jk=1",
   "title": "Rust Developer", "company": "Acme", "location": "Remote",
   "date_posted": "2025-03-01", "min_amount": 120000, "max_amount": 150000,
   "interval": "yearly", "currency": "USD", "is_remote": true},
  {"id": "in-2", "job_url": "https://www.indeed.com/viewjob?jk=2",
   "title": "Embedded Rust Engineer", "company": "Initech"}
]}"#;

fn cfg(delay_ms: u64) -> SearchConfig {
    SearchConfig {
        enabled: true,
        sites: vec!["indeed".into()],
        search_terms: vec!["rust developer".into(), "backend engineer".into()],
        locations: vec!["Remote".into()],
        request_delay_ms: delay_ms,
        error_delay_ms: 0,
        site_delay_ms: 0,
        ..SearchConfig::default()
    }
}

fn bodies() -> HashMap<String, String> {
    let mut b = HashMap::new();
    b.insert("rust developer".to_string(), RUST_HITS.to_string());
    b.insert("backend engineer".to_string(), "[]".to_string());
    b
}

#[tokio::test(start_paused = true)]
async fn requests_are_spaced_by_the_configured_delay() {
    let c = SearchConnector::from_fixtures(cfg(8_000), bodies());
    let t0 = Instant::now();
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    assert!(t0.elapsed() >= Duration::from_secs(8));
    assert_eq!(got.len(), 2);

    let n = Normalizer::default();
    let jobs: Vec<_> = got.iter().map(|r| n.normalize(r).unwrap()).collect();
    assert_eq!(jobs[0].salary_min, Some(120_000));
    assert_eq!(jobs[0].is_remote, Some(true));
    assert_eq!(jobs[1].site.as_deref(), Some("indeed"));
    assert_eq!(jobs[1].search_keyword.as_deref(), Some("rust developer"));
}

#[tokio::test(start_paused = true)]
async fn failed_queries_and_site_changes_add_their_own_pauses() {
    // indeed: rust ok, backend ok, missing fails; linkedin: the same three
    let c = SearchConnector::from_fixtures(
        SearchConfig {
            sites: vec!["indeed".into(), "linkedin".into()],
            search_terms: vec![
                "rust developer".into(),
                "backend engineer".into(),
                "missing".into(),
            ],
            error_delay_ms: 10_000,
            site_delay_ms: 15_000,
            ..cfg(1_000)
        },
        bodies(),
    );
    let t0 = Instant::now();
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    assert_eq!(got.len(), 4);
    // 1 + 1 within indeed, 10 + 15 after the failure at the site change,
    // 1 + 1 within linkedin
    let elapsed = t0.elapsed();
    assert!(elapsed >= Duration::from_secs(29), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(30), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn cancel_during_the_delay_stops_the_connector() {
    let c = SearchConnector::from_fixtures(cfg(60_000), bodies());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let err = c.fetch(&cancel).await.unwrap_err();
    assert!(matches!(err, SourceFetchError::Cancelled { .. }));
}

#[tokio::test]
async fn hits_keep_their_raw_shape() {
    let c = SearchConnector::from_fixtures(cfg(0), bodies());
    let got = c.fetch(&CancellationToken::new()).await.unwrap();
    let RawListing::Search(hit) = &got[0] else {
        panic!("expected a search hit");
    };
    assert_eq!(hit.id.as_deref(), Some("in-1"));
    assert_eq!(hit.search_term.as_deref(), Some("rust developer"));
}

async fn names(f: &ConfiguredConnectors) -> Vec<&'static str> {
    f.connectors().await.iter().map(|c| c.name()).collect()
}

#[tokio::test]
async fn config_reload_keeps_last_good_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("collector.toml");
    std::fs::write(&path, "[feed]\nenabled = true\ncategories = [\"/technologies/rust\"]\n").unwrap();

    let factory = ConfiguredConnectors::new(
        Some(path.clone()),
        CollectorConfig::default(),
        Arc::new(HttpBrowserLauncher),
    );
    assert_eq!(names(&factory).await, vec!["feed"]);

    std::fs::write(&path, "[search]\nenabled = true\n[feed]\nenabled = true\n").unwrap();
    assert_eq!(names(&factory).await, vec!["search", "feed"]);

    std::fs::write(&path, "[search\nbroken").unwrap();
    assert_eq!(names(&factory).await, vec!["search", "feed"]);
}
