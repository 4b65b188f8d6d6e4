// src/ingest/providers/search.rs
//! Structured job-search endpoint (JobSpy-style JSON), one query per
//! site × term × location.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use metrics::histogram;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::SearchConfig;
use crate::errors::SourceFetchError;
use crate::ingest::types::{RawListing, SearchHit, SourceConnector, SourceKind};

const SOURCE_NAME: &str = "search";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub site: String,
    pub search_term: String,
    pub location: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    List(Vec<SearchHit>),
    Wrapped { jobs: Vec<SearchHit> },
}

enum Mode {
    /// Canned bodies keyed by search term; a missing term answers 404.
    Fixture(HashMap<String, String>),
    Http { client: reqwest::Client },
}

pub struct SearchConnector {
    cfg: SearchConfig,
    mode: Mode,
}

impl SearchConnector {
    pub fn from_config(cfg: SearchConfig) -> Result<Self, SourceFetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| SourceFetchError::Parse {
                source_name: SOURCE_NAME,
                reason: format!("building http client: {e}"),
            })?;
        Ok(Self {
            cfg,
            mode: Mode::Http { client },
        })
    }

    pub fn from_fixtures(cfg: SearchConfig, bodies: HashMap<String, String>) -> Self {
        Self {
            cfg,
            mode: Mode::Fixture(bodies),
        }
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        let mut out = Vec::new();
        for site in &self.cfg.sites {
            for term in &self.cfg.search_terms {
                for location in &self.cfg.locations {
                    out.push(SearchQuery {
                        site: site.clone(),
                        search_term: term.clone(),
                        location: location.clone(),
                    });
                }
            }
        }
        out
    }

    pub fn query_url(&self, q: &SearchQuery) -> Result<String, SourceFetchError> {
        let params = [
            ("site_name", q.site.clone()),
            ("search_term", q.search_term.clone()),
            ("location", q.location.clone()),
            ("results_wanted", self.cfg.results_wanted.to_string()),
            ("hours_old", self.cfg.hours_old.to_string()),
            ("country_indeed", self.cfg.country.clone()),
        ];
        url::Url::parse_with_params(&self.cfg.endpoint, &params)
            .map(String::from)
            .map_err(|e| SourceFetchError::Parse {
                source_name: SOURCE_NAME,
                reason: format!("invalid endpoint {}: {e}", self.cfg.endpoint),
            })
    }

    async fn fetch_body(&self, q: &SearchQuery, url: &str) -> Result<String, SourceFetchError> {
        match &self.mode {
            Mode::Fixture(bodies) => {
                bodies
                    .get(&q.search_term)
                    .cloned()
                    .ok_or_else(|| SourceFetchError::Status {
                        source_name: SOURCE_NAME,
                        url: url.to_string(),
                        status: 404,
                    })
            }
            Mode::Http { client } => {
                let resp = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|error| SourceFetchError::Http {
                        source_name: SOURCE_NAME,
                        url: url.to_string(),
                        error,
                    })?;
                let status = resp.status();
                if status.as_u16() == 429 {
                    return Err(SourceFetchError::RateLimited {
                        source_name: SOURCE_NAME,
                        url: url.to_string(),
                    });
                }
                if !status.is_success() {
                    return Err(SourceFetchError::Status {
                        source_name: SOURCE_NAME,
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                resp.text().await.map_err(|error| SourceFetchError::Http {
                    source_name: SOURCE_NAME,
                    url: url.to_string(),
                    error,
                })
            }
        }
    }

    /// Gap before `next`: the request delay (or the longer error delay after
    /// a failure), plus the site delay when moving on to another site.
    pub fn pause_after(&self, last: &SearchQuery, last_failed: bool, next: &SearchQuery) -> Duration {
        let base = if last_failed {
            self.cfg.error_delay_ms
        } else {
            self.cfg.request_delay_ms
        };
        let site = if last.site != next.site {
            self.cfg.site_delay_ms
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(site))
    }

    async fn run_query(&self, q: &SearchQuery) -> Result<Vec<SearchHit>, SourceFetchError> {
        let url = self.query_url(q)?;
        let body = self.fetch_body(q, &url).await?;
        let t0 = std::time::Instant::now();
        let hits = parse_search_response(&body)?
            .into_iter()
            .map(|mut hit| {
                hit.search_term = Some(q.search_term.clone());
                if hit.site.is_none() {
                    hit.site = Some(q.site.clone());
                }
                hit
            })
            .collect();
        histogram!("ingest_parse_ms", "source" => SOURCE_NAME)
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(hits)
    }
}

/// Accepts either a bare array of hits or `{"jobs": [...]}`.
pub fn parse_search_response(body: &str) -> Result<Vec<SearchHit>, SourceFetchError> {
    match serde_json::from_str::<SearchResponse>(body) {
        Ok(SearchResponse::List(v)) | Ok(SearchResponse::Wrapped { jobs: v }) => Ok(v),
        Err(e) => Err(SourceFetchError::Parse {
            source_name: SOURCE_NAME,
            reason: e.to_string(),
        }),
    }
}

#[async_trait]
impl SourceConnector for SearchConnector {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<RawListing>, SourceFetchError> {
        let queries = self.queries();
        let mut out = Vec::new();
        let mut failed = 0usize;
        let mut prev: Option<(&SearchQuery, bool)> = None;

        for q in &queries {
            if let Some((last, last_failed)) = prev {
                let pause = self.pause_after(last, last_failed, q);
                if !pause.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SourceFetchError::Cancelled { source_name: SOURCE_NAME }),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(SourceFetchError::Cancelled { source_name: SOURCE_NAME }),
                r = self.run_query(q) => r,
            };
            match res {
                Ok(hits) => {
                    tracing::info!(
                        target: "ingest",
                        source = SOURCE_NAME,
                        site = %q.site,
                        term = %q.search_term,
                        location = %q.location,
                        hits = hits.len(),
                        "search query done"
                    );
                    out.extend(hits.into_iter().map(RawListing::Search));
                    prev = Some((q, false));
                }
                Err(e) => {
                    failed += 1;
                    prev = Some((q, true));
                    tracing::warn!(
                        target: "ingest",
                        source = SOURCE_NAME,
                        site = %q.site,
                        term = %q.search_term,
                        location = %q.location,
                        error = %e,
                        "search query failed"
                    );
                }
            }
        }

        if failed > 0 && failed == queries.len() {
            return Err(SourceFetchError::AllQueriesFailed {
                source_name: SOURCE_NAME,
                attempted: failed,
            });
        }
        Ok(out)
    }

    fn source(&self) -> SourceKind {
        SourceKind::Search
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }
}
