// src/ingest/providers/feed.rs
//! Category feed pages (hnhiring-style `li.job` posts).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metrics::histogram;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tokio_util::sync::CancellationToken;

use crate::config::FeedConfig;
use crate::errors::SourceFetchError;
use crate::ingest::normalize::parse_salary_text;
use crate::ingest::types::{FeedPost, RawListing, SourceConnector, SourceKind};

const SOURCE_NAME: &str = "feed";

static SEL_JOB: Lazy<Selector> = Lazy::new(|| Selector::parse("li.job").expect("li.job selector"));
static SEL_BODY: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.body").expect("div.body selector"));
static SEL_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("a selector"));
static SEL_DATE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".type-info").expect(".type-info selector"));
static SEL_SALARY: Lazy<Selector> =
    Lazy::new(|| Selector::parse("span.salary").expect("span.salary selector"));
static SEL_USER: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".user a").expect(".user a selector"));
static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w.-]+@[\w.-]+\.\w+").expect("email regex"));

enum Mode {
    /// Page HTML keyed by category path.
    Fixture(HashMap<String, String>),
    Http { client: reqwest::Client },
}

pub struct FeedConnector {
    cfg: FeedConfig,
    mode: Mode,
}

impl FeedConnector {
    pub fn from_config(cfg: FeedConfig) -> Result<Self, SourceFetchError> {
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

    pub fn from_fixtures(cfg: FeedConfig, pages: HashMap<String, String>) -> Self {
        Self {
            cfg,
            mode: Mode::Fixture(pages),
        }
    }

    fn category_url(&self, category: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), category)
    }

    async fn fetch_page(&self, category: &str) -> Result<String, SourceFetchError> {
        let url = self.category_url(category);
        match &self.mode {
            Mode::Fixture(pages) => pages
                .get(category)
                .cloned()
                .ok_or(SourceFetchError::Status {
                    source_name: SOURCE_NAME,
                    url,
                    status: 404,
                }),
            Mode::Http { client } => {
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|error| SourceFetchError::Http {
                        source_name: SOURCE_NAME,
                        url: url.clone(),
                        error,
                    })?;
                let status = resp.status();
                if status.as_u16() == 429 {
                    return Err(SourceFetchError::RateLimited {
                        source_name: SOURCE_NAME,
                        url,
                    });
                }
                if !status.is_success() {
                    return Err(SourceFetchError::Status {
                        source_name: SOURCE_NAME,
                        url,
                        status: status.as_u16(),
                    });
                }
                resp.text()
                    .await
                    .map_err(|error| SourceFetchError::Http {
                        source_name: SOURCE_NAME,
                        url,
                        error,
                    })
            }
        }
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract every post on one category page. Entries without a body are skipped.
pub fn parse_category_page(html: &str, category: &str) -> Vec<FeedPost> {
    let t0 = std::time::Instant::now();
    let doc = Html::parse_document(html);
    let mut out = Vec::new();

    for li in doc.select(&SEL_JOB) {
        let Some(body) = li.select(&SEL_BODY).next() else {
            continue;
        };
        let body_text = element_text(body);
        let links: Vec<String> = body
            .select(&SEL_LINK)
            .filter_map(|a| a.value().attr("href"))
            .map(str::to_string)
            .collect();

        let mut emails: Vec<String> = Vec::new();
        for m in RE_EMAIL.find_iter(&body_text) {
            let e = m.as_str().trim_end_matches('.').to_string();
            if !emails.contains(&e) {
                emails.push(e);
            }
        }

        out.push(FeedPost {
            category: category.to_string(),
            link: links.first().cloned(),
            date_label: li
                .select(&SEL_DATE)
                .next()
                .map(element_text)
                .filter(|s| !s.is_empty()),
            salary_text: body
                .select(&SEL_SALARY)
                .next()
                .map(element_text)
                .filter(|s| !s.is_empty()),
            user: li
                .select(&SEL_USER)
                .next()
                .map(element_text)
                .filter(|s| !s.is_empty()),
            body_text,
            emails,
            links,
        });
    }

    histogram!("ingest_parse_ms", "source" => SOURCE_NAME)
        .record(t0.elapsed().as_secs_f64() * 1_000.0);
    out
}

/// Apply the age and salary filters. Posts without salary text pass the
/// salary check; bounds apply to the rest.
pub fn filter_posts(posts: Vec<FeedPost>, cfg: &FeedConfig, today: NaiveDate) -> Vec<FeedPost> {
    let cutoff = cfg
        .days
        .filter(|d| *d > 0)
        .and_then(|d| today.checked_sub_days(chrono::Days::new(u64::from(d))));

    posts
        .into_iter()
        .filter(|p| {
            if let (Some(cutoff), Some(label)) = (cutoff, p.date_label.as_deref()) {
                if let Ok(date) = NaiveDate::parse_from_str(label.trim(), "%Y-%m-%d") {
                    if date < cutoff {
                        return false;
                    }
                }
            }
            // A stated salary must carry a figure, bounds or not.
            let Some(text) = p.salary_text.as_deref() else {
                return true;
            };
            match parse_salary_text(text) {
                (Some(lo), Some(hi)) => {
                    cfg.min_salary.map_or(true, |min| hi >= min)
                        && cfg.max_salary.map_or(true, |max| lo <= max)
                }
                _ => false,
            }
        })
        .collect()
}

#[async_trait]
impl SourceConnector for FeedConnector {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<RawListing>, SourceFetchError> {
        let today = Utc::now().date_naive();
        let mut out = Vec::new();
        let mut failed = 0usize;

        for category in &self.cfg.categories {
            let page = tokio::select! {
                _ = cancel.cancelled() => return Err(SourceFetchError::Cancelled { source_name: SOURCE_NAME }),
                p = self.fetch_page(category) => p,
            };
            match page {
                Ok(html) => {
                    let parsed = parse_category_page(&html, category);
                    let total = parsed.len();
                    let kept = filter_posts(parsed, &self.cfg, today);
                    tracing::info!(
                        target: "ingest",
                        source = SOURCE_NAME,
                        %category,
                        parsed = total,
                        kept = kept.len(),
                        "feed category done"
                    );
                    out.extend(kept.into_iter().map(RawListing::Feed));
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(target: "ingest", source = SOURCE_NAME, %category, error = %e, "feed category failed");
                }
            }
        }

        if failed > 0 && failed == self.cfg.categories.len() {
            return Err(SourceFetchError::AllQueriesFailed {
                source_name: SOURCE_NAME,
                attempted: failed,
            });
        }
        Ok(out)
    }

    fn source(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }
}
