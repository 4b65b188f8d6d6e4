// src/ingest/types.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::SourceFetchError;

/// Which connector produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Search,
    Feed,
    Browser,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Search => "search",
            SourceKind::Feed => "feed",
            SourceKind::Browser => "browser",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical job record shared by every source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub source: SourceKind,
    pub fingerprint: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub salary_min: Option<u64>,
    pub salary_max: Option<u64>,
    pub url: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub is_remote: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub salary_interval: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub search_keyword: Option<String>,
    /// Untouched source payload, kept for debugging downstream.
    pub raw_payload: serde_json::Value,
}

/// One hit from the structured search endpoint (JobSpy-style columns).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub job_url: Option<String>,
    #[serde(default)]
    pub job_url_direct: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Date or datetime string; precision varies by board.
    #[serde(default)]
    pub date_posted: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub min_amount: Option<f64>,
    #[serde(default)]
    pub max_amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub is_remote: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub emails: Option<Vec<String>>,
    /// Filled by the connector, not the endpoint.
    #[serde(default)]
    pub search_term: Option<String>,
}

/// One post from a category feed page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedPost {
    pub category: String,
    pub body_text: String,
    pub link: Option<String>,
    /// `YYYY-MM-DD` label as shown on the page.
    pub date_label: Option<String>,
    pub salary_text: Option<String>,
    pub user: Option<String>,
    pub emails: Vec<String>,
    pub links: Vec<String>,
}

/// Listing card merged with its detail page, as scraped through a browser session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrowserPosting {
    pub url: String,
    pub card_title: String,
    pub posted_text: Option<String>,
    /// Resolved from `posted_text` at scrape time, since labels are relative.
    pub posted_at: Option<DateTime<Utc>>,
    pub search_keyword: String,
    pub remote_search: bool,
    pub detail_title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub seniority: Option<String>,
    pub salary_text: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub skills: Vec<String>,
}

/// A listing in its source's native shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RawListing {
    Search(SearchHit),
    Feed(FeedPost),
    Browser(BrowserPosting),
}

impl RawListing {
    pub fn source(&self) -> SourceKind {
        match self {
            RawListing::Search(_) => SourceKind::Search,
            RawListing::Feed(_) => SourceKind::Feed,
            RawListing::Browser(_) => SourceKind::Browser,
        }
    }
}

/// A unit that fetches raw listings from one external source.
///
/// Implementations enforce their own timeouts and result caps and must
/// return promptly once `cancel` fires.
#[async_trait::async_trait]
pub trait SourceConnector: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<RawListing>, SourceFetchError>;
    fn source(&self) -> SourceKind;
    fn name(&self) -> &'static str;
}
