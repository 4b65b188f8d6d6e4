// src/ingest/providers/browser.rs
//! Browser-driven listing pages (builtin-style): walk listing pages per
//! keyword until the age cutoff, then visit each detail page.
//!
//! Every keyword gets its own session, closed on every exit path, and its
//! own `query_timeout_secs` budget. A keyword that times out is not retried
//! within the cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tokio_util::sync::CancellationToken;

use crate::config::BrowserConfig;
use crate::errors::SourceFetchError;
use crate::ingest::providers::session::{BrowserLauncher, BrowserSession, SessionOptions};
use crate::ingest::types::{BrowserPosting, RawListing, SourceConnector, SourceKind};

const SOURCE_NAME: &str = "browser";

static RE_REMOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bremote\b").expect("remote regex"));
static RE_AGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\+?\s*(minute|min|hour|hr|day|week|month)")
        .expect("posted age regex")
});

static SEL_CARD: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"[data-id="job-card"]"#).expect("card selector"));
static SEL_CARD_TITLE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"h2 a[data-id="job-card-title"]"#).expect("card title selector")
});
static SEL_SPAN: Lazy<Selector> = Lazy::new(|| Selector::parse("span").expect("span selector"));
static SEL_DETAIL_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1.fw-extrabold, h1").expect("detail title selector"));
static SEL_COMPANY: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h2.text-pretty-blue").expect("company selector"));
static SEL_META: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.font-barlow.text-gray-03").expect("meta selector"));
static SEL_POSTED: Lazy<Selector> =
    Lazy::new(|| Selector::parse("span.font-barlow.fs-md").expect("posted selector"));
static SEL_TAGS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.font-barlow.fw-medium.mb-md").expect("tags selector"));
static SEL_SKILLS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.d-flex.gap-sm.flex-wrap > div").expect("skills selector"));
static SEL_DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.html-parsed-content").expect("description selector"));

/// Configured keywords, or the fallback terms when none are set. "remote" is
/// stripped (remote is a URL flag), whitespace collapsed, duplicates dropped
/// case-insensitively.
pub fn resolve_keywords(configured: &[String], fallback: &[String]) -> Vec<String> {
    let candidates = if configured.iter().any(|k| !k.trim().is_empty()) {
        configured
    } else {
        fallback
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for kw in candidates {
        let stripped = RE_REMOTE.replace_all(kw, "");
        let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        if cleaned.is_empty() {
            continue;
        }
        if seen.insert(cleaned.to_lowercase()) {
            out.push(cleaned);
        }
    }
    out
}

pub fn listing_url(cfg: &BrowserConfig, keyword: &str, page: u32) -> Result<String, SourceFetchError> {
    let base = cfg.base_url.trim_end_matches('/');
    let path = if cfg.remote {
        format!("{base}/remote")
    } else {
        base.to_string()
    };
    let mut params = vec![("page", page.to_string())];
    if !keyword.is_empty() {
        params.push(("search", keyword.to_string()));
    }
    if cfg.all_locations {
        params.push(("allLocations", "true".to_string()));
    }
    url::Url::parse_with_params(&path, &params)
        .map(String::from)
        .map_err(|e| SourceFetchError::Parse {
            source_name: SOURCE_NAME,
            reason: format!("invalid listing url {path}: {e}"),
        })
}

/// Resolve labels like "2 Hours Ago", "30+ Days Ago" or "Just Posted".
pub fn parse_posted_text(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower.contains("just") || lower.contains("today") {
        return Some(now);
    }
    if lower.contains("yesterday") {
        return Some(now - chrono::Duration::days(1));
    }
    let caps = RE_AGE.captures(&lower)?;
    let n: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str();
    let delta = match unit {
        "minute" | "min" => chrono::Duration::minutes(n),
        "hour" | "hr" => chrono::Duration::hours(n),
        "day" => chrono::Duration::days(n),
        "week" => chrono::Duration::weeks(n),
        _ => chrono::Duration::days(30 * n),
    };
    Some(now - delta)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingCard {
    pub url: String,
    pub title: String,
    pub posted_text: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn absolutize(site_root: &str, href: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    url::Url::parse(site_root)
        .ok()?
        .join(href)
        .ok()
        .map(String::from)
}

/// Cards on one listing page, in page order.
pub fn parse_listing_page(html: &str, site_root: &str, now: DateTime<Utc>) -> Vec<ListingCard> {
    let doc = Html::parse_document(html);
    let card_from = |link: ElementRef<'_>, scope: Option<ElementRef<'_>>| {
        let href = link.value().attr("href")?;
        let url = absolutize(site_root, href)?;
        let posted_text = scope.and_then(|card| {
            card.select(&SEL_SPAN).map(element_text).find(|t| {
                let l = t.to_lowercase();
                l.contains("ago") || l.contains("just posted")
            })
        });
        let posted_at = posted_text
            .as_deref()
            .and_then(|t| parse_posted_text(t, now));
        Some(ListingCard {
            url,
            title: element_text(link),
            posted_text,
            posted_at,
        })
    };

    let cards: Vec<ListingCard> = doc
        .select(&SEL_CARD)
        .filter_map(|card| {
            let link = card.select(&SEL_CARD_TITLE).next()?;
            card_from(link, Some(card))
        })
        .collect();
    if !cards.is_empty() {
        return cards;
    }
    // Layout without card containers: titles only.
    doc.select(&SEL_CARD_TITLE)
        .filter_map(|link| card_from(link, None))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub posted_text: Option<String>,
    pub seniority: Option<String>,
    pub salary_text: Option<String>,
    pub tags: Vec<String>,
    pub skills: Vec<String>,
    pub description: Option<String>,
}

fn looks_like_salary(s: &str) -> bool {
    let l = s.to_lowercase();
    s.contains('$') || l.contains("annually") || l.contains("hourly") || l.contains("per year")
}

fn looks_like_seniority(s: &str) -> bool {
    let l = s.to_lowercase();
    ["senior", "junior", "mid level", "entry level", "lead", "principal"]
        .iter()
        .any(|k| l.contains(k))
}

pub fn parse_detail_page(html: &str) -> DetailFields {
    let doc = Html::parse_document(html);
    let first = |sel: &Selector| {
        doc.select(sel)
            .next()
            .map(element_text)
            .filter(|s| !s.is_empty())
    };
    let all = |sel: &Selector| -> Vec<String> {
        doc.select(sel)
            .map(element_text)
            .filter(|s| !s.is_empty())
            .collect()
    };

    let mut fields = DetailFields {
        title: first(&*SEL_DETAIL_TITLE),
        company: first(&*SEL_COMPANY),
        posted_text: first(&*SEL_POSTED),
        tags: all(&*SEL_TAGS),
        skills: all(&*SEL_SKILLS),
        ..DetailFields::default()
    };
    for meta in all(&*SEL_META) {
        if looks_like_salary(&meta) {
            fields.salary_text.get_or_insert(meta);
        } else if looks_like_seniority(&meta) {
            fields.seniority.get_or_insert(meta);
        } else {
            fields.location.get_or_insert(meta);
        }
    }
    fields.description = doc.select(&SEL_DESCRIPTION).next().map(|d| {
        d.text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    });
    fields
}

pub struct BrowserConnector {
    cfg: BrowserConfig,
    keywords: Vec<String>,
    launcher: Arc<dyn BrowserLauncher>,
}

impl BrowserConnector {
    pub fn new(cfg: BrowserConfig, fallback_terms: &[String], launcher: Arc<dyn BrowserLauncher>) -> Self {
        let keywords = resolve_keywords(&cfg.keywords, fallback_terms);
        Self {
            cfg,
            keywords,
            launcher,
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            headless: self.cfg.headless,
            slow_mo_ms: self.cfg.slow_mo_ms,
            ..SessionOptions::default()
        }
    }

    /// Collect cards page by page, then resolve details, for one keyword.
    async fn collect_keyword(
        &self,
        session: &mut dyn BrowserSession,
        keyword: &str,
        seen: &HashSet<String>,
        limit: Option<usize>,
    ) -> Result<Vec<BrowserPosting>, SourceFetchError> {
        let now = Utc::now();
        let cutoff = self
            .cfg
            .max_age_hours
            .map(|h| now - chrono::Duration::hours(i64::from(h)));
        let max_pages = self.cfg.max_pages.max(1);
        let start = self.cfg.start_page.max(1);

        let mut cards: Vec<ListingCard> = Vec::new();
        let mut page = start;
        'pages: while page - start < max_pages {
            let url = listing_url(&self.cfg, keyword, page)?;
            session.goto(&url).await?;
            if let Err(e) = session
                .wait_for(&self.cfg.wait_selector, Duration::from_millis(self.cfg.selector_timeout_ms))
                .await
            {
                tracing::debug!(target: "ingest", source = SOURCE_NAME, %keyword, page, error = %e, "listing selector never matched");
            }
            session.wait_ms(self.cfg.page_wait_ms).await;
            let html = session.content().await?;
            let page_cards = parse_listing_page(&html, &self.cfg.site_root, now);
            tracing::debug!(target: "ingest", source = SOURCE_NAME, %keyword, page, cards = page_cards.len(), "listing page");
            if page_cards.is_empty() {
                break;
            }
            for card in page_cards {
                if let (Some(cutoff), Some(at)) = (cutoff, card.posted_at) {
                    if at < cutoff {
                        break 'pages;
                    }
                }
                if seen.contains(&card.url) || cards.iter().any(|c| c.url == card.url) {
                    continue;
                }
                cards.push(card);
                if limit.is_some_and(|l| cards.len() >= l) {
                    break 'pages;
                }
            }
            page += 1;
        }

        let mut out = Vec::with_capacity(cards.len());
        for card in cards {
            let detail = match self.fetch_detail(session, &card.url).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(target: "ingest", source = SOURCE_NAME, url = %card.url, error = %e, "detail page failed");
                    continue;
                }
            };
            out.push(BrowserPosting {
                url: card.url,
                card_title: card.title,
                posted_text: card.posted_text.or(detail.posted_text),
                posted_at: card.posted_at,
                search_keyword: keyword.to_string(),
                remote_search: self.cfg.remote,
                detail_title: detail.title,
                company: detail.company,
                location: detail.location,
                seniority: detail.seniority,
                salary_text: detail.salary_text,
                description: detail.description,
                tags: detail.tags,
                skills: detail.skills,
            });
        }
        Ok(out)
    }

    async fn fetch_detail(
        &self,
        session: &mut dyn BrowserSession,
        url: &str,
    ) -> Result<DetailFields, SourceFetchError> {
        session.goto(url).await?;
        session.wait_ms(self.cfg.detail_wait_ms).await;
        let html = session.content().await?;
        Ok(parse_detail_page(&html))
    }
}

#[async_trait]
impl SourceConnector for BrowserConnector {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<RawListing>, SourceFetchError> {
        if self.keywords.is_empty() {
            tracing::info!(target: "ingest", source = SOURCE_NAME, "no keywords configured, skipping");
            return Ok(Vec::new());
        }
        let query_timeout = Duration::from_secs(self.cfg.query_timeout_secs.max(1));
        let opts = self.session_options();
        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<BrowserPosting> = Vec::new();
        let mut failed = 0usize;

        for keyword in &self.keywords {
            let remaining = match self.cfg.total_limit {
                Some(total) if out.len() >= total => break,
                Some(total) => Some(total - out.len()),
                None => None,
            };
            let limit = match (remaining, self.cfg.per_keyword_limit) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let mut session = match self.launcher.launch(&opts).await {
                Ok(s) => s,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(target: "ingest", source = SOURCE_NAME, %keyword, error = %e, "cannot open browser session");
                    continue;
                }
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(SourceFetchError::Cancelled { source_name: SOURCE_NAME }),
                r = tokio::time::timeout(query_timeout, self.collect_keyword(session.as_mut(), keyword, &seen, limit)) => {
                    r.unwrap_or(Err(SourceFetchError::Timeout {
                        source_name: SOURCE_NAME,
                        secs: query_timeout.as_secs(),
                    }))
                }
            };
            session.close().await;

            match result {
                Ok(postings) => {
                    tracing::info!(target: "ingest", source = SOURCE_NAME, %keyword, postings = postings.len(), "keyword done");
                    for p in postings {
                        if seen.insert(p.url.clone()) {
                            out.push(p);
                        }
                    }
                }
                Err(e @ SourceFetchError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(target: "ingest", source = SOURCE_NAME, %keyword, error = %e, "keyword query failed");
                }
            }
        }

        if failed > 0 && failed == self.keywords.len() {
            return Err(SourceFetchError::AllQueriesFailed {
                source_name: SOURCE_NAME,
                attempted: failed,
            });
        }
        if let Some(total) = self.cfg.total_limit {
            out.truncate(total);
        }
        Ok(out.into_iter().map(RawListing::Browser).collect())
    }

    fn source(&self) -> SourceKind {
        SourceKind::Browser
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }
}
