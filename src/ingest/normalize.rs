// src/ingest/normalize.rs
//! Raw source shapes → canonical [`Job`]. Pure: no clock, no I/O.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::MalformedRecord;
use crate::ingest::fingerprint::{FingerprintFields, FingerprintPolicy};
use crate::ingest::types::{BrowserPosting, FeedPost, Job, RawListing, SearchHit, SourceKind};

/// Feed posts without a pipe-delimited header get this many chars as title.
const FEED_TITLE_CHARS: usize = 180;
const TEXT_CAP: usize = 1500;
const DESCRIPTION_CAP: usize = 20_000;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));
static RE_SALARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d[\d,]*(?:\.\d+)?)\s*([kK])?").expect("salary regex"));

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: FingerprintPolicy,
}

impl Normalizer {
    pub fn new(policy: FingerprintPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FingerprintPolicy {
        self.policy
    }

    pub fn normalize(&self, raw: &RawListing) -> Result<Job, MalformedRecord> {
        let payload = serde_json::to_value(raw).unwrap_or_default();
        let mut job = match raw {
            RawListing::Search(hit) => from_search(hit)?,
            RawListing::Feed(post) => from_feed(post)?,
            RawListing::Browser(posting) => from_browser(posting)?,
        };
        job.raw_payload = payload;
        job.fingerprint = self.policy.fingerprint(&FingerprintFields {
            source: job.source,
            title: &job.title,
            company: job.company.as_deref(),
            location: job.location.as_deref(),
            url: job.url.as_deref(),
        });
        Ok(job)
    }
}

/// Normalize text: decode entities, strip tags, unify quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s).to_string();
    let untagged = RE_TAGS.replace_all(&decoded, " ");
    let quoted = untagged
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    let collapsed = RE_WS.replace_all(&quoted, " ");
    truncate_chars(collapsed.trim(), TEXT_CAP)
}

fn clean_description(s: &str) -> Option<String> {
    let decoded = html_escape::decode_html_entities(s).to_string();
    let untagged = RE_TAGS.replace_all(&decoded, " ");
    let lines: Vec<&str> = untagged
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    non_empty(truncate_chars(&lines.join("\n"), DESCRIPTION_CAP))
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() > cap {
        s.chars().take(cap).collect()
    } else {
        s.to_string()
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn opt_text(s: Option<&str>) -> Option<String> {
    s.map(normalize_text).and_then(non_empty)
}

fn opt_url(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

/// Parse RFC 3339, naive datetimes (assumed UTC) and plain dates (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Extract salary bounds from free text such as `$120k - $150k` or `120,000`.
/// A single figure yields equal bounds; no digits yields `(None, None)`.
pub fn parse_salary_text(text: &str) -> (Option<u64>, Option<u64>) {
    let mut values = RE_SALARY.captures_iter(text).filter_map(|c| {
        let digits = c.get(1)?.as_str().replace(',', "");
        let n: f64 = digits.parse().ok()?;
        let n = if c.get(2).is_some() { n * 1000.0 } else { n };
        amount_to_u64(n)
    });
    match (values.next(), values.next()) {
        (Some(a), Some(b)) => (Some(a.min(b)), Some(a.max(b))),
        (Some(a), None) => (Some(a), Some(a)),
        _ => (None, None),
    }
}

fn amount_to_u64(n: f64) -> Option<u64> {
    if n.is_finite() && n >= 0.0 {
        Some(n.round() as u64)
    } else {
        None
    }
}

fn mentions_remote(s: &str) -> bool {
    s.to_ascii_lowercase().contains("remote")
}

fn empty_job(source: SourceKind, title: String) -> Job {
    Job {
        source,
        fingerprint: String::new(),
        title,
        company: None,
        location: None,
        posted_at: None,
        salary_min: None,
        salary_max: None,
        url: None,
        site: None,
        is_remote: None,
        description: None,
        salary_interval: None,
        currency: None,
        emails: Vec::new(),
        tags: Vec::new(),
        search_keyword: None,
        raw_payload: serde_json::Value::Null,
    }
}

fn from_search(hit: &SearchHit) -> Result<Job, MalformedRecord> {
    let title = opt_text(hit.title.as_deref())
        .ok_or_else(|| MalformedRecord::new(SourceKind::Search, "missing title"))?;
    let mut job = empty_job(SourceKind::Search, title);
    job.company = opt_text(hit.company.as_deref());
    job.location = opt_text(hit.location.as_deref());
    job.posted_at = hit.date_posted.as_deref().and_then(parse_timestamp);
    job.salary_min = hit.min_amount.and_then(amount_to_u64);
    job.salary_max = hit.max_amount.and_then(amount_to_u64);
    if let (Some(lo), Some(hi)) = (job.salary_min, job.salary_max) {
        if lo > hi {
            return Err(MalformedRecord::new(
                SourceKind::Search,
                format!("salary range inverted ({lo} > {hi})"),
            ));
        }
    }
    job.url = opt_url(hit.job_url.as_deref()).or_else(|| opt_url(hit.job_url_direct.as_deref()));
    job.site = opt_text(hit.site.as_deref()).map(|s| s.to_lowercase());
    job.is_remote = hit.is_remote;
    job.description = hit.description.as_deref().and_then(clean_description);
    job.salary_interval = opt_text(hit.interval.as_deref()).map(|s| s.to_lowercase());
    job.currency = opt_text(hit.currency.as_deref());
    job.emails = hit.emails.clone().unwrap_or_default();
    job.search_keyword = opt_text(hit.search_term.as_deref());
    Ok(job)
}

fn from_feed(post: &FeedPost) -> Result<Job, MalformedRecord> {
    let body = normalize_text(&post.body_text);
    if body.is_empty() {
        return Err(MalformedRecord::new(SourceKind::Feed, "empty post body"));
    }

    let segments: Vec<&str> = body
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let (title, company, location) = match segments.as_slice() {
        [company, role, location, ..] => (
            role.to_string(),
            Some(company.to_string()),
            Some(location.to_string()),
        ),
        [company, role] => (role.to_string(), Some(company.to_string()), None),
        _ => (truncate_chars(&body, FEED_TITLE_CHARS), None, None),
    };

    let mut job = empty_job(SourceKind::Feed, title);
    job.company = company;
    job.location = location;
    job.posted_at = post.date_label.as_deref().and_then(parse_timestamp);
    if let Some(salary) = post.salary_text.as_deref() {
        let (lo, hi) = parse_salary_text(salary);
        job.salary_min = lo;
        job.salary_max = hi;
    }
    job.url = opt_url(post.link.as_deref());
    job.is_remote = mentions_remote(&body).then_some(true);
    job.description = clean_description(&post.body_text);
    job.emails = post.emails.clone();
    job.tags = vec![post.category.clone()];
    Ok(job)
}

fn from_browser(p: &BrowserPosting) -> Result<Job, MalformedRecord> {
    let title = opt_text(p.detail_title.as_deref())
        .or_else(|| non_empty(normalize_text(&p.card_title)))
        .ok_or_else(|| MalformedRecord::new(SourceKind::Browser, "missing title"))?;
    let url = opt_url(Some(p.url.as_str()))
        .ok_or_else(|| MalformedRecord::new(SourceKind::Browser, "missing detail url"))?;

    let mut job = empty_job(SourceKind::Browser, title);
    job.company = opt_text(p.company.as_deref());
    job.location = opt_text(p.location.as_deref());
    job.posted_at = p.posted_at;
    if let Some(salary) = p.salary_text.as_deref() {
        let (lo, hi) = parse_salary_text(salary);
        job.salary_min = lo;
        job.salary_max = hi;
    }
    job.url = Some(url);
    let remote = p.remote_search
        || job.location.as_deref().is_some_and(mentions_remote)
        || mentions_remote(&p.search_keyword);
    job.is_remote = remote.then_some(true);
    job.description = p.description.as_deref().and_then(clean_description);
    job.tags = p
        .tags
        .iter()
        .chain(p.skills.iter())
        .map(|t| normalize_text(t))
        .filter(|t| !t.is_empty())
        .collect();
    job.search_keyword = non_empty(p.search_keyword.clone());
    Ok(job)
}
