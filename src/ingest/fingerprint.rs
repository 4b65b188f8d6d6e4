// src/ingest/fingerprint.rs
//! Deterministic uniqueness keys for canonical records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ingest::types::SourceKind;

/// Which normalized fields identify "the same listing".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintPolicy {
    /// URL only. Falls back to title+company+location when a record has no URL.
    Url,
    #[default]
    TitleCompanyUrl,
    TitleCompanyLocation,
}

/// Fields a fingerprint may draw from, already normalized by the caller.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintFields<'a> {
    pub source: SourceKind,
    pub title: &'a str,
    pub company: Option<&'a str>,
    pub location: Option<&'a str>,
    pub url: Option<&'a str>,
}

impl FingerprintPolicy {
    pub fn fingerprint(&self, f: &FingerprintFields<'_>) -> String {
        let url = f.url.map(canonical_url).filter(|u| !u.is_empty());
        let parts: Vec<String> = match (*self, url) {
            (FingerprintPolicy::Url, Some(u)) => vec!["url".into(), u],
            (FingerprintPolicy::TitleCompanyUrl, u) => vec![
                "tcu".into(),
                canonical_text(f.title),
                f.company.map(canonical_text).unwrap_or_default(),
                u.unwrap_or_default(),
            ],
            (FingerprintPolicy::Url, None) | (FingerprintPolicy::TitleCompanyLocation, _) => vec![
                "tcl".into(),
                canonical_text(f.title),
                f.company.map(canonical_text).unwrap_or_default(),
                f.location.map(canonical_text).unwrap_or_default(),
            ],
        };

        let mut hasher = Sha256::new();
        hasher.update(f.source.as_str().as_bytes());
        for p in &parts {
            // unit separator keeps ("ab","c") and ("a","bc") apart
            hasher.update([0x1f]);
            hasher.update(p.as_bytes());
        }
        hex(&hasher.finalize())
    }
}

/// Lowercase, trim, collapse inner whitespace.
pub fn canonical_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Scheme/host lowercased, fragment and trailing slash dropped.
/// Query strings are kept since some boards key listings by them.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(mut u) => {
            u.set_fragment(None);
            let mut s = u.to_string();
            if u.query().is_none() && s.ends_with('/') {
                s.pop();
            }
            s
        }
        Err(_) => trimmed.trim_end_matches('/').to_lowercase(),
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
