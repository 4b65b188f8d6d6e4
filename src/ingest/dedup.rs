// src/ingest/dedup.rs
//! Cross-cycle deduplication keyed by fingerprint.
//!
//! The seen-set maps fingerprint → last time the record was successfully
//! published. Entries older than the retention window no longer suppress and
//! are pruned, which bounds the set to roughly one window of listings.
//!
//! The pipeline uses [`Deduplicator::is_duplicate`] before publishing and
//! [`Deduplicator::mark_seen`] only after the broker acknowledged, so a
//! delivery failure leaves the record eligible for the next cycle.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::ingest::types::Job;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SeenSet {
    entries: HashMap<String, DateTime<Utc>>,
}

impl SeenSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_seen(&self, fingerprint: &str) -> Option<DateTime<Utc>> {
        self.entries.get(fingerprint).copied()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    seen: SeenSet,
}

#[derive(Debug)]
pub struct Deduplicator {
    seen: SeenSet,
    retention: Duration,
    path: Option<PathBuf>,
    dirty: bool,
}

impl Deduplicator {
    /// In-memory deduplicator; state is lost on restart.
    pub fn in_memory(retention: Duration) -> Self {
        Self {
            seen: SeenSet::default(),
            retention,
            path: None,
            dirty: false,
        }
    }

    /// Load persisted state from `path`. A missing file starts empty; a
    /// corrupt one is logged and replaced on the next persist.
    pub async fn load(path: impl Into<PathBuf>, retention: Duration) -> Self {
        let path = path.into();
        let seen = match fs::read_to_string(&path).await {
            Ok(s) => match serde_json::from_str::<StateFile>(&s) {
                Ok(state) if state.version == STATE_VERSION => state.seen,
                Ok(state) => {
                    tracing::warn!(
                        target: "dedup",
                        path = %path.display(),
                        version = state.version,
                        "unknown seen-set version, starting empty"
                    );
                    SeenSet::default()
                }
                Err(e) => {
                    tracing::warn!(target: "dedup", path = %path.display(), error = %e, "corrupt seen-set, starting empty");
                    SeenSet::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SeenSet::default(),
            Err(e) => {
                tracing::warn!(target: "dedup", path = %path.display(), error = %e, "cannot read seen-set, starting empty");
                SeenSet::default()
            }
        };
        tracing::info!(target: "dedup", entries = seen.len(), path = %path.display(), "seen-set loaded");
        Self {
            seen,
            retention,
            path: Some(path),
            dirty: false,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True when `fingerprint` was published within the retention window.
    pub fn is_duplicate(&self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.seen
            .last_seen(fingerprint)
            .is_some_and(|at| now.signed_duration_since(at) < self.retention)
    }

    /// Record a successful publish.
    pub fn mark_seen(&mut self, fingerprint: &str, now: DateTime<Utc>) {
        self.seen.entries.insert(fingerprint.to_string(), now);
        self.dirty = true;
    }

    /// Check-and-record in one step: true exactly once per fresh fingerprint
    /// within the retention window.
    pub fn accept(&mut self, job: &Job, now: DateTime<Utc>) -> bool {
        self.accept_fingerprint(&job.fingerprint, now)
    }

    pub fn accept_fingerprint(&mut self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        if self.is_duplicate(fingerprint, now) {
            return false;
        }
        self.mark_seen(fingerprint, now);
        true
    }

    /// Drop entries past retention. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.seen.entries.len();
        let retention = self.retention;
        self.seen
            .entries
            .retain(|_, at| now.signed_duration_since(*at) < retention);
        let removed = before - self.seen.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Write state atomically (temp file + rename). No-op when in-memory or clean.
    pub async fn persist(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let doc = StateFile {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            seen: self.seen.clone(),
        };
        let bytes = serde_json::to_vec(&doc).context("encoding seen-set")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        self.dirty = false;
        Ok(())
    }
}
