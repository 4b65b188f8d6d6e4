// src/ingest/providers/mod.rs
pub mod browser;
pub mod feed;
pub mod search;
pub mod session;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::config::{load_config_from, CollectorConfig};
use crate::ingest::scheduler::ConnectorFactory;
use crate::ingest::types::SourceConnector;

use self::browser::BrowserConnector;
use self::feed::FeedConnector;
use self::search::SearchConnector;
use self::session::BrowserLauncher;

/// Connectors for every enabled source in `cfg`. A connector that cannot be
/// constructed is logged and left out.
pub fn build_connectors(
    cfg: &CollectorConfig,
    launcher: Arc<dyn BrowserLauncher>,
) -> Vec<Box<dyn SourceConnector>> {
    let mut out: Vec<Box<dyn SourceConnector>> = Vec::new();

    if cfg.search.enabled {
        match SearchConnector::from_config(cfg.search.clone()) {
            Ok(c) => out.push(Box::new(c)),
            Err(e) => tracing::warn!(target: "ingest", source = "search", error = %e, "connector disabled"),
        }
    }
    if cfg.feed.enabled {
        match FeedConnector::from_config(cfg.feed.clone()) {
            Ok(c) => out.push(Box::new(c)),
            Err(e) => tracing::warn!(target: "ingest", source = "feed", error = %e, "connector disabled"),
        }
    }
    if cfg.browser.enabled {
        out.push(Box::new(BrowserConnector::new(
            cfg.browser.clone(),
            &cfg.search.search_terms,
            launcher,
        )));
    }
    out
}

/// Builds each cycle's connectors from a fresh read of the configuration
/// file, keeping the last good configuration when the read fails.
pub struct ConfiguredConnectors {
    path: Option<PathBuf>,
    last_good: Mutex<CollectorConfig>,
    launcher: Arc<dyn BrowserLauncher>,
}

impl ConfiguredConnectors {
    pub fn new(
        path: Option<PathBuf>,
        initial: CollectorConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            path,
            last_good: Mutex::new(initial),
            launcher,
        }
    }

    /// Configuration the next cycle will use. The file is read on the
    /// blocking pool.
    pub async fn current(&self) -> CollectorConfig {
        if let Some(path) = self.path.clone() {
            let read_path = path.clone();
            let loaded = tokio::task::spawn_blocking(move || load_config_from(&read_path))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r);
            let mut last = self.last_good.lock().unwrap_or_else(PoisonError::into_inner);
            match loaded {
                Ok(cfg) => *last = cfg,
                Err(e) => tracing::warn!(
                    target: "ingest",
                    path = %path.display(),
                    error = ?e,
                    "config reload failed, keeping last good configuration"
                ),
            }
            return last.clone();
        }
        self.last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ConnectorFactory for ConfiguredConnectors {
    async fn connectors(&self) -> Vec<Box<dyn SourceConnector>> {
        build_connectors(&self.current().await, self.launcher.clone())
    }
}
