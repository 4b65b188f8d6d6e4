// src/config/mod.rs
pub mod collector;

pub use collector::{
    BrokerConfig, BrowserConfig, BrowserDriver, CollectorConfig, CronConfig, DedupConfig, FeedConfig,
    LoggingConfig, MetricsConfig, SchedulerConfig, SearchConfig,
};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_CONFIG_PATH: &str = "COLLECTOR_CONFIG";
pub const DEFAULT_CONFIG_TOML: &str = "config/collector.toml";
pub const DEFAULT_CONFIG_JSON: &str = "config/collector.json";

/// Load configuration from an explicit path. TOML or JSON by extension,
/// with `inherits` resolved and credential env vars applied.
pub fn load_config_from(path: &Path) -> Result<CollectorConfig> {
    let mut seen = HashSet::new();
    let merged = load_value_recursive(path, &mut seen)?;
    let mut cfg: CollectorConfig = serde_json::from_value(merged)
        .with_context(|| format!("invalid collector config in {}", path.display()))?;
    cfg.scheduler
        .schedule()
        .map_err(|e| anyhow!("invalid collector config in {}: {e}", path.display()))?;
    apply_env_overrides(&mut cfg);
    tracing::info!(path = %path.display(), "configuration loaded");
    Ok(cfg)
}

/// Load configuration using env var + fallbacks:
/// 1) $COLLECTOR_CONFIG
/// 2) config/collector.toml
/// 3) config/collector.json
/// 4) built-in defaults (every source disabled)
pub fn load_config_default() -> Result<CollectorConfig> {
    if let Some(p) = default_config_path()? {
        return load_config_from(&p);
    }
    let mut cfg = CollectorConfig::default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Resolve which file `load_config_default` would read, if any.
pub fn default_config_path() -> Result<Option<PathBuf>> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(Some(pb));
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
    }
    for candidate in [DEFAULT_CONFIG_TOML, DEFAULT_CONFIG_JSON] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return Ok(Some(pb));
        }
    }
    Ok(None)
}

fn load_value_recursive(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let resolved = path
        .canonicalize()
        .with_context(|| format!("resolving config path {}", path.display()))?;
    if !seen.insert(resolved.clone()) {
        bail!("circular config inheritance at {}", resolved.display());
    }

    let content = fs::read_to_string(&resolved)
        .with_context(|| format!("reading config from {}", resolved.display()))?;
    let ext = resolved
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut value = parse_document(&content, &ext)
        .with_context(|| format!("parsing config {}", resolved.display()))?;

    let inherits = match value.as_object_mut() {
        Some(obj) => {
            if obj.remove("$schema").is_some() {
                tracing::debug!(path = %resolved.display(), "ignoring $schema field");
            }
            obj.remove("inherits")
        }
        None => bail!("config root must be a table/object"),
    };

    let Some(inherits) = inherits else {
        return Ok(value);
    };
    let Some(base_rel) = inherits.as_str() else {
        bail!("`inherits` must be a path string");
    };
    let base_path = {
        let p = PathBuf::from(base_rel);
        match resolved.parent() {
            Some(dir) if !p.is_absolute() => dir.join(p),
            _ => p,
        }
    };
    let base = load_value_recursive(&base_path, seen)?;
    Ok(merge_values(base, value))
}

fn parse_document(s: &str, ext: &str) -> Result<Value> {
    match ext {
        "json" => Ok(serde_json::from_str(s)?),
        "toml" => Ok(toml::from_str(s)?),
        // Unknown extension: JSON first, then TOML.
        _ => serde_json::from_str(s)
            .or_else(|_| toml::from_str(s))
            .map_err(|e| anyhow!("unsupported config format: {e}")),
    }
}

/// Deep-merge `over` onto `base`: tables merge key by key, anything else replaces.
pub fn merge_values(base: Value, over: Value) -> Value {
    match (base, over) {
        (Value::Object(mut b), Value::Object(o)) => {
            for (k, v) in o {
                let merged = match b.remove(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => v,
                };
                b.insert(k, merged);
            }
            Value::Object(b)
        }
        (_, over) => over,
    }
}

fn apply_env_overrides(cfg: &mut CollectorConfig) {
    let user = env_first(&["BROKER_USER", "ARTEMIS_USER"]);
    let pass = env_first(&["BROKER_PASSWORD", "ARTEMIS_PASSWORD"]);
    if user.is_some() {
        cfg.broker.username = user;
    }
    if pass.is_some() {
        cfg.broker.password = pass;
    }
    if let Some(host) = env_first(&["BROKER_HOST"]) {
        cfg.broker.host = host;
    }
    if let Some(port) = env_first(&["BROKER_PORT"]).and_then(|p| p.parse().ok()) {
        cfg.broker.port = port;
    }
}

fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}
