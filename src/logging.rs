use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Global subscriber: `RUST_LOG` wins over `logging.level`; JSON output when
/// `logging.json` is set or `LOG_FORMAT=json`.
pub fn init_tracing(cfg: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let json = cfg.json
        || std::env::var("LOG_FORMAT")
            .ok()
            .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    // A subscriber may already be installed (tests, embedding).
    if let Err(e) = res {
        tracing::debug!(error = %e, "tracing already initialised");
    }
}
