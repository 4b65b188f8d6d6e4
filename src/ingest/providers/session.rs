// src/ingest/providers/session.rs
//! Page-rendering sessions used by the browser-driven connector.
//!
//! Two launchers ship: plain HTTP (server-rendered markup only) and, with the
//! `webdriver` feature, a real browser driven over WebDriver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BrowserConfig, BrowserDriver};
use crate::errors::SourceFetchError;

const SOURCE_NAME: &str = "browser";
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub headless: bool,
    pub slow_mo_ms: u64,
    pub navigation_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            headless: true,
            slow_mo_ms: 0,
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

/// One browser tab. Owned by a single keyword query and closed when it ends.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), SourceFetchError>;

    /// HTML of the current page.
    async fn content(&mut self) -> Result<String, SourceFetchError>;

    /// Wait until `selector` matches on the current page. Sessions that hold
    /// the final markup as soon as navigation returns keep the default.
    async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> Result<(), SourceFetchError> {
        Ok(())
    }

    async fn wait_ms(&mut self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn close(&mut self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, opts: &SessionOptions)
        -> Result<Box<dyn BrowserSession>, SourceFetchError>;
}

/// Launcher for the configured `browser.driver`. Asking for `webdriver` in a
/// build without the feature is an error.
pub fn launcher_for(cfg: &BrowserConfig) -> Result<Arc<dyn BrowserLauncher>, SourceFetchError> {
    match cfg.driver {
        BrowserDriver::Http => {
            if !cfg.headless {
                tracing::warn!(
                    target: "ingest",
                    source = SOURCE_NAME,
                    "headless = false needs driver = \"webdriver\"; the http driver never opens a window"
                );
            }
            Ok(Arc::new(HttpBrowserLauncher))
        }
        #[cfg(feature = "webdriver")]
        BrowserDriver::Webdriver => Ok(Arc::new(webdriver::WebDriverLauncher::new(
            cfg.webdriver_url.clone(),
        ))),
        #[cfg(not(feature = "webdriver"))]
        BrowserDriver::Webdriver => Err(SourceFetchError::Browser {
            source_name: SOURCE_NAME,
            reason: "driver = \"webdriver\" requires building with --features webdriver".into(),
        }),
    }
}

/// Fetches pages over plain HTTP. No script execution, so it only sees
/// server-rendered markup.
#[derive(Debug, Clone, Default)]
pub struct HttpBrowserLauncher;

#[async_trait]
impl BrowserLauncher for HttpBrowserLauncher {
    async fn launch(
        &self,
        opts: &SessionOptions,
    ) -> Result<Box<dyn BrowserSession>, SourceFetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(opts.navigation_timeout)
            .build()
            .map_err(|e| SourceFetchError::Browser {
                source_name: SOURCE_NAME,
                reason: format!("building http client: {e}"),
            })?;
        Ok(Box::new(HttpSession {
            client,
            slow_mo: Duration::from_millis(opts.slow_mo_ms),
            html: None,
        }))
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    slow_mo: Duration,
    html: Option<String>,
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn goto(&mut self, url: &str) -> Result<(), SourceFetchError> {
        if !self.slow_mo.is_zero() {
            tokio::time::sleep(self.slow_mo).await;
        }
        let resp = self
            .client
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
        let body = resp.text().await.map_err(|error| SourceFetchError::Http {
            source_name: SOURCE_NAME,
            url: url.to_string(),
            error,
        })?;
        self.html = Some(body);
        Ok(())
    }

    async fn content(&mut self) -> Result<String, SourceFetchError> {
        self.html.clone().ok_or_else(|| SourceFetchError::Browser {
            source_name: SOURCE_NAME,
            reason: "content requested before navigation".into(),
        })
    }

    async fn close(&mut self) {
        self.html = None;
    }
}

#[cfg(feature = "webdriver")]
pub mod webdriver {
    //! Real browser over WebDriver (geckodriver by default).

    use std::time::Duration;

    use async_trait::async_trait;
    use fantoccini::{Client, ClientBuilder, Locator};
    use serde_json::{json, Map, Value};

    use super::{BrowserLauncher, BrowserSession, SessionOptions, SOURCE_NAME};
    use crate::errors::SourceFetchError;

    fn browser_err(what: &str, e: impl std::fmt::Display) -> SourceFetchError {
        SourceFetchError::Browser {
            source_name: SOURCE_NAME,
            reason: format!("{what}: {e}"),
        }
    }

    /// Firefox capabilities, with `-headless` when asked for.
    pub fn capabilities(opts: &SessionOptions) -> Map<String, Value> {
        let args: Vec<&str> = if opts.headless { vec!["-headless"] } else { vec![] };
        let mut caps = Map::new();
        caps.insert("browserName".into(), json!("firefox"));
        caps.insert("moz:firefoxOptions".into(), json!({ "args": args }));
        caps.insert(
            "timeouts".into(),
            json!({ "pageLoad": opts.navigation_timeout.as_millis() as u64 }),
        );
        caps
    }

    #[derive(Debug, Clone)]
    pub struct WebDriverLauncher {
        url: String,
    }

    impl WebDriverLauncher {
        pub fn new(url: impl Into<String>) -> Self {
            Self { url: url.into() }
        }
    }

    #[async_trait]
    impl BrowserLauncher for WebDriverLauncher {
        async fn launch(
            &self,
            opts: &SessionOptions,
        ) -> Result<Box<dyn BrowserSession>, SourceFetchError> {
            let mut builder = ClientBuilder::native();
            builder.capabilities(capabilities(opts));
            let client = builder
                .connect(&self.url)
                .await
                .map_err(|e| browser_err("webdriver session", e))?;
            tracing::debug!(target: "ingest", source = SOURCE_NAME, url = %self.url, headless = opts.headless, "webdriver session opened");
            Ok(Box::new(WebDriverSession {
                client: Some(client),
                slow_mo: Duration::from_millis(opts.slow_mo_ms),
            }))
        }
    }

    pub struct WebDriverSession {
        client: Option<Client>,
        slow_mo: Duration,
    }

    impl WebDriverSession {
        fn client(&self) -> Result<&Client, SourceFetchError> {
            self.client
                .as_ref()
                .ok_or_else(|| browser_err("session", "already closed"))
        }
    }

    #[async_trait]
    impl BrowserSession for WebDriverSession {
        async fn goto(&mut self, url: &str) -> Result<(), SourceFetchError> {
            if !self.slow_mo.is_zero() {
                tokio::time::sleep(self.slow_mo).await;
            }
            self.client()?
                .goto(url)
                .await
                .map_err(|e| browser_err("navigation", e))
        }

        async fn content(&mut self) -> Result<String, SourceFetchError> {
            self.client()?
                .source()
                .await
                .map_err(|e| browser_err("page source", e))
        }

        async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SourceFetchError> {
            self.client()?
                .wait()
                .at_most(timeout)
                .for_element(Locator::Css(selector))
                .await
                .map(|_| ())
                .map_err(|e| browser_err("waiting for page", e))
        }

        async fn close(&mut self) {
            if let Some(client) = self.client.take() {
                if let Err(e) = client.close().await {
                    tracing::debug!(target: "ingest", source = SOURCE_NAME, error = %e, "webdriver close failed");
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn headless_flag_reaches_firefox_args() {
            let on = capabilities(&SessionOptions::default());
            assert_eq!(on["moz:firefoxOptions"]["args"], json!(["-headless"]));
            let off = capabilities(&SessionOptions {
                headless: false,
                ..SessionOptions::default()
            });
            assert_eq!(off["moz:firefoxOptions"]["args"], json!([]));
            assert_eq!(off["timeouts"]["pageLoad"], json!(30_000));
        }
    }
}
