//! Headless page rendering for sources that only populate their tables client-side.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};
use vdv_core::RenderOptions;
use vdv_storage::AttemptFailure;

const SELECTOR_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("render failed, retryable: {0}")]
    Transient(String),
    #[error("render failed: {0}")]
    Permanent(String),
}

impl RenderError {
    pub fn into_attempt_failure(self) -> AttemptFailure {
        match self {
            RenderError::Transient(reason) => AttemptFailure::transient(reason),
            RenderError::Permanent(reason) => AttemptFailure::permanent(reason),
        }
    }
}

/// Navigate to a URL and hand back the DOM once it has settled.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<String, RenderError>;
}

#[derive(Debug, Clone, Default)]
pub struct RenderConfig {
    /// Chrome/Chromium binary; chromiumoxide searches the usual locations when unset.
    pub chrome_executable: Option<PathBuf>,
}

/// Launches a fresh headless Chromium per render and closes it afterwards.
#[derive(Debug, Clone, Default)]
pub struct ChromiumRenderer {
    config: RenderConfig,
}

impl ChromiumRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    fn browser_config(&self, timeout: Duration) -> Result<BrowserConfig, RenderError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .request_timeout(timeout);
        if let Some(path) = &self.config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        builder.build().map_err(RenderError::Permanent)
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<String, RenderError> {
        let timeout = Duration::from_secs(options.timeout_secs.max(1));
        let (mut browser, mut handler) = Browser::launch(self.browser_config(timeout)?)
            .await
            .map_err(|err| RenderError::Transient(format!("launching browser: {err}")))?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let rendered = tokio::time::timeout(timeout, load(&browser, url, options)).await;

        if let Err(err) = browser.close().await {
            warn!(%url, error = %err, "closing browser failed");
        }
        events.abort();

        match rendered {
            Ok(result) => result,
            Err(_) => Err(RenderError::Transient(format!(
                "page did not settle within {}s",
                timeout.as_secs()
            ))),
        }
    }
}

async fn load(browser: &Browser, url: &str, options: &RenderOptions) -> Result<String, RenderError> {
    let transient = |what: &str, err: chromiumoxide::error::CdpError| {
        RenderError::Transient(format!("{what}: {err}"))
    };

    let page: Page = browser
        .new_page(url)
        .await
        .map_err(|err| transient("opening page", err))?;
    page.wait_for_navigation()
        .await
        .map_err(|err| transient("navigation", err))?;

    if let Some(wait_selector) = options.wait_selector.as_deref() {
        while page.find_element(wait_selector).await.is_err() {
            tokio::time::sleep(SELECTOR_POLL).await;
        }
        debug!(%url, wait_selector, "selector present");
    }
    if options.settle_ms > 0 {
        tokio::time::sleep(Duration::from_millis(options.settle_ms)).await;
    }

    let html = page
        .content()
        .await
        .map_err(|err| transient("reading content", err))?;
    if let Err(err) = page.close().await {
        warn!(%url, error = %err, "closing page failed");
    }
    Ok(html)
}
