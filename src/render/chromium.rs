//! Headless Chromium renderer
//!
//! One browser process, one fresh tab per navigation. Tabs are closed by
//! a drop guard so a timed-out or cancelled navigation never leaks a tab.
//! Network quietness is observed from inside the page with a
//! `PerformanceObserver` on resource entries.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::status::is_valid_status;
use super::{RenderError, RenderedDocument, Renderer, WaitStrategy};

/// Chromium launch and navigation settings
#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    /// Chrome/Chromium executable, auto-detected when `None`
    pub chrome_path: Option<PathBuf>,
    /// Run without a visible window
    pub headless: bool,
    /// Disable the Chrome sandbox (needed in most containers)
    pub no_sandbox: bool,
    /// Viewport size
    pub window_size: (u32, u32),
    /// User agent presented to the origin
    pub user_agent: Option<String>,
    /// Pause after the load event for `dom_content_loaded`
    pub settle_delay: Duration,
    /// CDP request timeout
    pub request_timeout: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            no_sandbox: false,
            window_size: (1366, 768),
            user_agent: None,
            settle_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Closes its tab when dropped
struct Tab {
    page: Page,
}

impl Drop for Tab {
    fn drop(&mut self) {
        let page = self.page.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = page.close().await {
                    debug!(error = %e, "Failed to close tab");
                }
            });
        }
    }
}

/// [`Renderer`] backed by a local Chromium process
pub struct ChromiumRenderer {
    browser: RwLock<Option<Browser>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    config: ChromiumConfig,
}

impl ChromiumRenderer {
    /// Launch the browser
    #[instrument(skip(config), fields(headless = config.headless))]
    pub async fn launch(config: ChromiumConfig) -> Result<Self, RenderError> {
        let (width, height) = config.window_size;
        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .request_timeout(config.request_timeout);

        if !config.headless {
            builder = builder.with_head();
        }
        if config.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(path) = &config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        let browser_config = builder.build().map_err(RenderError::Crash)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::Crash(format!("failed to launch browser: {}", e)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler error");
                }
            }
            warn!("Browser handler stopped");
        });

        info!("Chromium launched");

        Ok(Self {
            browser: RwLock::new(Some(browser)),
            handler: Mutex::new(Some(handler_task)),
            config,
        })
    }

    async fn open_tab(&self) -> Result<Tab, RenderError> {
        let guard = self.browser.read().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| RenderError::Crash("browser is not running".to_string()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| RenderError::Crash(format!("failed to open tab: {}", e)))?;

        if let Some(ua) = &self.config.user_agent {
            page.set_user_agent(ua.as_str())
                .await
                .map_err(|e| RenderError::Crash(e.to_string()))?;
        }

        Ok(Tab { page })
    }

    async fn wait_for_quiet_network(page: &Page, quiet: Duration) -> Result<(), RenderError> {
        let script = format!(
            r#"
            new Promise((resolve) => {{
                const quiet = {};
                let timer = setTimeout(() => resolve(true), quiet);
                const observer = new PerformanceObserver(() => {{
                    clearTimeout(timer);
                    timer = setTimeout(() => {{
                        observer.disconnect();
                        resolve(true);
                    }}, quiet);
                }});
                observer.observe({{ entryTypes: ['resource'] }});
            }})
            "#,
            quiet.as_millis()
        );

        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(RenderError::Crash)?;

        page.evaluate_expression(params)
            .await
            .map_err(|e| map_cdp_error(e, quiet))?;
        Ok(())
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn navigate(
        &self,
        url: &str,
        wait: WaitStrategy,
        timeout: Duration,
    ) -> Result<RenderedDocument, RenderError> {
        let tab = self.open_tab().await?;

        tab.page
            .goto(url)
            .await
            .map_err(|e| map_cdp_error(e, timeout))?;

        let navigation = tab
            .page
            .wait_for_navigation_response()
            .await
            .map_err(|e| map_cdp_error(e, timeout))?;
        let http_status = navigation
            .as_ref()
            .and_then(|request| request.response.as_ref())
            .and_then(|response| navigation_status(response.status));

        match wait.quiet_window() {
            Some(quiet) => Self::wait_for_quiet_network(&tab.page, quiet).await?,
            None => tokio::time::sleep(self.config.settle_delay).await,
        }

        let html = tab
            .page
            .content()
            .await
            .map_err(|e| RenderError::Crash(format!("failed to read DOM: {}", e)))?;

        debug!(
            url,
            strategy = wait.as_str(),
            status = ?http_status,
            bytes = html.len(),
            "DOM captured"
        );
        let document = RenderedDocument::new(html);
        Ok(match http_status {
            Some(status) => document.with_status(status),
            None => document,
        })
    }

    async fn close(&self) {
        if let Some(mut browser) = self.browser.write().await.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Failed to close browser cleanly");
            }
            if let Err(e) = browser.wait().await {
                warn!(error = %e, "Failed to reap browser process");
            }
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = handler {
            task.abort();
        }
        info!("Chromium closed");
    }
}

/// HTTP status of the main document, as reported by CDP
fn navigation_status(status: i64) -> Option<u16> {
    u16::try_from(status).ok().filter(|code| is_valid_status(*code))
}

fn map_cdp_error(error: CdpError, timeout: Duration) -> RenderError {
    match error {
        CdpError::Timeout => RenderError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        other => RenderError::Navigation(other.to_string()),
    }
}
