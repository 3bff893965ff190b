//! Chromium-based renderer using chromiumoxide.

use super::reaper;
use super::{ClearMode, Identity, Locator, RenderContext, Renderer};
use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{EvaluateParams, ExecutionContextId};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Find the Chromium binary path.
pub fn find_chromium(configured: Option<&Path>) -> Option<PathBuf> {
    // 1. Explicit configuration
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        warn!("configured browser path {} does not exist", path.display());
    }

    // 2. ~/.harvest/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".harvest/chromium/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".harvest/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".harvest/chromium/chrome-linux64/chrome"),
                home.join(".harvest/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS locations
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Launches one headless Chromium per session.
pub struct ChromiumRenderer {
    executable: PathBuf,
    headless: bool,
    launch_timeout: Duration,
    request_timeout: Duration,
}

impl ChromiumRenderer {
    pub fn new(config: &HarvestConfig) -> Result<Self> {
        let executable = find_chromium(config.chromium_path.as_deref()).ok_or_else(|| {
            HarvestError::Setup(
                "Chromium not found. Set HARVEST_CHROMIUM_PATH or install google-chrome/chromium"
                    .to_string(),
            )
        })?;
        Ok(Self {
            executable,
            headless: config.headless,
            launch_timeout: config.launch_timeout,
            request_timeout: config.page_load_timeout,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn browser_config(&self, identity: &Identity) -> Result<BrowserConfig> {
        let (width, height) = identity.viewport;
        let mut builder = BrowserConfig::builder()
            .chrome_executable(&self.executable)
            .user_data_dir(&identity.profile_dir)
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .launch_timeout(self.launch_timeout)
            .request_timeout(self.request_timeout)
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-blink-features=AutomationControlled")
            .arg(format!("--user-agent={}", identity.user_agent));
        builder = if self.headless {
            builder.new_headless_mode()
        } else {
            builder.with_head()
        };
        builder
            .build()
            .map_err(|e| HarvestError::Launch(format!("failed to build browser config: {e}")))
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn launch(&self, identity: &Identity) -> Result<Box<dyn RenderContext>> {
        std::fs::create_dir_all(&identity.profile_dir)?;
        let config = self.browser_config(identity)?;

        let (mut browser, mut handler) =
            match tokio::time::timeout(self.launch_timeout, Browser::launch(config)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(HarvestError::Launch(e.to_string())),
                Err(_) => {
                    return Err(HarvestError::Launch(format!(
                        "browser did not start within {}s",
                        self.launch_timeout.as_secs()
                    )))
                }
            };

        // Spawn the handler task
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler event error: {e}");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.kill().await;
                handler_task.abort();
                return Err(HarvestError::Launch(format!("failed to open page: {e}")));
            }
        };

        Ok(Box::new(ChromiumContext {
            browser,
            page,
            handler_task,
            frame: None,
        }))
    }

    async fn reap_orphans(&self, scope: &Path) -> usize {
        let scope = scope.to_path_buf();
        tokio::task::spawn_blocking(move || reaper::kill_processes_under(&scope))
            .await
            .unwrap_or(0)
    }

    async fn preflight(&self) -> Result<()> {
        if self.executable.exists() {
            Ok(())
        } else {
            Err(HarvestError::Setup(format!(
                "browser binary missing: {}",
                self.executable.display()
            )))
        }
    }
}

/// A single Chromium browser with one page.
pub struct ChromiumContext {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    /// Execution context of the iframe entered with `enter_frame`.
    frame: Option<ExecutionContextId>,
}

impl ChromiumContext {
    async fn find_all(&self, locator: &Locator) -> Result<Vec<Element>> {
        let found = match locator {
            Locator::XPath(expr) => self.page.find_xpaths(expr.as_str()).await,
            Locator::Css(selector) => self.page.find_elements(selector.as_str()).await,
        };
        match found {
            Ok(elements) => Ok(elements),
            // An empty DOM search is reported by the protocol as an error.
            Err(CdpError::NotFound) | Err(CdpError::Chrome(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn first(&self, locator: &Locator) -> Result<Element> {
        self.find_all(locator)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HarvestError::Browser(format!("no element matches {locator}")))
    }

    async fn eval_in_context(&self, expression: &str) -> Result<serde_json::Value> {
        let mut params = EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true);
        if let Some(ctx) = self.frame {
            params = params.context_id(ctx);
        }
        let params = params.build().map_err(HarvestError::Browser)?;
        let result = self.page.evaluate_expression(params).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        self.frame = None;
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HarvestError::Timeout(format!(
                "navigation to {url} exceeded {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn reload(&mut self, timeout: Duration) -> Result<()> {
        self.frame = None;
        match tokio::time::timeout(timeout, self.page.reload()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HarvestError::Timeout(format!(
                "reload exceeded {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn probe(&mut self) -> Result<()> {
        match tokio::time::timeout(PROBE_TIMEOUT, self.browser.version()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HarvestError::Timeout("liveness probe".to_string())),
        }
    }

    async fn dismiss_dialog(&mut self) -> Result<bool> {
        // The protocol rejects the command when no dialog is showing.
        Ok(self
            .page
            .execute(HandleJavaScriptDialogParams::new(true))
            .await
            .is_ok())
    }

    async fn is_present(&mut self, locator: &Locator) -> Result<bool> {
        Ok(!self.find_all(locator).await?.is_empty())
    }

    async fn clear(&mut self, locator: &Locator, mode: ClearMode) -> Result<()> {
        let element = self.first(locator).await?;
        match mode {
            ClearMode::Plain => {
                element
                    .call_js_fn(
                        "function() { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); }",
                        false,
                    )
                    .await?;
            }
            ClearMode::SelectAllDelete => {
                element
                    .call_js_fn(
                        "function() { this.focus(); if (typeof this.select === 'function') { this.select(); } }",
                        false,
                    )
                    .await?;
                element.press_key("Backspace").await?;
            }
        }
        Ok(())
    }

    async fn type_text(&mut self, locator: &Locator, text: &str) -> Result<()> {
        let element = self.first(locator).await?;
        element.focus().await?.type_str(text).await?;
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<()> {
        let element = self.first(locator).await?;
        if let Err(e) = element.click().await {
            debug!("pointer click on {locator} failed ({e}); falling back to DOM click");
            element
                .call_js_fn("function() { this.click(); }", false)
                .await?;
        }
        Ok(())
    }

    async fn document_html(&mut self) -> Result<String> {
        if self.frame.is_none() {
            return Ok(self.page.content().await?);
        }
        match self
            .eval_in_context("document.documentElement.outerHTML")
            .await?
        {
            serde_json::Value::String(html) => Ok(html),
            other => Err(HarvestError::Browser(format!(
                "unexpected frame document value: {other}"
            ))),
        }
    }

    async fn enter_frame(&mut self, marker: &str) -> Result<bool> {
        let selector = format!("iframe[id*='{}']", marker.replace('\'', "\\'"));
        let Some(frame_el) = self.find_all(&Locator::Css(selector)).await?.into_iter().next()
        else {
            return Ok(false);
        };
        let node = frame_el.description().await?;
        let frame_id = node
            .frame_id
            .clone()
            .or_else(|| node.content_document.as_ref().and_then(|d| d.frame_id.clone()));
        let Some(frame_id) = frame_id else {
            return Ok(false);
        };
        match self.page.frame_execution_context(frame_id).await? {
            Some(ctx) => {
                self.frame = Some(ctx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exit_frame(&mut self) -> Result<()> {
        self.frame = None;
        Ok(())
    }

    async fn clear_state(&mut self) -> Result<()> {
        self.frame = None;
        self.browser.clear_cookies().await?;
        self.eval_in_context(
            "(() => { try { window.localStorage.clear(); window.sessionStorage.clear(); } catch (e) {} return true; })()",
        )
        .await?;
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        let ChromiumContext {
            mut browser,
            page,
            handler_task,
            ..
        } = *self;

        let _ = tokio::time::timeout(CLOSE_TIMEOUT, page.close()).await;
        match tokio::time::timeout(CLOSE_TIMEOUT, browser.close()).await {
            Ok(Ok(_)) => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, browser.wait()).await;
            }
            Ok(Err(e)) => warn!("graceful browser close failed: {e}"),
            Err(_) => warn!("graceful browser close timed out"),
        }
        if let Some(Err(e)) = browser.kill().await {
            debug!("browser kill after close: {e}");
        }
        handler_task.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::Identity;

    fn identity(dir: &Path) -> Identity {
        Identity {
            user_agent: crate::config::DEFAULT_USER_AGENTS[0].to_string(),
            viewport: (1280, 800),
            profile_dir: dir.join("profile"),
        }
    }

    #[test]
    fn configured_path_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("chrome");
        std::fs::write(&fake, b"").unwrap();
        assert_eq!(find_chromium(Some(&fake)), Some(fake));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_form_and_frame_round() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ChromiumRenderer::new(&HarvestConfig::default())
            .expect("chromium not found");
        let mut ctx = renderer
            .launch(&identity(dir.path()))
            .await
            .expect("failed to launch");

        ctx.navigate(
            "data:text/html,<input id='q'><table><tr><td>77</td><td>Ana</td></tr></table>",
            Duration::from_secs(30),
        )
        .await
        .expect("navigation failed");

        let input = Locator::css("#q");
        assert!(ctx.is_present(&input).await.unwrap());
        assert!(!ctx.is_present(&Locator::xpath("//select")).await.unwrap());
        ctx.type_text(&input, "12345").await.unwrap();
        ctx.clear(&input, ClearMode::SelectAllDelete).await.unwrap();

        let html = ctx.document_html().await.unwrap();
        assert!(html.contains("Ana"));
        assert!(!ctx.enter_frame("Viewer").await.unwrap());
        ctx.probe().await.unwrap();
        ctx.shutdown().await.unwrap();
    }
}
