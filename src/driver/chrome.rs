//! Chromium-backed driver over the DevTools protocol.
//!
//! Each [`ChromeDriver`] owns one browser process and one page. Perception
//! runs [`LABEL_SCRIPT`] in the page, which tags every visible interactive
//! element with `data-uv-label` and draws a numbered red overlay on it.
//! Actions resolve their target through that attribute.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DriverError, DriverFactory, DriverResult, Element, PerceivedView, UiDriver};
use crate::action::{Action, ScrollDirection, ScrollTarget};

/// Pixels moved by one scroll action
const SCROLL_STEP: i32 = 500;

/// Longest label text reported per element
const LABEL_TEXT_CHARS: usize = 30;

const LABEL_SCRIPT: &str = r#"
(() => {
  document.querySelectorAll('.uv-label').forEach(n => n.remove());
  document.querySelectorAll('[data-uv-label]').forEach(n => n.removeAttribute('data-uv-label'));
  const selector = 'a, button, input, textarea, select, [onclick], [role="button"], [tabindex]';
  const out = [];
  let index = 0;
  for (const el of document.querySelectorAll(selector)) {
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    if (rect.width === 0 || rect.height === 0) continue;
    if (style.visibility === 'hidden' || style.display === 'none') continue;
    if (rect.bottom < 0 || rect.top > window.innerHeight) continue;
    el.setAttribute('data-uv-label', String(index));
    const badge = document.createElement('div');
    badge.className = 'uv-label';
    badge.textContent = String(index);
    badge.style.cssText = 'position:fixed;z-index:2147483647;pointer-events:none;' +
      'background:#e11;color:#fff;font:bold 12px monospace;padding:0 3px;' +
      'left:' + Math.max(rect.left, 0) + 'px;top:' + Math.max(rect.top, 0) + 'px;';
    document.body.appendChild(badge);
    const text = (el.innerText || el.value || el.placeholder ||
      el.getAttribute('aria-label') || el.title || '').trim().replace(/\s+/g, ' ');
    out.push({ index, tag: el.tagName, text });
    index += 1;
  }
  return out;
})()
"#;

const CLEAR_OVERLAYS_SCRIPT: &str =
    "document.querySelectorAll('.uv-label').forEach(n => n.remove()); true";

/// Browser launch options
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    pub window: (u32, u32),
    /// Disable the Chromium sandbox (needed when running as root in containers)
    pub no_sandbox: bool,
    pub request_timeout: Duration,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            headless: true,
            window: (1280, 900),
            no_sandbox: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ChromeOptions {
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    fn browser_config(&self) -> DriverResult<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .window_size(self.window.0, self.window.1)
            .request_timeout(self.request_timeout)
            .args(vec![
                "--disable-extensions",
                "--disable-popup-blocking",
                "--no-first-run",
                "--no-default-browser-check",
                "--mute-audio",
            ]);
        if !self.headless {
            builder = builder.with_head();
        }
        if self.no_sandbox {
            builder = builder.no_sandbox();
        }
        builder
            .build()
            .map_err(|e| DriverError::Browser(format!("browser config error: {}", e)))
    }
}

/// Launches one Chromium instance per session.
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    options: ChromeOptions,
}

impl ChromeLauncher {
    pub fn new(options: ChromeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl DriverFactory for ChromeLauncher {
    async fn launch(&self) -> DriverResult<Box<dyn UiDriver>> {
        Ok(Box::new(ChromeDriver::launch(&self.options).await?))
    }
}

#[derive(Debug, Deserialize)]
struct LabelledElement {
    index: usize,
    tag: String,
    #[serde(default)]
    text: String,
}

pub struct ChromeDriver {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

impl ChromeDriver {
    pub async fn launch(options: &ChromeOptions) -> DriverResult<Self> {
        let (browser, mut handler) = Browser::launch(options.browser_config()?).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });
        let page = browser.new_page("about:blank").await?;
        Ok(Self {
            browser,
            page,
            handler,
        })
    }

    fn selector(index: usize) -> String {
        format!("[data-uv-label=\"{}\"]", index)
    }

    async fn scroll(&self, target: &ScrollTarget, direction: ScrollDirection) -> DriverResult<()> {
        let dy = match direction {
            ScrollDirection::Up => -SCROLL_STEP,
            ScrollDirection::Down => SCROLL_STEP,
        };
        let script = match target {
            ScrollTarget::Window => format!("window.scrollBy(0, {}); true", dy),
            ScrollTarget::Element(index) => format!(
                "(() => {{ const el = document.querySelector('{}'); \
                 if (!el) return false; el.scrollBy(0, {}); return true; }})()",
                Self::selector(*index).replace('\'', "\\'"),
                dy
            ),
        };
        let moved: bool = self.page.evaluate(script).await?.into_value().unwrap_or(false);
        match (moved, target) {
            (false, ScrollTarget::Element(index)) => Err(DriverError::StaleLabel(*index)),
            _ => Ok(()),
        }
    }

    async fn element(&self, index: usize) -> DriverResult<chromiumoxide::element::Element> {
        self.page
            .find_element(Self::selector(index))
            .await
            .map_err(|_| DriverError::StaleLabel(index))
    }
}

#[async_trait]
impl UiDriver for ChromeDriver {
    async fn navigate(&mut self, url: &str) -> DriverResult<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| DriverError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        // Focus the document so key presses reach the page.
        if let Ok(body) = self.page.find_element("body").await {
            if let Err(e) = body.click().await {
                debug!(error = %e, "could not focus page body");
            }
        }
        Ok(())
    }

    async fn perceive(&mut self) -> DriverResult<PerceivedView> {
        let labelled: Vec<LabelledElement> = self
            .page
            .evaluate(LABEL_SCRIPT)
            .await?
            .into_value()
            .map_err(|e| DriverError::Browser(format!("label script returned bad data: {}", e)))?;
        let elements = labelled
            .into_iter()
            .map(|e| Element {
                index: e.index,
                tag: e.tag,
                label_text: e.text.chars().take(LABEL_TEXT_CHARS).collect(),
            })
            .collect();
        let screenshot = self
            .page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await?;
        Ok(PerceivedView {
            elements,
            screenshot,
        })
    }

    async fn dispatch(&mut self, action: &Action, target: Option<&Element>) -> DriverResult<()> {
        if let Some(label) = action.label() {
            if target.is_none() {
                return Err(DriverError::StaleLabel(label));
            }
        }
        match action {
            Action::Click { label } => {
                self.element(*label).await?.click().await?;
            }
            Action::Type { label, text } => {
                self.page
                    .evaluate(format!(
                        "(() => {{ const el = document.querySelector('{}'); if (el) el.value = ''; return true; }})()",
                        Self::selector(*label).replace('\'', "\\'")
                    ))
                    .await?;
                let element = self.element(*label).await?;
                element.click().await?;
                element.type_str(text).await?;
                element.press_key("Enter").await?;
            }
            Action::Scroll { target, direction } => self.scroll(target, *direction).await?,
            Action::KeyPress { key } => {
                self.page
                    .find_element("body")
                    .await?
                    .press_key(key.browser_name())
                    .await?;
            }
            Action::GoBack => {
                self.page.evaluate("history.back(); true").await?;
            }
            Action::Wait => {}
            Action::Answer { .. } => {
                return Err(DriverError::Unsupported(action.to_string()));
            }
        }
        Ok(())
    }

    async fn remove_overlays(&mut self) -> DriverResult<()> {
        self.page.evaluate(CLEAR_OVERLAYS_SCRIPT).await?;
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        if let Err(e) = self.browser.wait().await {
            debug!(error = %e, "browser wait failed");
        }
        self.handler.abort();
        Ok(())
    }
}

impl Drop for ChromeDriver {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl From<CdpError> for DriverError {
    fn from(err: CdpError) -> Self {
        DriverError::Browser(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_format() {
        assert_eq!(ChromeDriver::selector(7), "[data-uv-label=\"7\"]");
    }

    #[test]
    fn test_default_options() {
        let options = ChromeOptions::default();
        assert!(options.headless);
        assert_eq!(options.window, (1280, 900));
        assert!(!options.headless(false).headless);
    }

    #[test]
    fn test_label_script_marks_elements() {
        assert!(LABEL_SCRIPT.contains("data-uv-label"));
        assert!(LABEL_SCRIPT.contains("uv-label"));
        assert!(CLEAR_OVERLAYS_SCRIPT.contains(".uv-label"));
    }
}
