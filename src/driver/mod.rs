//! UI driver capability consumed by the agent loop.
//!
//! A driver renders a target, labels its visible interactive elements with
//! positional indices, captures a screenshot and applies actions. Indices are
//! only meaningful for the [`PerceivedView`] they were captured in; every turn
//! perceives afresh.
//!
//! - [`chrome::ChromeDriver`] drives a real Chromium page
//! - [`mock::ScriptedPage`] is an in-memory page for tests

pub mod chrome;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::Action;

pub use chrome::{ChromeDriver, ChromeLauncher, ChromeOptions};
pub use mock::{DriverEvent, ScriptedPage};

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Browser process or protocol failure
    #[error("browser error: {0}")]
    Browser(String),
    /// Navigation to the target failed
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    /// The action references an element that is not in the current view
    #[error("element [{0}] is not present in the current view")]
    StaleLabel(usize),
    /// The action cannot be applied by this driver
    #[error("unsupported action: {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One labelled interactive element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub index: usize,
    pub tag: String,
    pub label_text: String,
}

/// What the agent sees in one turn: labelled elements plus a PNG rendering.
#[derive(Debug, Clone)]
pub struct PerceivedView {
    pub elements: Vec<Element>,
    pub screenshot: Vec<u8>,
}

impl PerceivedView {
    /// Resolve a label against this view.
    pub fn element(&self, index: usize) -> Option<&Element> {
        self.elements.iter().find(|e| e.index == index)
    }

    /// Text listing of the first `limit` elements, one `[i] <tag> text` per line.
    pub fn describe(&self, limit: usize) -> String {
        let mut out = String::from("Interactive elements on the page:\n");
        if self.elements.is_empty() {
            out.push_str("(none labelled; use KeyPress, Scroll [WINDOW] or Wait)\n");
        }
        for element in self.elements.iter().take(limit) {
            out.push_str(&format!(
                "[{}] <{}> {}\n",
                element.index,
                element.tag.to_lowercase(),
                element.label_text
            ));
        }
        if self.elements.len() > limit {
            out.push_str(&format!("... {} more not listed\n", self.elements.len() - limit));
        }
        out
    }
}

/// Capability to render and operate one UI target.
#[async_trait]
pub trait UiDriver: Send {
    async fn navigate(&mut self, url: &str) -> DriverResult<()>;

    /// Label visible interactive elements and capture the page.
    async fn perceive(&mut self) -> DriverResult<PerceivedView>;

    /// Apply an action. `target` is the element resolved from the view the
    /// action was decided on, `None` for window-level actions.
    async fn dispatch(&mut self, action: &Action, target: Option<&Element>) -> DriverResult<()>;

    /// Remove the label overlays drawn by [`UiDriver::perceive`].
    async fn remove_overlays(&mut self) -> DriverResult<()>;

    /// Tear down the underlying UI session.
    async fn close(&mut self) -> DriverResult<()> {
        Ok(())
    }
}

/// Creates one fresh driver per session.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self) -> DriverResult<Box<dyn UiDriver>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(n: usize) -> PerceivedView {
        PerceivedView {
            elements: (0..n)
                .map(|i| Element {
                    index: i,
                    tag: "BUTTON".to_string(),
                    label_text: format!("b{}", i),
                })
                .collect(),
            screenshot: Vec::new(),
        }
    }

    #[test]
    fn test_describe_lists_and_caps() {
        let text = view(3).describe(2);
        assert!(text.contains("[0] <button> b0"));
        assert!(text.contains("[1] <button> b1"));
        assert!(!text.contains("[2]"));
        assert!(text.contains("1 more not listed"));
    }

    #[test]
    fn test_describe_empty_view() {
        assert!(view(0).describe(40).contains("none labelled"));
    }

    #[test]
    fn test_element_resolution() {
        let v = view(2);
        assert_eq!(v.element(1).map(|e| e.label_text.as_str()), Some("b1"));
        assert!(v.element(5).is_none());
    }
}
