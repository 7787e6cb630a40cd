//! In-memory UI driver for tests.
//!
//! [`ScriptedPage`] renders its element list as one grey box per row and,
//! while overlays are shown, a red badge carrying the element's label index.
//! Every driver call lands in a shared [`DriverEvent`] log so tests can
//! assert on ordering.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use super::{DriverError, DriverFactory, DriverResult, Element, PerceivedView, UiDriver};
use crate::action::Action;

const ROW_HEIGHT: u32 = 16;
const CANVAS_WIDTH: u32 = 320;
/// Left edge of element boxes; the badge column sits before it
const BOX_LEFT: u32 = 40;
const BACKGROUND: Rgb<u8> = Rgb([245, 245, 245]);
const ELEMENT_BOX: Rgb<u8> = Rgb([190, 195, 205]);
const BADGE_BG: Rgb<u8> = Rgb([220, 30, 30]);
const BADGE_FG: Rgb<u8> = Rgb([255, 255, 255]);

/// A driver call as observed by [`ScriptedPage`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Navigated(String),
    Perceived,
    OverlaysRemoved,
    Dispatched {
        action: Action,
        target: Option<usize>,
        overlays_visible: bool,
    },
    Closed,
}

/// Scripted page with a fixed element list.
#[derive(Debug, Clone)]
pub struct ScriptedPage {
    elements: Vec<Element>,
    perceive_delay: Duration,
    overlays_visible: bool,
    events: Arc<Mutex<Vec<DriverEvent>>>,
}

impl ScriptedPage {
    pub fn new(elements: Vec<Element>) -> Self {
        Self {
            elements,
            perceive_delay: Duration::ZERO,
            overlays_visible: false,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Page with one button per label text.
    pub fn with_buttons(labels: &[&str]) -> Self {
        Self::new(
            labels
                .iter()
                .enumerate()
                .map(|(index, text)| Element {
                    index,
                    tag: "BUTTON".to_string(),
                    label_text: text.to_string(),
                })
                .collect(),
        )
    }

    /// Make every perception stall for `delay`.
    pub fn perceive_delay(mut self, delay: Duration) -> Self {
        self.perceive_delay = delay;
        self
    }

    /// Shared event log; clones of this page append to the same log.
    pub fn events(&self) -> Arc<Mutex<Vec<DriverEvent>>> {
        Arc::clone(&self.events)
    }

    fn record(&self, event: DriverEvent) {
        self.events.lock().push(event);
    }

    /// One row per element: a box as wide as its text, plus the label
    /// badge while overlays are visible.
    fn render(&self) -> DriverResult<Vec<u8>> {
        let rows = self.elements.len().max(1) as u32;
        let mut img = RgbImage::from_pixel(CANVAS_WIDTH, rows * ROW_HEIGHT + 8, BACKGROUND);
        for (row, element) in self.elements.iter().enumerate() {
            let top = 4 + row as u32 * ROW_HEIGHT;
            let width = 8 * element.label_text.chars().count() as u32 + 8;
            fill(&mut img, BOX_LEFT, top, width, ROW_HEIGHT - 2, ELEMENT_BOX);
            if self.overlays_visible {
                paint_badge(&mut img, top, element.index);
            }
        }

        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| DriverError::Browser(format!("failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }
}

#[async_trait]
impl UiDriver for ScriptedPage {
    async fn navigate(&mut self, url: &str) -> DriverResult<()> {
        self.record(DriverEvent::Navigated(url.to_string()));
        Ok(())
    }

    async fn perceive(&mut self) -> DriverResult<PerceivedView> {
        if !self.perceive_delay.is_zero() {
            tokio::time::sleep(self.perceive_delay).await;
        }
        self.overlays_visible = true;
        self.record(DriverEvent::Perceived);
        Ok(PerceivedView {
            elements: self.elements.clone(),
            screenshot: self.render()?,
        })
    }

    async fn dispatch(&mut self, action: &Action, target: Option<&Element>) -> DriverResult<()> {
        if let Some(label) = action.label() {
            if target.map(|t| t.index) != Some(label) {
                return Err(DriverError::StaleLabel(label));
            }
        }
        self.record(DriverEvent::Dispatched {
            action: action.clone(),
            target: target.map(|t| t.index),
            overlays_visible: self.overlays_visible,
        });
        Ok(())
    }

    async fn remove_overlays(&mut self) -> DriverResult<()> {
        self.overlays_visible = false;
        self.record(DriverEvent::OverlaysRemoved);
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.record(DriverEvent::Closed);
        Ok(())
    }
}

#[async_trait]
impl DriverFactory for ScriptedPage {
    async fn launch(&self) -> DriverResult<Box<dyn UiDriver>> {
        Ok(Box::new(self.clone()))
    }
}

fn fill(img: &mut RgbImage, left: u32, top: u32, width: u32, height: u32, color: Rgb<u8>) {
    for y in top..(top + height).min(img.height()) {
        for x in left..(left + width).min(img.width()) {
            img.put_pixel(x, y, color);
        }
    }
}

/// Red badge at the start of the row with the index in white digits.
fn paint_badge(img: &mut RgbImage, top: u32, index: usize) {
    let digits = index.to_string();
    fill(img, 4, top, 8 * digits.len() as u32 + 4, ROW_HEIGHT - 2, BADGE_BG);
    for (n, digit) in digits.chars().enumerate() {
        let glyph = BASIC_FONTS.get(digit).unwrap_or([0u8; 8]);
        let left = 6 + 8 * n as u32;
        for (dy, bits) in glyph.iter().enumerate() {
            // least significant bit is the leftmost pixel
            for dx in (0..8u32).filter(|dx| (bits >> dx) & 1 == 1) {
                let (x, y) = (left + dx, top + 3 + dy as u32);
                if x < img.width() && y < img.height() {
                    img.put_pixel(x, y, BADGE_FG);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_perceive_renders_png_with_elements() {
        let mut page = ScriptedPage::with_buttons(&["Start", "Reset"]);
        let view = page.perceive().await.unwrap();
        assert_eq!(view.elements.len(), 2);
        assert_eq!(&view.screenshot[1..4], b"PNG");
        let decoded = image::load_from_memory(&view.screenshot).unwrap();
        assert_eq!(decoded.width(), CANVAS_WIDTH);
    }

    #[tokio::test]
    async fn test_badges_mark_each_row() {
        let mut page = ScriptedPage::with_buttons(&["Start", "Reset"]);
        let view = page.perceive().await.unwrap();
        let img = image::load_from_memory(&view.screenshot).unwrap().to_rgb8();
        assert_eq!(img.height(), 2 * ROW_HEIGHT + 8);
        for row in 0..2 {
            let top = 4 + row * ROW_HEIGHT;
            assert_eq!(*img.get_pixel(4, top), BADGE_BG);
            assert_eq!(*img.get_pixel(BOX_LEFT, top), ELEMENT_BOX);
        }
        assert_eq!(*img.get_pixel(CANVAS_WIDTH - 1, 4), BACKGROUND);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unresolved_label() {
        let mut page = ScriptedPage::with_buttons(&["Start"]);
        let err = page.dispatch(&Action::Click { label: 4 }, None).await.unwrap_err();
        assert!(matches!(err, DriverError::StaleLabel(4)));
    }

    #[tokio::test]
    async fn test_events_are_shared_between_clones() {
        let page = ScriptedPage::with_buttons(&["Start"]);
        let log = page.events();
        let mut launched = page.launch().await.unwrap();
        launched.navigate("http://localhost/").await.unwrap();
        launched.remove_overlays().await.unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                DriverEvent::Navigated("http://localhost/".to_string()),
                DriverEvent::OverlaysRemoved
            ]
        );
    }
}
