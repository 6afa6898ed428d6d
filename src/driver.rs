//! Rendering driver capability.
//!
//! The browser is a stateful external dependency. The sweep controller only
//! talks to it through [`RenderDriver`], so scroll/retry policy is testable
//! against a scripted fake and the protocol-level work (CDP, CSS injection,
//! animation freezing) lives entirely behind the trait.
//!
//! [`StaticPageDriver`] replays an already rendered full-page PNG as if it
//! were a live viewport. It is deterministic by construction and is what the
//! `mdwb replay` command and the integration tests drive.

use crate::config::{CaptureConfig, DeterminismControls};
use crate::pipeline::encode::encode_png;
use async_trait::async_trait;
use image::{imageops, RgbaImage};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Failure reported by a driver call.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

/// A mask or blocklist selector the driver could not apply.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskFailure {
    pub selector: String,
    pub reason: String,
}

/// What one screenshot call returns.
#[derive(Debug, Clone)]
pub struct FrameCapture {
    /// Encoded image (PNG) of the current viewport.
    pub png: Vec<u8>,
    /// Scroll offset the browser actually reports, in CSS px.
    pub scroll_y: u32,
    /// `document.scrollingElement.scrollHeight` at capture time, in CSS px.
    pub document_height: u32,
}

/// Browser capabilities the sweep controller needs.
#[async_trait]
pub trait RenderDriver: Send {
    /// Load the page and wait for the initial network idle.
    async fn navigate(&mut self, config: &CaptureConfig) -> Result<(), DriverError>;

    /// Apply color scheme, motion and mask/blocklist controls.
    ///
    /// Selectors that fail are reported, not fatal.
    async fn apply_controls(&mut self, controls: &DeterminismControls) -> Vec<MaskFailure>;

    /// Scroll to `y` (CSS px) and return the offset the browser settled on.
    async fn scroll_to(&mut self, y: u32) -> Result<u32, DriverError>;

    /// Screenshot the viewport at the current offset.
    async fn capture_frame(&mut self) -> Result<FrameCapture, DriverError>;

    /// Re-measure the document height without capturing.
    async fn document_height(&mut self) -> Result<u32, DriverError>;

    /// Serialised DOM of the page as rendered.
    async fn snapshot_dom(&mut self) -> Result<String, DriverError>;
}

/// Replays a full-page screenshot as a scrollable viewport.
pub struct StaticPageDriver {
    page: RgbaImage,
    dom: String,
    viewport_height: u32,
    pixel_ratio: f32,
    scroll_y: u32,
}

impl StaticPageDriver {
    /// Wrap an in-memory full-page image (device pixels).
    pub fn new(page: RgbaImage, dom: impl Into<String>) -> Self {
        Self {
            page,
            dom: dom.into(),
            viewport_height: 0,
            pixel_ratio: 1.0,
            scroll_y: 0,
        }
    }

    /// Load a full-page PNG/JPEG from disk.
    pub fn from_file(path: &Path, dom: impl Into<String>) -> Result<Self, DriverError> {
        let img = image::open(path)
            .map_err(|e| DriverError(format!("cannot open '{}': {}", path.display(), e)))?;
        Ok(Self::new(img.to_rgba8(), dom))
    }

    fn document_height_css(&self) -> u32 {
        (self.page.height() as f32 / self.pixel_ratio).round() as u32
    }

    fn max_scroll(&self) -> u32 {
        self.document_height_css()
            .saturating_sub(self.viewport_height)
    }
}

#[async_trait]
impl RenderDriver for StaticPageDriver {
    async fn navigate(&mut self, config: &CaptureConfig) -> Result<(), DriverError> {
        self.viewport_height = config.viewport.height;
        self.pixel_ratio = config.device_scale_factor;
        self.scroll_y = 0;
        if self.page.width() == 0 || self.page.height() == 0 {
            return Err(DriverError("page image is empty".into()));
        }
        debug!(
            "Static page {}x{} px, DPR {}",
            self.page.width(),
            self.page.height(),
            self.pixel_ratio
        );
        Ok(())
    }

    async fn apply_controls(&mut self, _controls: &DeterminismControls) -> Vec<MaskFailure> {
        // Masks were applied when the page image was recorded.
        Vec::new()
    }

    async fn scroll_to(&mut self, y: u32) -> Result<u32, DriverError> {
        self.scroll_y = y.min(self.max_scroll());
        Ok(self.scroll_y)
    }

    async fn capture_frame(&mut self) -> Result<FrameCapture, DriverError> {
        let top = (self.scroll_y as f32 * self.pixel_ratio).round() as u32;
        let wanted = (self.viewport_height as f32 * self.pixel_ratio).round() as u32;
        let height = wanted.min(self.page.height().saturating_sub(top));
        if height == 0 {
            return Err(DriverError(format!("scroll offset {} is past the page", self.scroll_y)));
        }
        let view = imageops::crop_imm(&self.page, 0, top, self.page.width(), height).to_image();
        let png = encode_png(&view).map_err(|e| DriverError(e.to_string()))?;
        Ok(FrameCapture {
            png,
            scroll_y: self.scroll_y,
            document_height: self.document_height_css(),
        })
    }

    async fn document_height(&mut self) -> Result<u32, DriverError> {
        Ok(self.document_height_css())
    }

    async fn snapshot_dom(&mut self) -> Result<String, DriverError> {
        Ok(self.dom.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn config(vh: u32) -> CaptureConfig {
        CaptureConfig::builder("https://example.com")
            .viewport(100, vh)
            .overlap_px(10)
            .device_scale_factor(1.0)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn scroll_clamps_to_bottom() {
        let mut d = StaticPageDriver::new(RgbaImage::from_pixel(100, 250, Rgba([255; 4])), "");
        d.navigate(&config(100)).await.unwrap();
        assert_eq!(d.scroll_to(90).await.unwrap(), 90);
        assert_eq!(d.scroll_to(400).await.unwrap(), 150);
        let frame = d.capture_frame().await.unwrap();
        assert_eq!(frame.scroll_y, 150);
        assert_eq!(frame.document_height, 250);
        let img = image::load_from_memory(&frame.png).unwrap();
        assert_eq!(img.height(), 100);
    }

    #[tokio::test]
    async fn short_page_yields_short_frame() {
        let mut d = StaticPageDriver::new(RgbaImage::from_pixel(100, 60, Rgba([0, 0, 0, 255])), "<p>x</p>");
        d.navigate(&config(100)).await.unwrap();
        d.scroll_to(0).await.unwrap();
        let frame = d.capture_frame().await.unwrap();
        assert_eq!(image::load_from_memory(&frame.png).unwrap().height(), 60);
        assert_eq!(d.snapshot_dom().await.unwrap(), "<p>x</p>");
    }
}
