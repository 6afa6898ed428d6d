//! Configuration types for a capture job.
//!
//! Two kinds of configuration exist and they are kept apart on purpose:
//!
//! * [`CaptureConfig`]: everything that changes the *output*. It is hashed
//!   into the [`crate::cache::CacheKey`], so two jobs with equal
//!   `CaptureConfig` (and equal tiler/OCR policy versions) must produce
//!   byte-identical artifacts.
//!
//! * [`PipelineSettings`]: operational knobs (timeouts, concurrency bounds,
//!   retry budgets). These affect how fast and how robustly a job runs, not
//!   what it produces, so they stay out of the cache key. The exception is
//!   [`TilerConfig`], whose geometry is part of the key.

use crate::error::CaptureError;
use crate::policy::PolicyName;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Browser viewport in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 2000,
        }
    }
}

/// `prefers-color-scheme` emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorScheme {
    #[default]
    Light,
    Dark,
    NoPreference,
}

/// Immutable description of one capture job.
///
/// Built via [`CaptureConfig::builder()`].
///
/// # Example
/// ```rust
/// use mdwb_capture::CaptureConfig;
///
/// let config = CaptureConfig::builder("https://example.com/docs")
///     .viewport(1280, 2000)
///     .overlap_px(120)
///     .mask_selector(".ad-slot")
///     .build()
///     .unwrap();
/// assert_eq!(config.scroll_step(), 1880);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Absolute http(s) URL of the page.
    pub url: String,

    /// Viewport in CSS pixels. Default: 1280×2000.
    pub viewport: Viewport,

    /// Device pixel ratio. Default: 2.0.
    ///
    /// Frames are captured in device pixels, so a 1280×2000 viewport at DPR 2
    /// yields 2560×4000 frames before the tiler downscales them.
    pub device_scale_factor: f32,

    /// Emulated color scheme. Default: light.
    pub color_scheme: ColorScheme,

    /// Force `prefers-reduced-motion: reduce`. Default: true.
    pub reduced_motion: bool,

    /// Freeze CSS animations and transitions. Default: true.
    pub disable_animations: bool,

    /// Selectors rendered as flat placeholders before every capture.
    pub mask_selectors: Vec<String>,

    /// Selectors removed from the page entirely (cookie banners, chat widgets).
    pub blocklist_selectors: Vec<String>,

    /// Upper bound on sweep steps. Default: 40.
    pub max_steps: u32,

    /// Network/animation settle delay before each capture. Default: 350 ms.
    pub settle_delay_ms: u64,

    /// Vertical overlap between consecutive viewports in CSS px. Default: 120.
    pub overlap_px: u32,

    /// Label of the rendering engine build, e.g. `chromium-126.0.6478.0`.
    pub renderer_version: String,
}

impl CaptureConfig {
    /// Create a new builder for `CaptureConfig`.
    pub fn builder(url: impl Into<String>) -> CaptureConfigBuilder {
        CaptureConfigBuilder {
            config: CaptureConfig {
                url: url.into(),
                viewport: Viewport::default(),
                device_scale_factor: 2.0,
                color_scheme: ColorScheme::default(),
                reduced_motion: true,
                disable_animations: true,
                mask_selectors: Vec::new(),
                blocklist_selectors: Vec::new(),
                max_steps: 40,
                settle_delay_ms: 350,
                overlap_px: 120,
                renderer_version: "chromium-unknown".to_string(),
            },
        }
    }

    /// Distance the sweep scrolls between captures: `viewport_height − overlap_px`.
    pub fn scroll_step(&self) -> u32 {
        self.viewport.height.saturating_sub(self.overlap_px).max(1)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Determinism controls the driver applies before every capture.
    pub fn determinism_controls(&self) -> DeterminismControls {
        DeterminismControls {
            color_scheme: self.color_scheme,
            reduced_motion: self.reduced_motion,
            disable_animations: self.disable_animations,
            mask_selectors: self.mask_selectors.clone(),
            blocklist_selectors: self.blocklist_selectors.clone(),
        }
    }
}

/// Builder for [`CaptureConfig`].
#[derive(Debug)]
pub struct CaptureConfigBuilder {
    config: CaptureConfig,
}

impl CaptureConfigBuilder {
    pub fn viewport(mut self, width: u32, height: u32) -> Self {
        self.config.viewport = Viewport {
            width: width.max(1),
            height: height.max(1),
        };
        self
    }

    pub fn device_scale_factor(mut self, dpr: f32) -> Self {
        self.config.device_scale_factor = dpr.clamp(0.5, 4.0);
        self
    }

    pub fn color_scheme(mut self, scheme: ColorScheme) -> Self {
        self.config.color_scheme = scheme;
        self
    }

    pub fn reduced_motion(mut self, v: bool) -> Self {
        self.config.reduced_motion = v;
        self
    }

    pub fn disable_animations(mut self, v: bool) -> Self {
        self.config.disable_animations = v;
        self
    }

    pub fn mask_selector(mut self, selector: impl Into<String>) -> Self {
        self.config.mask_selectors.push(selector.into());
        self
    }

    pub fn blocklist_selector(mut self, selector: impl Into<String>) -> Self {
        self.config.blocklist_selectors.push(selector.into());
        self
    }

    pub fn max_steps(mut self, n: u32) -> Self {
        self.config.max_steps = n.max(1);
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.settle_delay_ms = ms;
        self
    }

    pub fn overlap_px(mut self, px: u32) -> Self {
        self.config.overlap_px = px;
        self
    }

    pub fn renderer_version(mut self, version: impl Into<String>) -> Self {
        self.config.renderer_version = version.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<CaptureConfig, CaptureError> {
        let c = &self.config;
        let parsed = url::Url::parse(&c.url)
            .map_err(|e| CaptureError::InvalidConfig(format!("URL '{}': {}", c.url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https" | "file") {
            return Err(CaptureError::InvalidConfig(format!(
                "URL scheme must be http, https or file, got '{}'",
                parsed.scheme()
            )));
        }
        if c.overlap_px >= c.viewport.height {
            return Err(CaptureError::InvalidConfig(format!(
                "overlap_px ({}) must be smaller than the viewport height ({})",
                c.overlap_px, c.viewport.height
            )));
        }
        if c.renderer_version.trim().is_empty() {
            return Err(CaptureError::InvalidConfig(
                "renderer_version must not be empty".into(),
            ));
        }
        let mut config = self.config;
        // Selector order carries no meaning; sorting keeps the cache key canonical.
        config.mask_selectors.sort();
        config.mask_selectors.dedup();
        config.blocklist_selectors.sort();
        config.blocklist_selectors.dedup();
        Ok(config)
    }
}

/// Render-stability switches handed to [`crate::driver::RenderDriver::apply_controls`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterminismControls {
    pub color_scheme: ColorScheme,
    pub reduced_motion: bool,
    pub disable_animations: bool,
    pub mask_selectors: Vec<String>,
    pub blocklist_selectors: Vec<String>,
}

/// Tile geometry. Participates in the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilerConfig {
    /// Longest tile side after downscaling, in pixels. Default: 1288.
    ///
    /// Matches the input resolution olmOCR-class models are trained on;
    /// larger tiles get resized server-side anyway, at a cost in latency.
    pub target_long_side: u32,

    /// Overlap between chunks when a single frame is split, in source pixels.
    /// Default: 240.
    pub overlap_px: u32,

    /// Frames taller than this (source pixels) are split into several tiles.
    /// Default: 4096.
    pub max_frame_height: u32,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            target_long_side: 1288,
            overlap_px: 240,
            max_frame_height: 4096,
        }
    }
}

/// OCR dispatch knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrSettings {
    /// Primary policy. Its fallback pointer decides what happens next.
    pub policy: PolicyName,

    /// Lower bound (and starting value) of the AIMD window. Default: 2.
    pub min_concurrency: usize,

    /// Upper bound of the AIMD window. Default: 8.
    pub max_concurrency: usize,

    /// The window only grows while batch p95 latency stays below this. Default: 8 s.
    pub target_p95_ms: u64,

    /// Attempts per policy before falling back. Default: 3.
    pub max_attempts: u32,

    /// Initial retry delay (exponential backoff). Default: 500 ms.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s, capped at
    /// `max_backoff_ms`.
    pub retry_backoff_ms: u64,

    /// Backoff ceiling. Default: 10 s.
    pub max_backoff_ms: u64,

    /// Per-request timeout. Default: 60 s.
    pub request_timeout_ms: u64,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            policy: PolicyName::OlmOcrFp8,
            min_concurrency: 2,
            max_concurrency: 8,
            target_p95_ms: 8_000,
            max_attempts: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 10_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl OcrSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn target_p95(&self) -> Duration {
        Duration::from_millis(self.target_p95_ms)
    }

    /// Backoff before the given attempt on a policy (1-indexed; attempt 1 waits nothing).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 2);
        Duration::from_millis(
            self.retry_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Operational settings for [`crate::job::Pipeline`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub tiler: TilerConfig,
    pub ocr: OcrSettings,
    pub stitch: crate::pipeline::stitch::StitchOptions,
    pub dedup: crate::pipeline::dedup::DedupConfig,

    /// Per-step capture timeout (scroll + settle + screenshot). Default: 30 s.
    pub step_timeout_ms: u64,

    /// Whole-job deadline. Default: 10 min.
    pub job_timeout_ms: u64,

    /// Append the DOM/OCR links table to the Markdown. Default: true.
    pub links_appendix: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tiler: TilerConfig::default(),
            ocr: OcrSettings::default(),
            stitch: Default::default(),
            dedup: Default::default(),
            step_timeout_ms: 30_000,
            job_timeout_ms: 600_000,
            links_appendix: true,
        }
    }
}

impl PipelineSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.ocr.min_concurrency == 0 {
            return Err(CaptureError::InvalidConfig(
                "min_concurrency must be ≥ 1".into(),
            ));
        }
        if self.ocr.max_concurrency < self.ocr.min_concurrency {
            return Err(CaptureError::InvalidConfig(format!(
                "max_concurrency ({}) must be ≥ min_concurrency ({})",
                self.ocr.max_concurrency, self.ocr.min_concurrency
            )));
        }
        if self.ocr.max_attempts == 0 {
            return Err(CaptureError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if self.tiler.target_long_side < 64 {
            return Err(CaptureError::InvalidConfig(format!(
                "target_long_side must be ≥ 64, got {}",
                self.tiler.target_long_side
            )));
        }
        if self.tiler.overlap_px >= self.tiler.max_frame_height {
            return Err(CaptureError::InvalidConfig(
                "tiler overlap must be smaller than max_frame_height".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let c = CaptureConfig::builder("https://example.com").build().unwrap();
        assert_eq!(c.viewport.height, 2000);
        assert_eq!(c.overlap_px, 120);
        assert_eq!(c.scroll_step(), 1880);
        assert!(c.reduced_motion);
    }

    #[test]
    fn rejects_bad_url() {
        assert!(CaptureConfig::builder("not a url").build().is_err());
        assert!(CaptureConfig::builder("ftp://example.com/x").build().is_err());
    }

    #[test]
    fn rejects_overlap_larger_than_viewport() {
        let r = CaptureConfig::builder("https://example.com")
            .viewport(800, 600)
            .overlap_px(600)
            .build();
        assert!(matches!(r, Err(CaptureError::InvalidConfig(_))));
    }

    #[test]
    fn selectors_are_canonicalised() {
        let a = CaptureConfig::builder("https://example.com")
            .mask_selector(".clock")
            .mask_selector(".ad")
            .build()
            .unwrap();
        let b = CaptureConfig::builder("https://example.com")
            .mask_selector(".ad")
            .mask_selector(".clock")
            .mask_selector(".ad")
            .build()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = OcrSettings {
            retry_backoff_ms: 500,
            max_backoff_ms: 1500,
            ..Default::default()
        };
        assert_eq!(s.backoff_for(1), Duration::ZERO);
        assert_eq!(s.backoff_for(2), Duration::from_millis(500));
        assert_eq!(s.backoff_for(3), Duration::from_millis(1000));
        assert_eq!(s.backoff_for(4), Duration::from_millis(1500));
    }

    #[test]
    fn settings_validation() {
        let mut s = PipelineSettings::default();
        assert!(s.validate().is_ok());
        s.ocr.max_concurrency = 1;
        s.ocr.min_concurrency = 4;
        assert!(s.validate().is_err());
    }
}
