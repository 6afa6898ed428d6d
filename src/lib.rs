//! # mdwb-capture
//!
//! Turn a rendered web page into deterministic, provenance-annotated Markdown.
//!
//! ## Why this crate?
//!
//! HTML-to-Markdown converters read the DOM, and the DOM of a modern page is
//! a poor witness of what a reader actually sees: client-side rendering,
//! canvas text, shadow roots, lazy sections. Instead this crate sweeps the
//! page viewport by viewport, slices the screenshots into OCR-sized tiles and
//! lets an OCR model read them. Overlap between viewports is verified on the
//! pixels, duplicated text is trimmed, and every emitted block can be traced
//! back to the exact tile region it came from.
//!
//! ## Pipeline Overview
//!
//! ```text
//! page
//!  │
//!  ├─ 1. Capture    scroll sweep through a RenderDriver (sequential)
//!  ├─ 2. Tile       downscale + split frames, SHA-256 per tile
//!  ├─ 3. OCR        concurrent recognition, AIMD window, retry + fallback
//!  ├─ 4. Stitch     SSIM seam check, overlap trim, provenance
//!  ├─ 5. Dedup      exact hash + near-duplicate embedding pass
//!  └─ 6. Finalize   Markdown + links appendix + manifest → ArtifactStore
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mdwb_capture::{
//!     cancel_pair, CaptureConfig, HttpRecognizer, Pipeline, PolicyTable, StaticPageDriver,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Endpoints from MDWB_OCR_*_URL, bearer key from MDWB_OCR_API_KEY
//!     let recognizer = HttpRecognizer::from_env(Duration::from_secs(60))?;
//!     let pipeline = Pipeline::new(Arc::new(recognizer)).with_policies(PolicyTable::from_env());
//!
//!     let config = CaptureConfig::builder("https://example.com").build()?;
//!     let mut driver = StaticPageDriver::from_file(Path::new("page.png"), "")?;
//!     let (_handle, cancel) = cancel_pair();
//!
//!     let report = pipeline.run(&config, &mut driver, &cancel).await?;
//!     println!("{}", report.markdown());
//!     if report.degraded() {
//!         for w in &report.manifest.warnings {
//!             eprintln!("warning: {w}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mdwb` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! mdwb-capture = { version = "0.3", default-features = false }
//! ```
//!
//! ## OCR Policies
//!
//! | Policy | Max tile side | Precision | Ceiling | Fallback |
//! |--------|---------------|-----------|---------|----------|
//! | `olmocr-fp8`  | 1288 px | fp8  | 8 | `olmocr-bf16` |
//! | `olmocr-bf16` | 1288 px | bf16 | 4 | none |
//! | `glm-ocr`     | 2048 px | bf16 | 4 | `olmocr-bf16` |
//!
//! A completed job is either `Complete` or `Degraded`; always check
//! [`JobManifest::degraded`] and the warning list before trusting the output.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod cancel;
pub mod config;
pub mod driver;
pub mod error;
pub mod job;
pub mod manifest;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod prompts;
pub mod recognizer;
pub mod similarity;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::CacheKey;
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{CaptureConfig, CaptureConfigBuilder, OcrSettings, PipelineSettings, TilerConfig};
pub use driver::{RenderDriver, StaticPageDriver};
pub use error::{CaptureError, RecognitionError, StoreError, TileError};
pub use job::{JobReport, JobState, Pipeline};
pub use manifest::{JobManifest, ManifestWarning, WarningCode};
pub use pipeline::ocr::OcrLimiter;
pub use policy::{OcrPolicy, PolicyName, PolicyTable};
pub use progress::{NoopProgress, ProgressSink};
pub use recognizer::{HttpRecognizer, RecognitionService, VisionRecognizer};
pub use store::{ArtifactStore, FsStore, MemoryStore};
pub use stream::{event_channel, ChannelProgressSink, EventStream, ProgressEvent};
