//! Pipeline stages for page-capture-to-Markdown conversion.
//!
//! Each submodule implements exactly one transformation step and can be
//! tested on its own against fakes; [`crate::job::Pipeline`] wires them
//! together.
//!
//! ## Data Flow
//!
//! ```text
//! capture ──▶ tile ──▶ ocr ──▶ stitch ──▶ dedup ──▶ links
//! (sweep)   (slice)  (AIMD)   (SSIM)     (hash+    (DOM
//!                                         cosine)   appendix)
//! ```
//!
//! 1. [`capture`] drives the render driver through a scroll sweep; the only
//!    stage that talks to the browser, strictly sequential
//! 2. [`tile`] scales and splits frames into OCR-sized tiles, hashing each
//! 3. [`ocr`] dispatches tiles concurrently under an AIMD window with retry
//!    and policy fallback; the only stage with network I/O
//! 4. [`stitch`] verifies seams, trims overlap text, attaches provenance
//! 5. [`dedup`] drops exact and near-duplicate blocks
//! 6. [`links`] merges DOM anchors with OCR-visible links
//!
//! [`encode`] and [`postprocess`] are shared helpers (PNG/hash encoding and
//! Markdown cleanup rules).

pub mod capture;
pub mod dedup;
pub mod encode;
pub mod links;
pub mod ocr;
pub mod postprocess;
pub mod stitch;
pub mod tile;
