//! Error types for the mdwb-capture library.
//!
//! Like every stage boundary in this crate, errors come in two flavours:
//!
//! * [`CaptureError`] is **fatal**: the job cannot complete at all (first
//!   frame never captured, whole-job timeout, cancellation, storage failure
//!   while finalizing). Returned as `Err(CaptureError)` from
//!   [`crate::job::Pipeline::run`].
//!
//! * [`TileError`] is **non-fatal**: one tile could not be sliced or
//!   recognized. Stored inside [`crate::pipeline::ocr::OcrResult`] and the
//!   manifest warning list; the job continues and is marked degraded.
//!
//! [`RecognitionError`] and [`StoreError`] are the typed signals returned by
//! the two external collaborators (recognition service, artifact store).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the capture pipeline.
///
/// Tile-level failures use [`TileError`] and are recorded in the manifest
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum CaptureError {
    // ── Capture errors ────────────────────────────────────────────────────
    /// The very first viewport frame could not be captured.
    #[error("Capture failed for '{url}': {detail}")]
    CaptureFailed { url: String, detail: String },

    /// The rendering driver could not load the page at all.
    #[error("Navigation to '{url}' failed: {detail}")]
    NavigationFailed { url: String, detail: String },

    // ── Job-level errors ──────────────────────────────────────────────────
    /// The whole-job deadline elapsed; all in-flight work was cancelled.
    #[error("Job timed out after {}s", .elapsed.as_secs())]
    JobTimeout { elapsed: Duration },

    /// The job was cancelled by its owner.
    #[error("Job cancelled during {stage}")]
    Cancelled { stage: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Persisting the manifest or artifacts failed at Finalizing.
    #[error("Failed to persist artifacts for cache key {key}: {source}")]
    StorageWriteFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Reading a cached manifest failed.
    #[error("Failed to read cached artifacts for key {key}: {source}")]
    StorageReadFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CaptureError {
    /// Stable taxonomy code recorded in manifests and progress events.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::CaptureFailed { .. } | CaptureError::NavigationFailed { .. } => {
                "CAPTURE_FAILED"
            }
            CaptureError::JobTimeout { .. } => "JOB_TIMEOUT",
            CaptureError::Cancelled { .. } => "CANCELLED",
            CaptureError::StorageWriteFailed { .. } => "STORAGE_WRITE_FAILED",
            CaptureError::StorageReadFailed { .. } => "STORAGE_READ_FAILED",
            CaptureError::InvalidConfig(_) => "INVALID_CONFIG",
            CaptureError::Internal(_) => "INTERNAL",
        }
    }
}

/// A non-fatal error for a single tile.
///
/// Stored alongside [`crate::pipeline::ocr::OcrResult`] when a tile fails.
/// The job continues; the tile becomes a placeholder block.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum TileError {
    /// The frame (or a chunk of it) was undecodable or degenerate after scaling.
    #[error("Frame {frame}: tile geometry invalid: {detail}")]
    GeometryInvalid { frame: usize, detail: String },

    /// Every policy in the fallback chain was exhausted.
    #[error("Tile {tile}: OCR failed after {attempts} attempts: {detail}")]
    OcrFailed {
        tile: usize,
        attempts: u32,
        detail: String,
    },

    /// No policy accepts a tile of this size.
    #[error("Tile {tile}: {width}x{height} exceeds every policy's accepted dimensions")]
    TooLarge { tile: usize, width: u32, height: u32 },
}

/// Signal returned by a [`crate::recognizer::RecognitionService`].
///
/// The OCR engine's control loop depends on telling these apart: rate limits
/// and timeouts shrink the concurrency window, transient errors are retried,
/// rejections skip straight to the fallback policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecognitionError {
    /// HTTP 429 or equivalent; honour `retry_after` when present.
    #[error("rate limited by '{endpoint}'")]
    RateLimited {
        endpoint: String,
        retry_after: Option<Duration>,
    },

    /// The request exceeded its deadline.
    #[error("request timed out after {}ms", .elapsed.as_millis())]
    Timeout { elapsed: Duration },

    /// 5xx, connection reset, malformed body: worth another attempt.
    #[error("transient recognition error: {0}")]
    Transient(String),

    /// 4xx or policy constraint violation: retrying the same policy won't help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RecognitionError {
    /// True for the signals that halve the AIMD window.
    pub fn is_throttle(&self) -> bool {
        matches!(
            self,
            RecognitionError::RateLimited { .. } | RecognitionError::Timeout { .. }
        )
    }

    /// True when another attempt against the same policy may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RecognitionError::Rejected(_))
    }
}

/// Errors from an [`crate::store::ArtifactStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes_match_taxonomy() {
        let e = CaptureError::CaptureFailed {
            url: "https://example.com".into(),
            detail: "blank frame".into(),
        };
        assert_eq!(e.code(), "CAPTURE_FAILED");
        assert_eq!(
            CaptureError::JobTimeout {
                elapsed: Duration::from_secs(5)
            }
            .code(),
            "JOB_TIMEOUT"
        );
        assert_eq!(
            CaptureError::Cancelled {
                stage: "Recognizing".into()
            }
            .code(),
            "CANCELLED"
        );
    }

    #[test]
    fn job_timeout_display() {
        let e = CaptureError::JobTimeout {
            elapsed: Duration::from_secs(90),
        };
        assert!(e.to_string().contains("90s"), "got: {e}");
    }

    #[test]
    fn storage_write_failed_keeps_source() {
        let e = CaptureError::StorageWriteFailed {
            key: "abc".into(),
            source: StoreError::Backend("disk full".into()),
        };
        assert_eq!(e.code(), "STORAGE_WRITE_FAILED");
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn throttle_signals() {
        assert!(RecognitionError::RateLimited {
            endpoint: "x".into(),
            retry_after: None
        }
        .is_throttle());
        assert!(RecognitionError::Timeout {
            elapsed: Duration::from_millis(10)
        }
        .is_throttle());
        assert!(!RecognitionError::Transient("503".into()).is_throttle());
        assert!(!RecognitionError::Rejected("400".into()).is_retryable());
    }

    #[test]
    fn tile_error_display() {
        let e = TileError::OcrFailed {
            tile: 2,
            attempts: 6,
            detail: "503".into(),
        };
        assert!(e.to_string().contains("Tile 2"));
        assert!(e.to_string().contains("6 attempts"));
    }
}
