//! Progress-callback trait for job events.
//!
//! Hand an [`Arc<dyn ProgressSink>`] to [`crate::job::Pipeline::with_progress`]
//! to observe a job as it runs: state transitions, per-tile OCR outcomes,
//! warnings as they are recorded, and the terminal state. Forward them to a
//! terminal progress bar, a channel ([`crate::stream::ChannelProgressSink`]),
//! or a job record; the library does not care.
//!
//! # Example
//!
//! ```rust
//! use mdwb_capture::{PolicyName, ProgressSink};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct TileCounter {
//!     done: AtomicUsize,
//! }
//!
//! impl ProgressSink for TileCounter {
//!     fn on_tile_recognized(&self, tile: usize, total: usize, _policy: PolicyName, _attempts: u32) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("tile {tile} ({n}/{total})");
//!     }
//! }
//! ```

use crate::job::JobState;
use crate::manifest::ManifestWarning;
use crate::policy::PolicyName;
use std::sync::Arc;
use uuid::Uuid;

/// Receives job events.
///
/// Sinks are shared across tasks, so implementations must be `Send + Sync`.
/// Every method defaults to a no-op.
pub trait ProgressSink: Send + Sync {
    /// Job accepted; the cache key is already known.
    fn on_job_start(&self, job_id: Uuid, cache_key: &str) {
        let _ = (job_id, cache_key);
    }

    /// A forward state transition.
    fn on_stage(&self, state: JobState) {
        let _ = state;
    }

    fn on_frames_captured(&self, frames: usize) {
        let _ = frames;
    }

    fn on_tiles_ready(&self, tiles: usize) {
        let _ = tiles;
    }

    /// One tile recognized.
    ///
    /// * `attempts` counts every try across policies.
    fn on_tile_recognized(&self, tile: usize, total: usize, policy: PolicyName, attempts: u32) {
        let _ = (tile, total, policy, attempts);
    }

    /// One tile given up on after the whole fallback chain.
    fn on_tile_failed(&self, tile: usize, total: usize, error: &str) {
        let _ = (tile, total, error);
    }

    fn on_warning(&self, warning: &ManifestWarning) {
        let _ = warning;
    }

    /// Terminal state reached (including `Failed`).
    fn on_job_finished(&self, state: JobState, degraded: bool) {
        let _ = (state, degraded);
    }
}

/// Default sink when nobody is listening.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

pub type SharedProgress = Arc<dyn ProgressSink>;
