//! Streaming view of job progress.
//!
//! [`event_channel`] returns a [`ChannelProgressSink`] to hand to the
//! pipeline and an [`EventStream`] that yields the same events as
//! [`ProgressEvent`] values, in emission order. The stream ends once every
//! clone of the sink is dropped.

use crate::job::JobState;
use crate::manifest::ManifestWarning;
use crate::policy::PolicyName;
use crate::progress::ProgressSink;
use serde::Serialize;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

/// One job event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobStarted { job_id: Uuid, cache_key: String },
    Stage { state: JobState },
    FramesCaptured { frames: usize },
    TilesReady { tiles: usize },
    TileRecognized { tile: usize, total: usize, policy: PolicyName, attempts: u32 },
    TileFailed { tile: usize, total: usize, error: String },
    Warning { warning: ManifestWarning },
    Finished { state: JobState, degraded: bool },
}

/// A boxed stream of progress events.
pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// [`ProgressSink`] that forwards every event into a channel.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    fn send(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

/// Create a connected sink/stream pair.
pub fn event_channel() -> (ChannelProgressSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelProgressSink { tx },
        Box::pin(UnboundedReceiverStream::new(rx)),
    )
}

impl ProgressSink for ChannelProgressSink {
    fn on_job_start(&self, job_id: Uuid, cache_key: &str) {
        self.send(ProgressEvent::JobStarted {
            job_id,
            cache_key: cache_key.to_string(),
        });
    }

    fn on_stage(&self, state: JobState) {
        self.send(ProgressEvent::Stage { state });
    }

    fn on_frames_captured(&self, frames: usize) {
        self.send(ProgressEvent::FramesCaptured { frames });
    }

    fn on_tiles_ready(&self, tiles: usize) {
        self.send(ProgressEvent::TilesReady { tiles });
    }

    fn on_tile_recognized(&self, tile: usize, total: usize, policy: PolicyName, attempts: u32) {
        self.send(ProgressEvent::TileRecognized {
            tile,
            total,
            policy,
            attempts,
        });
    }

    fn on_tile_failed(&self, tile: usize, total: usize, error: &str) {
        self.send(ProgressEvent::TileFailed {
            tile,
            total,
            error: error.to_string(),
        });
    }

    fn on_warning(&self, warning: &ManifestWarning) {
        self.send(ProgressEvent::Warning {
            warning: warning.clone(),
        });
    }

    fn on_job_finished(&self, state: JobState, degraded: bool) {
        self.send(ProgressEvent::Finished { state, degraded });
    }
}
