//! The externally visible job summary.
//!
//! A [`JobManifest`] is built append-only through [`ManifestBuilder`] while
//! the job runs and frozen exactly once, at Finalizing or on a terminal
//! failure. It is what the artifact store persists and what a cache hit
//! returns verbatim.

use crate::config::{CaptureConfig, TilerConfig};
use crate::job::JobState;
use crate::pipeline::capture::ViewportFrame;
use crate::pipeline::dedup::DedupDecision;
use crate::pipeline::links::LinkRecord;
use crate::pipeline::ocr::{BatchTelemetry, OcrResult};
use crate::pipeline::stitch::{DomAssist, SeamMarker, StitchedBlock, TileSource};
use crate::pipeline::tile::Tile;
use crate::policy::PolicyName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bumped when the manifest layout changes incompatibly.
pub const MANIFEST_SCHEMA_VERSION: u32 = 3;

/// Itemised, machine-readable warning codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    SpaHeightShrink,
    SpaHeightShrinkRecovered,
    StepCapReached,
    ScrollStall,
    CaptureStepFailed,
    MaskFailed,
    DomSnapshotFailed,
    TileGeometryInvalid,
    OcrFailed,
    SeamUnstable,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningCode::SpaHeightShrink => "SPA_HEIGHT_SHRINK",
            WarningCode::SpaHeightShrinkRecovered => "SPA_HEIGHT_SHRINK_RECOVERED",
            WarningCode::StepCapReached => "STEP_CAP_REACHED",
            WarningCode::ScrollStall => "SCROLL_STALL",
            WarningCode::CaptureStepFailed => "CAPTURE_STEP_FAILED",
            WarningCode::MaskFailed => "MASK_FAILED",
            WarningCode::DomSnapshotFailed => "DOM_SNAPSHOT_FAILED",
            WarningCode::TileGeometryInvalid => "TILE_GEOMETRY_INVALID",
            WarningCode::OcrFailed => "OCR_FAILED",
            WarningCode::SeamUnstable => "SEAM_UNSTABLE",
        }
    }

    /// Whether this warning means the output is incomplete or unverified.
    ///
    /// Any degrading warning demotes a finished job to `Degraded`.
    pub fn degrades(&self) -> bool {
        !matches!(
            self,
            WarningCode::SpaHeightShrinkRecovered
                | WarningCode::MaskFailed
                | WarningCode::DomSnapshotFailed
        )
    }
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One warning entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestWarning {
    pub code: WarningCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile: Option<usize>,
}

impl ManifestWarning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            step: None,
            frame: None,
            tile: None,
        }
    }

    pub fn at_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn at_frame(mut self, frame: usize) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn at_tile(mut self, tile: usize) -> Self {
        self.tile = Some(tile);
        self
    }
}

/// `OCR_FAILED tile=2: …`
impl fmt::Display for ManifestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(step) = self.step {
            write!(f, " step={step}")?;
        }
        if let Some(frame) = self.frame {
            write!(f, " frame={frame}")?;
        }
        if let Some(tile) = self.tile {
            write!(f, " tile={tile}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Wall-clock duration of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: JobState,
    pub duration_ms: u64,
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub code: String,
    pub message: String,
    pub stage: JobState,
}

/// Frozen summary of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub schema_version: u32,
    pub job_id: Uuid,
    pub cache_key: String,
    pub config: CaptureConfig,
    pub tiler: TilerConfig,
    pub ocr_policy: PolicyName,
    pub ocr_policy_version: String,
    pub state: JobState,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    pub warnings: Vec<ManifestWarning>,
    pub frames: Vec<ViewportFrame>,
    pub tiles: Vec<Tile>,
    pub ocr: Vec<OcrResult>,
    pub ocr_batches: Vec<BatchTelemetry>,
    pub sources: Vec<TileSource>,
    pub blocks: Vec<StitchedBlock>,
    pub seams: Vec<SeamMarker>,
    /// Garbled OCR lines replaced with DOM text.
    #[serde(default)]
    pub dom_assists: Vec<DomAssist>,
    pub dedup: Vec<DedupDecision>,
    pub links: Vec<LinkRecord>,
    pub timings: Vec<StageTiming>,
    pub markdown: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobManifest {
    /// Tiles whose OCR failed for good.
    pub fn failed_tiles(&self) -> Vec<usize> {
        self.ocr
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| r.tile_index)
            .collect()
    }

    pub fn has_warning(&self, code: WarningCode) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }
}

/// Append-only accumulator behind [`JobManifest`].
#[derive(Debug)]
pub struct ManifestBuilder {
    job_id: Uuid,
    cache_key: String,
    config: CaptureConfig,
    tiler: TilerConfig,
    ocr_policy: PolicyName,
    warnings: Vec<ManifestWarning>,
    frames: Vec<ViewportFrame>,
    tiles: Vec<Tile>,
    ocr: Vec<OcrResult>,
    ocr_batches: Vec<BatchTelemetry>,
    sources: Vec<TileSource>,
    blocks: Vec<StitchedBlock>,
    seams: Vec<SeamMarker>,
    dom_assists: Vec<DomAssist>,
    dedup: Vec<DedupDecision>,
    links: Vec<LinkRecord>,
    timings: Vec<StageTiming>,
    created_at: DateTime<Utc>,
}

impl ManifestBuilder {
    pub fn new(
        job_id: Uuid,
        cache_key: impl Into<String>,
        config: CaptureConfig,
        tiler: TilerConfig,
        ocr_policy: PolicyName,
    ) -> Self {
        Self {
            job_id,
            cache_key: cache_key.into(),
            config,
            tiler,
            ocr_policy,
            warnings: Vec::new(),
            frames: Vec::new(),
            tiles: Vec::new(),
            ocr: Vec::new(),
            ocr_batches: Vec::new(),
            sources: Vec::new(),
            blocks: Vec::new(),
            seams: Vec::new(),
            dom_assists: Vec::new(),
            dedup: Vec::new(),
            links: Vec::new(),
            timings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn warnings(&self) -> &[ManifestWarning] {
        &self.warnings
    }

    pub fn warn(&mut self, warning: ManifestWarning) {
        self.warnings.push(warning);
    }

    pub fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = ManifestWarning>) {
        self.warnings.extend(warnings);
    }

    pub fn record_timing(&mut self, stage: JobState, duration_ms: u64) {
        self.timings.push(StageTiming { stage, duration_ms });
    }

    pub fn add_frames(&mut self, frames: impl IntoIterator<Item = ViewportFrame>) {
        self.frames.extend(frames);
    }

    pub fn add_tiles(&mut self, tiles: impl IntoIterator<Item = Tile>) {
        self.tiles.extend(tiles);
    }

    pub fn add_ocr(
        &mut self,
        results: impl IntoIterator<Item = OcrResult>,
        batches: impl IntoIterator<Item = BatchTelemetry>,
    ) {
        self.ocr.extend(results);
        self.ocr_batches.extend(batches);
    }

    pub fn add_stitch(
        &mut self,
        sources: impl IntoIterator<Item = TileSource>,
        seams: impl IntoIterator<Item = SeamMarker>,
        dom_assists: impl IntoIterator<Item = DomAssist>,
    ) {
        self.sources.extend(sources);
        self.seams.extend(seams);
        self.dom_assists.extend(dom_assists);
    }

    pub fn add_dedup(
        &mut self,
        kept: impl IntoIterator<Item = StitchedBlock>,
        decisions: impl IntoIterator<Item = DedupDecision>,
    ) {
        self.blocks.extend(kept);
        self.dedup.extend(decisions);
    }

    pub fn add_links(&mut self, links: impl IntoIterator<Item = LinkRecord>) {
        self.links.extend(links);
    }

    /// True once any recorded warning degrades fidelity.
    pub fn is_degraded(&self) -> bool {
        self.warnings.iter().any(|w| w.code.degrades())
    }

    /// Freeze into the terminal manifest.
    pub fn freeze(
        self,
        state: JobState,
        markdown: String,
        failure: Option<FailureRecord>,
    ) -> JobManifest {
        let degraded = state == JobState::Degraded || self.is_degraded();
        JobManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            job_id: self.job_id,
            cache_key: self.cache_key,
            config: self.config,
            tiler: self.tiler,
            ocr_policy: self.ocr_policy,
            ocr_policy_version: crate::policy::OCR_POLICY_VERSION.to_string(),
            state,
            degraded,
            failure,
            warnings: self.warnings,
            frames: self.frames,
            tiles: self.tiles,
            ocr: self.ocr,
            ocr_batches: self.ocr_batches,
            sources: self.sources,
            blocks: self.blocks,
            seams: self.seams,
            dom_assists: self.dom_assists,
            dedup: self.dedup,
            links: self.links,
            timings: self.timings,
            markdown,
            created_at: self.created_at,
            finished_at: Utc::now(),
        }
    }
}
