//! Job coordinator.
//!
//! [`Pipeline::run`] drives one capture job through
//!
//! ```text
//! Pending → Capturing → Tiling → Recognizing → Stitching → Deduping → Finalizing → Complete
//!                                                                                 ↘ Degraded
//! (any non-terminal state) → Failed
//! Pending → Complete   (cache hit)
//! ```
//!
//! Transitions only move forward. The cache key is computed while still
//! `Pending`; jobs with equal keys are serialised on a per-key lock so the
//! second one sees the first one's stored artifact. Only a `Complete`
//! artifact is served from the cache; a `Degraded` one is captured again and
//! replaced once a run completes cleanly. Waiting for the lock counts
//! against the job timeout and stops on cancellation. Stage-local problems become manifest warnings and demote the
//! job to `Degraded`; only first-frame capture failure, cancellation, the
//! whole-job timeout and storage errors fail it.

use crate::cache::CacheKey;
use crate::cancel::CancelSignal;
use crate::config::{CaptureConfig, PipelineSettings};
use crate::driver::RenderDriver;
use crate::error::CaptureError;
use crate::manifest::{JobManifest, ManifestBuilder, ManifestWarning};
use crate::pipeline::capture::sweep;
use crate::pipeline::dedup::dedup;
use crate::pipeline::links::{blend_links, links_appendix, DomOutline};
use crate::pipeline::ocr::{OcrEngine, OcrLimiter};
use crate::pipeline::postprocess::finish_document;
use crate::pipeline::stitch::{render_markdown, stitch};
use crate::pipeline::tile::slice;
use crate::policy::PolicyTable;
use crate::progress::{NoopProgress, SharedProgress};
use crate::recognizer::RecognitionService;
use crate::store::{ArtifactBundle, ArtifactStore, MemoryStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Lifecycle of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Capturing,
    Tiling,
    Recognizing,
    Stitching,
    Deduping,
    Finalizing,
    Complete,
    Degraded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Capturing => "Capturing",
            JobState::Tiling => "Tiling",
            JobState::Recognizing => "Recognizing",
            JobState::Stitching => "Stitching",
            JobState::Deduping => "Deduping",
            JobState::Finalizing => "Finalizing",
            JobState::Complete => "Complete",
            JobState::Degraded => "Degraded",
            JobState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Degraded | JobState::Failed)
    }

    /// Whether `next` is a legal successor.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed) => true,
            (Pending, Complete) | (Finalizing, Complete) | (Finalizing, Degraded) => true,
            (_, Complete) | (_, Degraded) => false,
            (s, n) => n as u8 == *s as u8 + 1,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the path taken to reach it.
struct JobTracker {
    job_id: Uuid,
    state: JobState,
    history: Vec<JobState>,
    progress: SharedProgress,
}

impl JobTracker {
    fn new(job_id: Uuid, progress: SharedProgress) -> Self {
        Self {
            job_id,
            state: JobState::Pending,
            history: vec![JobState::Pending],
            progress,
        }
    }

    fn advance(&mut self, next: JobState) -> Result<(), CaptureError> {
        if !self.state.can_transition_to(next) {
            return Err(CaptureError::Internal(format!(
                "illegal job transition {} → {}",
                self.state, next
            )));
        }
        debug!("Job {}: {} → {}", self.job_id, self.state, next);
        self.state = next;
        self.history.push(next);
        self.progress.on_stage(next);
        Ok(())
    }
}

/// Outcome of a job that reached `Complete` or `Degraded`.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub cache_key: CacheKey,
    pub state: JobState,
    /// True when the manifest came from the store and nothing ran.
    pub cache_hit: bool,
    /// Every state visited, in order.
    pub transitions: Vec<JobState>,
    pub manifest: JobManifest,
}

impl JobReport {
    pub fn markdown(&self) -> &str {
        &self.manifest.markdown
    }

    pub fn degraded(&self) -> bool {
        self.manifest.degraded
    }
}

/// In-process lock per cache key.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            Arc::clone(map.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    async fn release(&self, key: &CacheKey, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.prune(key).await;
    }

    /// Forget `key`'s lock once nobody holds or waits on it.
    async fn prune(&self, key: &CacheKey) {
        let mut map = self.locks.lock().await;
        if map.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(key);
        }
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Runs capture jobs.
///
/// Cheap to clone; clones share the store, limiter and per-key locks.
#[derive(Clone)]
pub struct Pipeline {
    recognizer: Arc<dyn RecognitionService>,
    policies: PolicyTable,
    settings: PipelineSettings,
    store: Arc<dyn ArtifactStore>,
    progress: SharedProgress,
    limiter: OcrLimiter,
    locks: Arc<KeyLocks>,
}

impl Pipeline {
    pub fn new(recognizer: Arc<dyn RecognitionService>) -> Self {
        Self {
            recognizer,
            policies: PolicyTable::default(),
            settings: PipelineSettings::default(),
            store: Arc::new(MemoryStore::new()),
            progress: Arc::new(NoopProgress),
            limiter: OcrLimiter::global(),
            locks: Arc::new(KeyLocks::default()),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Use a dedicated OCR limiter instead of the process-wide one.
    pub fn with_limiter(mut self, limiter: OcrLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Cache key `config` would run under.
    pub fn cache_key(&self, config: &CaptureConfig) -> Result<CacheKey, CaptureError> {
        let policy = self.policies.get(self.settings.ocr.policy).ok_or_else(|| {
            CaptureError::InvalidConfig(format!(
                "OCR policy '{}' is not in the policy table",
                self.settings.ocr.policy
            ))
        })?;
        CacheKey::compute(config, &self.settings, policy)
    }

    /// Run one job to a terminal state.
    pub async fn run(
        &self,
        config: &CaptureConfig,
        driver: &mut dyn RenderDriver,
        cancel: &CancelSignal,
    ) -> Result<JobReport, CaptureError> {
        self.settings.validate()?;
        let key = self.cache_key(config)?;
        let job_id = Uuid::now_v7();
        let mut tracker = JobTracker::new(job_id, Arc::clone(&self.progress));
        self.progress.on_job_start(job_id, key.as_str());
        info!("Job {} for {} (key {})", job_id, config.url, key.short());

        // The deadline also covers time spent queued behind an equal job.
        let deadline_at = tokio::time::Instant::now() + self.settings.job_timeout();
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(deadline_at) => Err(Interrupt::TimedOut),
            guard = self.locks.acquire(&key) => Ok(guard),
        };
        let outcome = match acquired {
            Ok(guard) => {
                let outcome = self
                    .run_locked(config, driver, cancel, &key, &mut tracker, deadline_at)
                    .await;
                self.locks.release(&key, guard).await;
                outcome
            }
            Err(interrupt) => {
                debug!("Job {} gave up waiting for {}", job_id, key.short());
                self.locks.prune(&key).await;
                Err(self.interrupted(interrupt, &tracker))
            }
        };

        match outcome {
            Ok((manifest, cache_hit)) => {
                self.progress.on_job_finished(tracker.state, manifest.degraded);
                info!(
                    "Job {} finished {}{} ({} warnings)",
                    job_id,
                    tracker.state,
                    if cache_hit { " from cache" } else { "" },
                    manifest.warnings.len()
                );
                Ok(JobReport {
                    job_id,
                    cache_key: key,
                    state: tracker.state,
                    cache_hit,
                    transitions: tracker.history,
                    manifest,
                })
            }
            Err(e) => {
                error!("Job {} failed during {}: {} [{}]", job_id, tracker.state, e, e.code());
                if !tracker.state.is_terminal() {
                    tracker.advance(JobState::Failed)?;
                }
                self.progress.on_job_finished(JobState::Failed, false);
                Err(e)
            }
        }
    }

    async fn run_locked(
        &self,
        config: &CaptureConfig,
        driver: &mut dyn RenderDriver,
        cancel: &CancelSignal,
        key: &CacheKey,
        tracker: &mut JobTracker,
        deadline_at: tokio::time::Instant,
    ) -> Result<(JobManifest, bool), CaptureError> {
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled {
                stage: tracker.state.to_string(),
            });
        }

        let cached = self
            .store
            .get(key)
            .await
            .map_err(|source| CaptureError::StorageReadFailed {
                key: key.to_string(),
                source,
            })?;
        // Degraded entries are retried; a complete rerun replaces them.
        if let Some(manifest) = cached.filter(|m| m.state == JobState::Complete) {
            info!("Cache hit for {} (job {})", key.short(), manifest.job_id);
            tracker.advance(JobState::Complete)?;
            return Ok((manifest, true));
        }

        let outcome = {
            let work = self.execute(config, driver, cancel, key, tracker);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                r = tokio::time::timeout_at(deadline_at, work) => r.map_err(|_| Interrupt::TimedOut),
            }
        };

        match outcome {
            Ok(result) => result.map(|m| (m, false)),
            Err(interrupt) => Err(self.interrupted(interrupt, tracker)),
        }
    }

    fn interrupted(&self, interrupt: Interrupt, tracker: &JobTracker) -> CaptureError {
        match interrupt {
            Interrupt::Cancelled => CaptureError::Cancelled {
                stage: tracker.state.to_string(),
            },
            Interrupt::TimedOut => {
                let limit = self.settings.job_timeout();
                warn!("Job {} exceeded {:?} during {}", tracker.job_id, limit, tracker.state);
                CaptureError::JobTimeout { elapsed: limit }
            }
        }
    }

    fn note(&self, builder: &mut ManifestBuilder, warnings: Vec<ManifestWarning>) {
        for w in &warnings {
            self.progress.on_warning(w);
        }
        builder.extend_warnings(warnings);
    }

    async fn execute(
        &self,
        config: &CaptureConfig,
        driver: &mut dyn RenderDriver,
        cancel: &CancelSignal,
        key: &CacheKey,
        tracker: &mut JobTracker,
    ) -> Result<JobManifest, CaptureError> {
        let mut builder = ManifestBuilder::new(
            tracker.job_id,
            key.as_str(),
            config.clone(),
            self.settings.tiler,
            self.settings.ocr.policy,
        );

        // ── Capturing ─────────────────────────────────────────────────────
        tracker.advance(JobState::Capturing)?;
        let t = Instant::now();
        let swept = sweep(driver, config, self.settings.step_timeout(), cancel).await?;
        info!("Captured {} frames in {} steps", swept.frames.len(), swept.steps);
        self.progress.on_frames_captured(swept.frames.len());
        self.note(&mut builder, swept.warnings);
        builder.record_timing(JobState::Capturing, t.elapsed().as_millis() as u64);

        // ── Tiling ────────────────────────────────────────────────────────
        tracker.advance(JobState::Tiling)?;
        let t = Instant::now();
        let tileset = slice(&swept.frames, &self.settings.tiler);
        info!("Sliced {} frames into {} tiles", swept.frames.len(), tileset.tiles.len());
        self.progress.on_tiles_ready(tileset.tiles.len());
        self.note(&mut builder, tileset.warnings);
        builder.record_timing(JobState::Tiling, t.elapsed().as_millis() as u64);

        // ── Recognizing ───────────────────────────────────────────────────
        tracker.advance(JobState::Recognizing)?;
        let t = Instant::now();
        let mut engine = OcrEngine::new(
            Arc::clone(&self.recognizer),
            self.policies.clone(),
            self.settings.ocr.clone(),
        )
        .with_limiter(self.limiter.clone());
        let run = engine
            .recognize(&tileset.tiles, self.progress.as_ref(), cancel)
            .await?;
        self.note(&mut builder, run.warnings);
        builder.record_timing(JobState::Recognizing, t.elapsed().as_millis() as u64);

        // ── Stitching ─────────────────────────────────────────────────────
        tracker.advance(JobState::Stitching)?;
        let t = Instant::now();
        let base = Url::parse(&config.url).ok();
        let outline = swept
            .dom_snapshot
            .as_deref()
            .map(|html| DomOutline::from_html(html, base.as_ref()))
            .unwrap_or_default();
        let stitched = stitch(&tileset.tiles, &run.results, &outline, &self.settings.stitch);
        debug!(
            "Stitched {} blocks over {} seams ({} usable tiles)",
            stitched.blocks.len(),
            stitched.seams.len(),
            stitched.usable_tiles
        );
        self.note(&mut builder, stitched.warnings);
        builder.record_timing(JobState::Stitching, t.elapsed().as_millis() as u64);

        // ── Deduping ──────────────────────────────────────────────────────
        tracker.advance(JobState::Deduping)?;
        let t = Instant::now();
        let deduped = dedup(stitched.blocks, &self.settings.dedup);
        if !deduped.decisions.is_empty() {
            info!("Dedup dropped {} blocks", deduped.decisions.len());
        }
        builder.record_timing(JobState::Deduping, t.elapsed().as_millis() as u64);

        // ── Finalizing ────────────────────────────────────────────────────
        tracker.advance(JobState::Finalizing)?;
        let t = Instant::now();
        let mut markdown = render_markdown(&stitched.sources, &deduped.kept, &stitched.seams);
        let links = blend_links(&outline.links, &markdown);
        if self.settings.links_appendix && !links.is_empty() {
            markdown = finish_document(&format!("{}\n{}", markdown, links_appendix(&links)));
        }

        builder.add_frames(swept.frames);
        builder.add_tiles(tileset.tiles);
        builder.add_ocr(run.results, run.batches);
        builder.add_stitch(stitched.sources, stitched.seams, stitched.dom_assists);
        builder.add_dedup(deduped.kept, deduped.decisions);
        builder.add_links(links);
        builder.record_timing(JobState::Finalizing, t.elapsed().as_millis() as u64);

        let terminal = if builder.is_degraded() {
            JobState::Degraded
        } else {
            JobState::Complete
        };
        let manifest = builder.freeze(terminal, markdown, None);

        let bundle = ArtifactBundle::from_manifest(manifest.clone());
        self.store
            .put(key, bundle)
            .await
            .map_err(|source| CaptureError::StorageWriteFailed {
                key: key.to_string(),
                source,
            })?;

        tracker.advance(terminal)?;
        Ok(manifest)
    }
}
