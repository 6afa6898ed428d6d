//! OCR dispatch engine.
//!
//! Tiles are sent in batches whose size follows an AIMD window owned by the
//! engine (one engine per job). Every request additionally holds a permit
//! from the process-wide [`OcrLimiter`], so the sum of all jobs' windows
//! never exceeds the global ceiling.
//!
//! ## Control law (per batch)
//!
//! * any rate-limit or timeout → halve the window, floored at the minimum
//! * no errors and p95 latency below target → window + 1, capped at the maximum
//! * otherwise hold
//!
//! ## Retry and fallback
//!
//! Each tile is a task whose attempt counters and backoff are
//! advanced by the dispatch loop. A policy gets `max_attempts` tries with
//! exponential backoff (a rate limit's `Retry-After` wins when longer);
//! `Rejected` skips the remaining tries. Then the policy's fallback is used,
//! and when the chain is exhausted the tile is recorded as `OCR_FAILED`.

use crate::cancel::CancelSignal;
use crate::config::OcrSettings;
use crate::error::{CaptureError, RecognitionError, TileError};
use crate::manifest::{ManifestWarning, WarningCode};
use crate::pipeline::tile::Tile;
use crate::policy::{OcrPolicy, PolicyName, PolicyRole, PolicyTable};
use crate::progress::ProgressSink;
use crate::recognizer::{RecognitionRequest, RecognitionResponse, RecognitionService, TextBlock};
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Default process-wide in-flight ceiling.
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 16;

static GLOBAL_LIMITER: Lazy<OcrLimiter> = Lazy::new(|| {
    let ceiling = std::env::var("MDWB_OCR_GLOBAL_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n: &usize| *n > 0)
        .unwrap_or(DEFAULT_GLOBAL_CONCURRENCY);
    OcrLimiter::new(ceiling)
});

/// Process-wide OCR request ceiling shared by every job.
#[derive(Debug, Clone)]
pub struct OcrLimiter {
    permits: Arc<Semaphore>,
    ceiling: usize,
}

impl OcrLimiter {
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            permits: Arc::new(Semaphore::new(ceiling)),
            ceiling,
        }
    }

    /// The limiter every engine uses unless given its own.
    pub fn global() -> Self {
        GLOBAL_LIMITER.clone()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, RecognitionError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RecognitionError::Transient("OCR limiter closed".into()))
    }
}

/// Additive-increase/multiplicative-decrease concurrency window.
#[derive(Debug, Clone, PartialEq)]
pub struct AimdWindow {
    current: usize,
    min: usize,
    max: usize,
    target_p95: Duration,
}

impl AimdWindow {
    pub fn new(min: usize, max: usize, target_p95: Duration) -> Self {
        let min = min.max(1);
        Self {
            current: min,
            min,
            max: max.max(min),
            target_p95,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Apply one batch's signals and return the new window.
    pub fn observe(&mut self, p95: Duration, errors: usize, throttled: bool) -> usize {
        if throttled {
            self.current = (self.current / 2).max(self.min);
        } else if errors == 0 && p95 < self.target_p95 {
            self.current = (self.current + 1).min(self.max);
        }
        self.current
    }
}

/// Outcome for one tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub tile_index: usize,
    pub blocks: Vec<TextBlock>,
    /// Policy of the last attempt (the successful one on success).
    pub policy: Option<PolicyName>,
    pub role: PolicyRole,
    /// Latency of the last attempt.
    pub latency_ms: u64,
    /// Attempts across every policy tried.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TileError>,
}

impl OcrResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-batch control-loop record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTelemetry {
    pub batch: usize,
    pub tiles: Vec<usize>,
    pub window: usize,
    pub p95_ms: u64,
    pub errors: usize,
    pub throttled: bool,
    pub next_window: usize,
}

/// Everything one `recognize` call produced.
#[derive(Debug, Clone, Default)]
pub struct OcrRun {
    /// One result per input tile, in tile order.
    pub results: Vec<OcrResult>,
    pub batches: Vec<BatchTelemetry>,
    pub warnings: Vec<ManifestWarning>,
}

/// In-flight state of one tile.
#[derive(Debug, Clone)]
struct TileTask {
    slot: usize,
    chain_pos: usize,
    attempts: u32,
    attempts_on_policy: u32,
    backoff: Duration,
    last_error: Option<String>,
    last_latency: Duration,
}

impl TileTask {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            chain_pos: 0,
            attempts: 0,
            attempts_on_policy: 0,
            backoff: Duration::ZERO,
            last_error: None,
            last_latency: Duration::ZERO,
        }
    }

    fn role(&self) -> PolicyRole {
        if self.chain_pos == 0 {
            PolicyRole::Primary
        } else {
            PolicyRole::Fallback
        }
    }
}

fn p95(latencies: &mut [Duration]) -> Duration {
    if latencies.is_empty() {
        return Duration::ZERO;
    }
    latencies.sort();
    let rank = ((latencies.len() as f64) * 0.95).ceil() as usize;
    latencies[rank.saturating_sub(1).min(latencies.len() - 1)]
}

/// Job-scoped OCR dispatcher.
pub struct OcrEngine {
    service: Arc<dyn RecognitionService>,
    policies: PolicyTable,
    settings: OcrSettings,
    limiter: OcrLimiter,
    window: AimdWindow,
}

impl OcrEngine {
    pub fn new(service: Arc<dyn RecognitionService>, policies: PolicyTable, settings: OcrSettings) -> Self {
        let window = AimdWindow::new(
            settings.min_concurrency,
            settings.max_concurrency,
            settings.target_p95(),
        );
        Self {
            service,
            policies,
            settings,
            limiter: OcrLimiter::global(),
            window,
        }
    }

    /// Use a dedicated limiter instead of the process-wide one.
    pub fn with_limiter(mut self, limiter: OcrLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn window(&self) -> usize {
        self.window.current()
    }

    /// Move `task` to the first policy at or after its position that accepts
    /// the tile. Returns that policy, or `None` once the chain is exhausted.
    fn current_policy(&self, chain: &[PolicyName], task: &mut TileTask, tile: &Tile) -> Option<OcrPolicy> {
        while let Some(name) = chain.get(task.chain_pos) {
            match self.policies.get(*name) {
                Some(p) if p.accepts(tile.width, tile.height) => return Some(p.clone()),
                _ => {
                    debug!(
                        "{}: {}x{} not accepted by {}, skipping",
                        tile.tile_id(),
                        tile.width,
                        tile.height,
                        name
                    );
                    task.chain_pos += 1;
                    task.attempts_on_policy = 0;
                }
            }
        }
        None
    }

    fn failed_result(task: &TileTask, tile: &Tile, chain: &[PolicyName]) -> OcrResult {
        let error = if task.attempts == 0 {
            TileError::TooLarge {
                tile: tile.index,
                width: tile.width,
                height: tile.height,
            }
        } else {
            TileError::OcrFailed {
                tile: tile.index,
                attempts: task.attempts,
                detail: task.last_error.clone().unwrap_or_else(|| "unknown error".into()),
            }
        };
        OcrResult {
            tile_index: tile.index,
            blocks: Vec::new(),
            policy: chain.get(task.chain_pos.saturating_sub(1)).copied(),
            role: if task.chain_pos > 1 {
                PolicyRole::Fallback
            } else {
                PolicyRole::Primary
            },
            latency_ms: task.last_latency.as_millis() as u64,
            attempt_count: task.attempts,
            confidence: None,
            error: Some(error),
        }
    }

    /// Recognize every tile. Results come back in tile order.
    pub async fn recognize(
        &mut self,
        tiles: &[Tile],
        progress: &dyn ProgressSink,
        cancel: &CancelSignal,
    ) -> Result<OcrRun, CaptureError> {
        let chain = self.policies.chain(self.settings.policy);
        if chain.is_empty() {
            return Err(CaptureError::InvalidConfig(format!(
                "OCR policy '{}' is not in the policy table",
                self.settings.policy
            )));
        }

        let total = tiles.len();
        let mut run = OcrRun::default();
        let mut slots: Vec<Option<OcrResult>> = vec![None; total];
        let mut queue: VecDeque<TileTask> = (0..total).map(TileTask::new).collect();

        while !queue.is_empty() {
            let window = self.window.current();
            let mut batch: Vec<(TileTask, OcrPolicy)> = Vec::new();
            let mut per_policy: BTreeMap<PolicyName, usize> = BTreeMap::new();
            let mut deferred: VecDeque<TileTask> = VecDeque::new();

            while batch.len() < window {
                let Some(mut task) = queue.pop_front() else {
                    break;
                };
                let tile = &tiles[task.slot];
                let Some(policy) = self.current_policy(&chain, &mut task, tile) else {
                    let result = Self::failed_result(&task, tile, &chain);
                    self.record_failure(&mut run, progress, total, tile, &result);
                    slots[task.slot] = Some(result);
                    continue;
                };
                let in_flight = per_policy.entry(policy.name).or_default();
                if *in_flight >= policy.concurrency_ceiling.max(1) {
                    deferred.push_back(task);
                    continue;
                }
                *in_flight += 1;
                batch.push((task, policy));
            }
            while let Some(task) = deferred.pop_back() {
                queue.push_front(task);
            }
            if batch.is_empty() {
                continue;
            }

            let timeout = self.settings.request_timeout();
            let futs: Vec<_> = batch
                .iter()
                .map(|(task, policy)| {
                    let tile = &tiles[task.slot];
                    let request = RecognitionRequest {
                        tile_id: tile.tile_id(),
                        png: Arc::clone(&tile.png),
                        width: tile.width,
                        height: tile.height,
                        overlap_px: tile.overlap_px,
                        policy: policy.clone(),
                    };
                    let service = Arc::clone(&self.service);
                    let limiter = self.limiter.clone();
                    let backoff = task.backoff;
                    async move {
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                        let _permit = match limiter.acquire().await {
                            Ok(permit) => permit,
                            Err(e) => return (Err(e), Duration::ZERO),
                        };
                        let start = Instant::now();
                        let outcome = match tokio::time::timeout(timeout, service.recognize(&request)).await {
                            Ok(r) => r,
                            Err(_) => Err(RecognitionError::Timeout { elapsed: timeout }),
                        };
                        (outcome, start.elapsed())
                    }
                })
                .collect();

            let outcomes = cancel.guard(join_all(futs)).await.map_err(|_| CaptureError::Cancelled {
                stage: "Recognizing".into(),
            })?;

            let mut latencies = Vec::with_capacity(outcomes.len());
            let mut errors = 0usize;
            let mut throttled = false;
            let mut batch_tiles = Vec::with_capacity(outcomes.len());

            for ((mut task, policy), (outcome, latency)) in batch.into_iter().zip(outcomes) {
                let tile = &tiles[task.slot];
                batch_tiles.push(tile.index);
                latencies.push(latency);
                task.attempts += 1;
                task.attempts_on_policy += 1;
                task.last_latency = latency;

                match outcome {
                    Ok(response) => {
                        let result = Self::success_result(&task, tile, &policy, response);
                        debug!(
                            "{}: recognized by {} on attempt {} ({}ms)",
                            tile.tile_id(),
                            policy.name,
                            task.attempts,
                            result.latency_ms
                        );
                        progress.on_tile_recognized(tile.index, total, policy.name, task.attempts);
                        slots[task.slot] = Some(result);
                    }
                    Err(err) => {
                        errors += 1;
                        throttled |= err.is_throttle();
                        warn!(
                            "{}: attempt {} on {} failed: {}",
                            tile.tile_id(),
                            task.attempts,
                            policy.name,
                            err
                        );
                        task.last_error = Some(err.to_string());
                        if err.is_retryable() && task.attempts_on_policy < self.settings.max_attempts {
                            let mut delay = self.settings.backoff_for(task.attempts_on_policy + 1);
                            if let RecognitionError::RateLimited {
                                retry_after: Some(after),
                                ..
                            } = &err
                            {
                                delay = delay.max(*after);
                            }
                            task.backoff = delay;
                        } else {
                            task.chain_pos += 1;
                            task.attempts_on_policy = 0;
                            task.backoff = Duration::ZERO;
                            if task.chain_pos < chain.len() {
                                info!(
                                    "{}: falling back from {} to {}",
                                    tile.tile_id(),
                                    policy.name,
                                    chain[task.chain_pos]
                                );
                            }
                        }
                        queue.push_back(task);
                    }
                }
            }

            let p95 = p95(&mut latencies);
            let next_window = self.window.observe(p95, errors, throttled);
            if next_window != window {
                debug!("OCR window {} → {} (p95 {:?}, {} errors)", window, next_window, p95, errors);
            }
            run.batches.push(BatchTelemetry {
                batch: run.batches.len(),
                tiles: batch_tiles,
                window,
                p95_ms: p95.as_millis() as u64,
                errors,
                throttled,
                next_window,
            });
        }

        run.results = slots.into_iter().flatten().collect();
        let failed = run.results.iter().filter(|r| !r.is_success()).count();
        info!(
            "OCR finished: {}/{} tiles recognized in {} batches (window {})",
            total - failed,
            total,
            run.batches.len(),
            self.window.current()
        );
        Ok(run)
    }

    fn success_result(
        task: &TileTask,
        tile: &Tile,
        policy: &OcrPolicy,
        response: RecognitionResponse,
    ) -> OcrResult {
        OcrResult {
            tile_index: tile.index,
            blocks: response.blocks,
            policy: Some(policy.name),
            role: task.role(),
            latency_ms: task.last_latency.as_millis() as u64,
            attempt_count: task.attempts,
            confidence: response.confidence,
            error: None,
        }
    }

    fn record_failure(
        &self,
        run: &mut OcrRun,
        progress: &dyn ProgressSink,
        total: usize,
        tile: &Tile,
        result: &OcrResult,
    ) {
        let detail = result
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        warn!("{}: giving up: {}", tile.tile_id(), detail);
        progress.on_tile_failed(tile.index, total, &detail);
        run.warnings
            .push(ManifestWarning::new(WarningCode::OcrFailed, detail).at_tile(tile.index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::recognizer::BlockKind;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Script = dyn Fn(&RecognitionRequest, u32) -> Result<RecognitionResponse, RecognitionError> + Send + Sync;

    /// Recognizer driven by a closure of (request, call number for that tile).
    struct ScriptedService {
        script: Box<Script>,
        calls: Mutex<HashMap<String, u32>>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedService {
        fn new(script: impl Fn(&RecognitionRequest, u32) -> Result<RecognitionResponse, RecognitionError> + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                calls: Mutex::new(HashMap::new()),
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn total_calls(&self) -> u32 {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl RecognitionService for ScriptedService {
        async fn recognize(&self, request: &RecognitionRequest) -> Result<RecognitionResponse, RecognitionError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(request.tile_id.clone()).or_default();
                *n += 1;
                *n
            };
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.script)(request, call)
        }
    }

    fn text(s: &str) -> Result<RecognitionResponse, RecognitionError> {
        Ok(RecognitionResponse {
            blocks: vec![TextBlock::new(BlockKind::Paragraph, s)],
            confidence: Some(0.9),
            request_id: None,
        })
    }

    fn tiles(n: usize) -> Vec<Tile> {
        (0..n)
            .map(|i| Tile {
                index: i,
                frame_index: i,
                x: 0,
                y: 0,
                width: 200,
                height: 100,
                scale: 1.0,
                sha256: format!("{i:064}"),
                overlap_with_previous: i > 0,
                overlap_px: 0,
                overlap_page_px: 0,
                page_y_start: i as u32 * 100,
                page_y_end: i as u32 * 100 + 100,
                png: Arc::new(vec![i as u8]),
                pixels: Arc::default(),
            })
            .collect()
    }

    fn settings(max_attempts: u32) -> OcrSettings {
        OcrSettings {
            max_attempts,
            retry_backoff_ms: 1,
            max_backoff_ms: 2,
            ..Default::default()
        }
    }

    fn engine(service: Arc<ScriptedService>, settings: OcrSettings) -> OcrEngine {
        OcrEngine::new(service, PolicyTable::default(), settings).with_limiter(OcrLimiter::new(64))
    }

    async fn run(engine: &mut OcrEngine, tiles: &[Tile]) -> OcrRun {
        engine
            .recognize(tiles, &NoopProgress, &CancelSignal::never())
            .await
            .unwrap()
    }

    #[test]
    fn aimd_grows_halves_and_holds() {
        let mut w = AimdWindow::new(2, 5, Duration::from_secs(1));
        assert_eq!(w.current(), 2);
        assert_eq!(w.observe(Duration::from_millis(100), 0, false), 3);
        assert_eq!(w.observe(Duration::from_millis(100), 0, false), 4);
        assert_eq!(w.observe(Duration::from_millis(100), 0, false), 5);
        assert_eq!(w.observe(Duration::from_millis(100), 0, false), 5);
        assert_eq!(w.observe(Duration::from_secs(2), 0, false), 5);
        assert_eq!(w.observe(Duration::from_millis(100), 1, false), 5);
        assert_eq!(w.observe(Duration::from_millis(100), 1, true), 2);
        assert_eq!(w.observe(Duration::from_millis(100), 1, true), 2);
    }

    #[test]
    fn p95_picks_the_tail() {
        let mut l: Vec<Duration> = (1..=20).map(Duration::from_millis).collect();
        assert_eq!(p95(&mut l), Duration::from_millis(19));
        assert_eq!(p95(&mut []), Duration::ZERO);
    }

    #[tokio::test]
    async fn window_grows_on_fast_clean_batches() {
        let service = Arc::new(ScriptedService::new(|r, _| text(&r.tile_id)));
        let mut e = engine(service, settings(3));
        let out = run(&mut e, &tiles(6)).await;
        let sizes: Vec<usize> = out.batches.iter().map(|b| b.tiles.len()).collect();
        assert_eq!(sizes, vec![2, 3, 1]);
        assert_eq!(e.window(), 5);
        assert!(out.results.iter().all(|r| r.is_success() && r.attempt_count == 1));
    }

    #[tokio::test]
    async fn results_keep_tile_order() {
        let mut service = ScriptedService::new(|r, _| text(&r.tile_id));
        service.delay = Duration::from_millis(5);
        let mut e = engine(Arc::new(service), settings(3));
        let out = run(&mut e, &tiles(5)).await;
        let order: Vec<usize> = out.results.iter().map(|r| r.tile_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(out.results[3].blocks[0].text, "tile_0003");
    }

    #[tokio::test]
    async fn timeouts_recover_on_fallback() {
        let service = Arc::new(ScriptedService::new(|r, call| {
            if r.tile_id == "tile_0001" && r.policy.name == PolicyName::OlmOcrFp8 {
                return Err(RecognitionError::Timeout {
                    elapsed: Duration::from_secs(60),
                });
            }
            let _ = call;
            text("ok")
        }));
        let mut e = engine(Arc::clone(&service), settings(2));
        let out = run(&mut e, &tiles(3)).await;
        let r = &out.results[1];
        assert!(r.is_success());
        assert_eq!(r.attempt_count, 3);
        assert_eq!(r.role, PolicyRole::Fallback);
        assert_eq!(r.policy, Some(PolicyName::OlmOcrBf16));
        assert!(out.warnings.is_empty());
        assert!(out.batches.iter().any(|b| b.throttled));
    }

    #[tokio::test]
    async fn exhausted_chain_marks_tile_failed() {
        let service = Arc::new(ScriptedService::new(|r, _| {
            if r.tile_id == "tile_0002" {
                Err(RecognitionError::Transient("HTTP 503".into()))
            } else {
                text("fine")
            }
        }));
        let mut e = engine(Arc::clone(&service), settings(2));
        let out = run(&mut e, &tiles(3)).await;
        let r = &out.results[2];
        assert_eq!(
            r.error,
            Some(TileError::OcrFailed {
                tile: 2,
                attempts: 4,
                detail: "transient recognition error: HTTP 503".into()
            })
        );
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].to_string(), format!("OCR_FAILED tile=2: {}", r.error.as_ref().unwrap()));
        assert_eq!(service.total_calls(), 2 + 4);
    }

    #[tokio::test]
    async fn rejection_skips_to_fallback() {
        let service = Arc::new(ScriptedService::new(|r, _| {
            if r.policy.name == PolicyName::OlmOcrFp8 {
                Err(RecognitionError::Rejected("HTTP 400".into()))
            } else {
                text("ok")
            }
        }));
        let mut e = engine(service, settings(3));
        let out = run(&mut e, &tiles(1)).await;
        assert_eq!(out.results[0].attempt_count, 2);
        assert_eq!(out.results[0].role, PolicyRole::Fallback);
    }

    #[tokio::test]
    async fn oversized_tiles_are_never_sent() {
        let service = Arc::new(ScriptedService::new(|_, _| text("x")));
        let mut e = engine(Arc::clone(&service), settings(3));
        let mut big = tiles(1);
        big[0].width = 5000;
        let out = run(&mut e, &big).await;
        assert!(matches!(out.results[0].error, Some(TileError::TooLarge { .. })));
        assert_eq!(service.total_calls(), 0);
        assert_eq!(out.warnings[0].code, WarningCode::OcrFailed);
    }

    #[tokio::test]
    async fn rate_limit_halves_window() {
        let service = Arc::new(ScriptedService::new(|r, call| {
            if r.tile_id == "tile_0005" && call == 1 {
                Err(RecognitionError::RateLimited {
                    endpoint: "e".into(),
                    retry_after: Some(Duration::from_millis(2)),
                })
            } else {
                text("ok")
            }
        }));
        let mut e = engine(service, settings(3));
        let out = run(&mut e, &tiles(8)).await;
        // Batches: [0,1] → 3, [2,3,4] → 4, [5,6,7] throttled → 2.
        let throttled = out.batches.iter().find(|b| b.throttled).unwrap();
        assert_eq!(throttled.window, 4);
        assert_eq!(throttled.next_window, 2);
        assert!(out.results.iter().all(|r| r.is_success()));
    }

    #[tokio::test]
    async fn global_limiter_caps_in_flight_requests() {
        let mut service = ScriptedService::new(|_, _| text("ok"));
        service.delay = Duration::from_millis(5);
        let service = Arc::new(service);
        let s = OcrSettings {
            min_concurrency: 4,
            max_concurrency: 8,
            ..settings(3)
        };
        let mut e = OcrEngine::new(Arc::clone(&service) as Arc<dyn RecognitionService>, PolicyTable::default(), s)
            .with_limiter(OcrLimiter::new(1));
        run(&mut e, &tiles(6)).await;
        assert_eq!(service.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_stops_dispatch() {
        let (handle, signal) = crate::cancel::cancel_pair();
        handle.cancel();
        let service = Arc::new(ScriptedService::new(|_, _| text("ok")));
        let mut e = engine(Arc::clone(&service), settings(3));
        let err = e.recognize(&tiles(2), &NoopProgress, &signal).await.unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(service.total_calls(), 0);
    }
}
