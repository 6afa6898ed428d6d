//! Viewport sweep controller.
//!
//! Drives a [`RenderDriver`] top to bottom: scroll, settle, screenshot,
//! advance by `viewport_height − overlap_px`. Everything that can go wrong
//! after the first frame (SPA height shrink, scroll stall, step cap, a
//! failing step) is recorded as a warning and the frames captured so far are
//! kept. Only a failure before the first frame is fatal.

use crate::cancel::CancelSignal;
use crate::config::CaptureConfig;
use crate::driver::{DriverError, FrameCapture, RenderDriver};
use crate::error::CaptureError;
use crate::manifest::{ManifestWarning, WarningCode};
use crate::pipeline::encode::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const STAGE: &str = "Capturing";

/// One screenshot of the viewport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewportFrame {
    pub index: usize,
    /// Scroll offset the browser reported, CSS px.
    pub scroll_y: u32,
    /// Document height at capture time, CSS px.
    pub document_height: u32,
    /// Rows shared with the previous frame, CSS px. Zero for the first frame.
    pub overlap_px: u32,
    pub viewport_height: u32,
    pub device_scale_factor: f32,
    pub captured_at: DateTime<Utc>,
    pub png_sha256: String,
    #[serde(skip)]
    pub png: Arc<Vec<u8>>,
}

/// Result of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOutput {
    pub frames: Vec<ViewportFrame>,
    pub dom_snapshot: Option<String>,
    pub warnings: Vec<ManifestWarning>,
    /// Capture calls issued, retries included.
    pub steps: u32,
}

enum StepFailure {
    Driver(DriverError),
    TimedOut(Duration),
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::Driver(e) => write!(f, "{e}"),
            StepFailure::TimedOut(d) => write!(f, "step timed out after {}ms", d.as_millis()),
        }
    }
}

fn cancelled() -> CaptureError {
    CaptureError::Cancelled {
        stage: STAGE.to_string(),
    }
}

/// Run one driver interaction under the step timeout and the cancel signal.
///
/// The outer `Result` is fatal (cancellation); the inner one is the step's own outcome.
async fn bounded<T, F>(
    cancel: &CancelSignal,
    limit: Duration,
    fut: F,
) -> Result<Result<T, StepFailure>, CaptureError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match cancel.guard(tokio::time::timeout(limit, fut)).await {
        Err(_) => Err(cancelled()),
        Ok(Err(_)) => Ok(Err(StepFailure::TimedOut(limit))),
        Ok(Ok(Err(e))) => Ok(Err(StepFailure::Driver(e))),
        Ok(Ok(Ok(v))) => Ok(Ok(v)),
    }
}

async fn settle(cancel: &CancelSignal, delay: Duration) -> Result<(), CaptureError> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(cancelled())
        } else {
            Ok(())
        };
    }
    cancel
        .guard(tokio::time::sleep(delay))
        .await
        .map_err(|_| cancelled())
}

/// Sweep the page and return every frame captured.
pub async fn sweep<D>(
    driver: &mut D,
    config: &CaptureConfig,
    step_timeout: Duration,
    cancel: &CancelSignal,
) -> Result<SweepOutput, CaptureError>
where
    D: RenderDriver + ?Sized,
{
    let vh = config.viewport.height;
    let settle_delay = config.settle_delay();
    let mut out = SweepOutput::default();

    bounded(cancel, step_timeout, driver.navigate(config))
        .await?
        .map_err(|e| CaptureError::NavigationFailed {
            url: config.url.clone(),
            detail: e.to_string(),
        })?;

    let controls = config.determinism_controls();
    let mask_failures = bounded(cancel, step_timeout, async {
        Ok::<_, DriverError>(driver.apply_controls(&controls).await)
    })
    .await?
    .unwrap_or_default();
    for failure in mask_failures {
        warn!("Mask selector '{}' not applied: {}", failure.selector, failure.reason);
        out.warnings.push(ManifestWarning::new(
            WarningCode::MaskFailed,
            format!("{}: {}", failure.selector, failure.reason),
        ));
    }
    settle(cancel, settle_delay).await?;

    let mut target = 0u32;
    let mut shrink_seen = false;
    let mut retrying_shrink = false;

    loop {
        if out.steps >= config.max_steps {
            warn!("Sweep stopped at the step cap ({})", config.max_steps);
            out.warnings.push(
                ManifestWarning::new(
                    WarningCode::StepCapReached,
                    format!("stopped after {} steps before the page bottom", config.max_steps),
                )
                .at_step(out.steps),
            );
            break;
        }

        let step = out.steps;
        out.steps += 1;
        let attempt = bounded(cancel, step_timeout, async {
            let actual = driver.scroll_to(target).await?;
            tokio::time::sleep(settle_delay).await;
            let capture = driver.capture_frame().await?;
            Ok::<(u32, FrameCapture), DriverError>((actual, capture))
        })
        .await?;

        let (actual, capture) = match attempt {
            Ok(v) => v,
            Err(failure) if out.frames.is_empty() => {
                return Err(CaptureError::CaptureFailed {
                    url: config.url.clone(),
                    detail: failure.to_string(),
                });
            }
            Err(failure) => {
                warn!("Capture step {} failed, keeping {} frames: {}", step, out.frames.len(), failure);
                out.warnings.push(
                    ManifestWarning::new(WarningCode::CaptureStepFailed, failure.to_string())
                        .at_step(step),
                );
                break;
            }
        };

        if let Some(prev) = out.frames.last() {
            if capture.document_height < prev.document_height {
                let detail = format!(
                    "document height fell from {} to {} at step {}",
                    prev.document_height, capture.document_height, step
                );
                if shrink_seen {
                    warn!("{}, stopping with {} frames", detail, out.frames.len());
                    out.warnings.push(
                        ManifestWarning::new(WarningCode::SpaHeightShrink, detail).at_step(step),
                    );
                    break;
                }
                debug!("{}, retrying once", detail);
                shrink_seen = true;
                retrying_shrink = true;
                settle(cancel, settle_delay).await?;
                continue;
            }
        }
        if retrying_shrink {
            retrying_shrink = false;
            out.warnings.push(
                ManifestWarning::new(
                    WarningCode::SpaHeightShrinkRecovered,
                    "document height recovered on retry",
                )
                .at_step(step),
            );
        }

        let overlap_px = match out.frames.last() {
            Some(prev) => {
                if actual <= prev.scroll_y {
                    warn!("Scroll stalled at y={} (document height {})", actual, capture.document_height);
                    out.warnings.push(
                        ManifestWarning::new(
                            WarningCode::ScrollStall,
                            format!("scroll did not advance past y={actual}"),
                        )
                        .at_step(step),
                    );
                    break;
                }
                (prev.scroll_y + vh).saturating_sub(actual).min(vh)
            }
            None => 0,
        };

        let index = out.frames.len();
        debug!(
            "Frame {}: y={} doc_h={} overlap={}",
            index, actual, capture.document_height, overlap_px
        );
        out.frames.push(ViewportFrame {
            index,
            scroll_y: actual,
            document_height: capture.document_height,
            overlap_px,
            viewport_height: vh,
            device_scale_factor: config.device_scale_factor,
            captured_at: Utc::now(),
            png_sha256: sha256_hex(&capture.png),
            png: Arc::new(capture.png),
        });

        if actual + vh >= capture.document_height {
            // Bottom observed once; confirm after a settle at the same offset.
            settle(cancel, settle_delay).await?;
            let remeasured = bounded(cancel, step_timeout, driver.document_height()).await?;
            match remeasured {
                Ok(h) if h > actual + vh => {
                    debug!("Document grew to {} at the bottom, continuing", h);
                }
                _ => break,
            }
        }
        target = actual + config.scroll_step();
    }

    match bounded(cancel, step_timeout, driver.snapshot_dom()).await? {
        Ok(html) => out.dom_snapshot = Some(html),
        Err(failure) => {
            warn!("DOM snapshot failed: {}", failure);
            out.warnings.push(ManifestWarning::new(
                WarningCode::DomSnapshotFailed,
                failure.to_string(),
            ));
        }
    }

    info!(
        "Sweep of {} captured {} frames in {} steps ({} warnings)",
        config.url,
        out.frames.len(),
        out.steps,
        out.warnings.len()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::config::DeterminismControls;
    use crate::driver::MaskFailure;
    use async_trait::async_trait;

    /// Fake browser whose document height follows a script indexed by capture count.
    struct ScriptedDriver {
        heights: Vec<u32>,
        vh: u32,
        scroll_y: u32,
        captures: usize,
        fail_capture_at: Option<usize>,
        stuck: bool,
        missing_selector: Option<String>,
    }

    impl ScriptedDriver {
        fn new(heights: Vec<u32>) -> Self {
            Self {
                heights,
                vh: 0,
                scroll_y: 0,
                captures: 0,
                fail_capture_at: None,
                stuck: false,
                missing_selector: None,
            }
        }

        fn height_now(&self) -> u32 {
            self.heights[self.captures.min(self.heights.len() - 1)]
        }
    }

    #[async_trait]
    impl RenderDriver for ScriptedDriver {
        async fn navigate(&mut self, config: &CaptureConfig) -> Result<(), DriverError> {
            self.vh = config.viewport.height;
            Ok(())
        }

        async fn apply_controls(&mut self, _c: &DeterminismControls) -> Vec<MaskFailure> {
            self.missing_selector
                .iter()
                .map(|s| MaskFailure {
                    selector: s.clone(),
                    reason: "no match".into(),
                })
                .collect()
        }

        async fn scroll_to(&mut self, y: u32) -> Result<u32, DriverError> {
            if !self.stuck {
                self.scroll_y = y.min(self.height_now().saturating_sub(self.vh));
            }
            Ok(self.scroll_y)
        }

        async fn capture_frame(&mut self) -> Result<FrameCapture, DriverError> {
            if self.fail_capture_at == Some(self.captures) {
                self.captures += 1;
                return Err(DriverError("target closed".into()));
            }
            let h = self.height_now();
            self.captures += 1;
            Ok(FrameCapture {
                png: format!("frame@{}", self.scroll_y).into_bytes(),
                scroll_y: self.scroll_y,
                document_height: h,
            })
        }

        async fn document_height(&mut self) -> Result<u32, DriverError> {
            Ok(self.height_now())
        }

        async fn snapshot_dom(&mut self) -> Result<String, DriverError> {
            Ok("<html></html>".into())
        }
    }

    fn config(vh: u32, overlap: u32) -> CaptureConfig {
        CaptureConfig::builder("https://example.com")
            .viewport(800, vh)
            .overlap_px(overlap)
            .settle_delay_ms(0)
            .build()
            .unwrap()
    }

    async fn run(driver: &mut ScriptedDriver, config: &CaptureConfig) -> Result<SweepOutput, CaptureError> {
        sweep(driver, config, Duration::from_secs(5), &CancelSignal::never()).await
    }

    fn codes(out: &SweepOutput) -> Vec<WarningCode> {
        out.warnings.iter().map(|w| w.code).collect()
    }

    #[tokio::test]
    async fn short_page_is_one_frame() {
        let mut d = ScriptedDriver::new(vec![1500]);
        let out = run(&mut d, &config(2000, 120)).await.unwrap();
        assert_eq!(out.frames.len(), 1);
        assert!(out.warnings.is_empty());
        assert_eq!(out.dom_snapshot.as_deref(), Some("<html></html>"));
    }

    #[tokio::test]
    async fn three_step_sweep_records_scroll_overlap() {
        let mut d = ScriptedDriver::new(vec![2760]);
        let out = run(&mut d, &config(1000, 120)).await.unwrap();
        let ys: Vec<u32> = out.frames.iter().map(|f| f.scroll_y).collect();
        let overlaps: Vec<u32> = out.frames.iter().map(|f| f.overlap_px).collect();
        assert_eq!(ys, vec![0, 880, 1760]);
        assert_eq!(overlaps, vec![0, 120, 120]);
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn clamped_last_step_widens_overlap() {
        let mut d = ScriptedDriver::new(vec![2500]);
        let out = run(&mut d, &config(1000, 120)).await.unwrap();
        let last = out.frames.last().unwrap();
        assert_eq!(last.scroll_y, 1500);
        assert_eq!(last.overlap_px, 880 + 1000 - 1500);
    }

    #[tokio::test]
    async fn persistent_shrink_keeps_prior_frames() {
        let mut d = ScriptedDriver::new(vec![5000, 5000, 5000, 3000, 3000]);
        let out = run(&mut d, &config(1000, 120)).await.unwrap();
        assert_eq!(out.frames.len(), 3);
        assert_eq!(codes(&out), vec![WarningCode::SpaHeightShrink]);
        assert_eq!(out.steps, 5);
    }

    #[tokio::test]
    async fn recovered_shrink_continues() {
        let mut d = ScriptedDriver::new(vec![3000, 3000, 1000, 3000]);
        let out = run(&mut d, &config(1000, 120)).await.unwrap();
        assert_eq!(codes(&out), vec![WarningCode::SpaHeightShrinkRecovered]);
        assert!(!out.warnings[0].code.degrades());
        assert_eq!(out.frames.last().unwrap().scroll_y, 2000);
    }

    #[tokio::test]
    async fn step_cap_stops_long_pages() {
        let mut d = ScriptedDriver::new(vec![100_000]);
        let c = CaptureConfig::builder("https://example.com")
            .viewport(800, 1000)
            .overlap_px(100)
            .max_steps(2)
            .settle_delay_ms(0)
            .build()
            .unwrap();
        let out = run(&mut d, &c).await.unwrap();
        assert_eq!(out.frames.len(), 2);
        assert_eq!(codes(&out), vec![WarningCode::StepCapReached]);
    }

    #[tokio::test]
    async fn growth_at_bottom_resumes_scrolling() {
        let mut d = ScriptedDriver::new(vec![1800, 1800, 3000]);
        let out = run(&mut d, &config(1000, 100)).await.unwrap();
        let ys: Vec<u32> = out.frames.iter().map(|f| f.scroll_y).collect();
        assert_eq!(ys, vec![0, 800, 1700, 2000]);
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn first_capture_failure_is_fatal() {
        let mut d = ScriptedDriver::new(vec![5000]);
        d.fail_capture_at = Some(0);
        let err = run(&mut d, &config(1000, 100)).await.unwrap_err();
        assert_eq!(err.code(), "CAPTURE_FAILED");
    }

    #[tokio::test]
    async fn later_capture_failure_keeps_frames() {
        let mut d = ScriptedDriver::new(vec![5000]);
        d.fail_capture_at = Some(2);
        let out = run(&mut d, &config(1000, 100)).await.unwrap();
        assert_eq!(out.frames.len(), 2);
        assert_eq!(codes(&out), vec![WarningCode::CaptureStepFailed]);
        assert_eq!(out.warnings[0].step, Some(2));
    }

    #[tokio::test]
    async fn stuck_scroll_is_reported() {
        let mut d = ScriptedDriver::new(vec![5000]);
        d.stuck = true;
        let out = run(&mut d, &config(1000, 100)).await.unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(codes(&out), vec![WarningCode::ScrollStall]);
    }

    #[tokio::test]
    async fn mask_failures_are_informational() {
        let mut d = ScriptedDriver::new(vec![500]);
        d.missing_selector = Some(".ad-slot".into());
        let out = run(&mut d, &config(1000, 100)).await.unwrap();
        assert_eq!(codes(&out), vec![WarningCode::MaskFailed]);
        assert!(out.warnings[0].message.contains(".ad-slot"));
    }

    #[tokio::test]
    async fn cancelled_sweep_returns_cancelled() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let mut d = ScriptedDriver::new(vec![5000]);
        let err = sweep(&mut d, &config(1000, 100), Duration::from_secs(5), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(d.captures, 0);
    }
}
