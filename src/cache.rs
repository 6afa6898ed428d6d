//! Deterministic cache keys.
//!
//! A key is the SHA-256 of a canonical JSON document holding every input
//! that changes the output: the capture config (renderer version included),
//! tiler geometry, the primary OCR policy with its model and prompt, the
//! policy-table version, and the stitch/dedup options. Object keys are
//! sorted by `serde_json`, so field order never leaks into the hash.
//! Endpoints, API keys, timeouts and concurrency limits are deliberately
//! absent.

use crate::config::{CaptureConfig, PipelineSettings};
use crate::error::CaptureError;
use crate::pipeline::encode::sha256_hex;
use crate::policy::{OcrPolicy, OCR_POLICY_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(
        config: &CaptureConfig,
        settings: &PipelineSettings,
        policy: &OcrPolicy,
    ) -> Result<Self, CaptureError> {
        let canonical = canonical_inputs(config, settings, policy)?;
        Ok(Self(sha256_hex(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_inputs(
    config: &CaptureConfig,
    settings: &PipelineSettings,
    policy: &OcrPolicy,
) -> Result<String, CaptureError> {
    let doc = json!({
        "capture": config,
        "tiler": settings.tiler,
        "ocr": {
            "policy": policy.name,
            "model": policy.model,
            "prompt": policy.prompt_template,
            "precision": policy.precision,
            "max_tile_dimension": policy.max_tile_dimension,
            "fallback": policy.fallback,
            "policy_version": OCR_POLICY_VERSION,
        },
        "stitch": settings.stitch,
        "dedup": settings.dedup,
        "links_appendix": settings.links_appendix,
    });
    serde_json::to_string(&doc)
        .map_err(|e| CaptureError::Internal(format!("cache key serialisation: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyName, PolicyTable};

    fn policy() -> OcrPolicy {
        PolicyTable::default()
            .get(PolicyName::OlmOcrFp8)
            .cloned()
            .unwrap()
    }

    fn config() -> CaptureConfig {
        CaptureConfig::builder("https://example.com/docs")
            .viewport(1280, 800)
            .build()
            .unwrap()
    }

    #[test]
    fn equal_inputs_give_equal_keys() {
        let s = PipelineSettings::default();
        let a = CacheKey::compute(&config(), &s, &policy()).unwrap();
        let b = CacheKey::compute(&config(), &s, &policy()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn output_affecting_inputs_change_the_key() {
        let s = PipelineSettings::default();
        let base = CacheKey::compute(&config(), &s, &policy()).unwrap();

        let moved = CaptureConfig::builder("https://example.com/docs")
            .viewport(1280, 800)
            .renderer_version("chromium-999")
            .build()
            .unwrap();
        assert_ne!(base, CacheKey::compute(&moved, &s, &policy()).unwrap());

        let mut tiler = s.clone();
        tiler.tiler.target_long_side = 1024;
        assert_ne!(base, CacheKey::compute(&config(), &tiler, &policy()).unwrap());

        let mut other = policy();
        other.model = "olmocr-next".into();
        assert_ne!(base, CacheKey::compute(&config(), &s, &other).unwrap());
    }

    #[test]
    fn transport_settings_do_not_change_the_key() {
        let s = PipelineSettings::default();
        let base = CacheKey::compute(&config(), &s, &policy()).unwrap();
        let mut tuned = s.clone();
        tuned.ocr.max_concurrency = 32;
        tuned.job_timeout_ms = 1;
        let mut moved = policy();
        moved.endpoint = "http://10.0.0.2:8000/v1/ocr".into();
        assert_eq!(base, CacheKey::compute(&config(), &tuned, &moved).unwrap());
    }
}
