//! OCR policies: which model, where, and under what constraints.
//!
//! A policy is plain data. The set of names is closed ([`PolicyName`]) and
//! selecting one is a table lookup, so the fallback chain is visible in the
//! configuration rather than buried in control flow.

use crate::prompts::{GLM_OCR_PROMPT, OLMOCR_PROMPT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Bumped whenever a default endpoint, prompt, or constraint changes.
/// Part of the cache key: a new policy version invalidates cached Markdown.
pub const OCR_POLICY_VERSION: &str = "2025-06.1";

/// The closed set of OCR policies the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyName {
    /// olmOCR served with FP8 weights. Fast, the default primary.
    OlmOcrFp8,
    /// olmOCR served with BF16 weights. Slower, more accurate on dense text.
    OlmOcrBf16,
    /// GLM vision OCR behind an OpenAI-compatible endpoint.
    GlmOcr,
}

impl PolicyName {
    pub const ALL: [PolicyName; 3] = [PolicyName::OlmOcrFp8, PolicyName::OlmOcrBf16, PolicyName::GlmOcr];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::OlmOcrFp8 => "olmocr-fp8",
            PolicyName::OlmOcrBf16 => "olmocr-bf16",
            PolicyName::GlmOcr => "glm-ocr",
        }
    }

    fn env_key(&self) -> &'static str {
        match self {
            PolicyName::OlmOcrFp8 => "MDWB_OCR_OLMOCR_FP8_URL",
            PolicyName::OlmOcrBf16 => "MDWB_OCR_OLMOCR_BF16_URL",
            PolicyName::GlmOcr => "MDWB_OCR_GLM_URL",
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyName::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown OCR policy '{s}'"))
    }
}

/// Numeric precision requested from the serving stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp8,
    Bf16,
}

/// Whether a result came from the job's primary policy or its fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyRole {
    Primary,
    Fallback,
}

/// One policy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPolicy {
    pub name: PolicyName,
    /// Model identifier sent to the endpoint.
    pub model: String,
    pub endpoint: String,
    /// Largest width or height (px) this policy accepts.
    pub max_tile_dimension: u32,
    pub prompt_template: String,
    pub precision: Precision,
    /// Per-policy in-flight ceiling, applied on top of the job's AIMD window.
    pub concurrency_ceiling: usize,
    pub fallback: Option<PolicyName>,
}

impl OcrPolicy {
    /// True when the tile fits this policy's accepted dimensions.
    pub fn accepts(&self, width: u32, height: u32) -> bool {
        width <= self.max_tile_dimension && height <= self.max_tile_dimension
    }
}

/// Lookup table from [`PolicyName`] to [`OcrPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTable {
    policies: BTreeMap<PolicyName, OcrPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            PolicyName::OlmOcrFp8,
            OcrPolicy {
                name: PolicyName::OlmOcrFp8,
                model: "allenai/olmOCR-2-7B-1025-FP8".into(),
                endpoint: "http://127.0.0.1:8001/v1/ocr".into(),
                max_tile_dimension: 1288,
                prompt_template: OLMOCR_PROMPT.into(),
                precision: Precision::Fp8,
                concurrency_ceiling: 8,
                fallback: Some(PolicyName::OlmOcrBf16),
            },
        );
        policies.insert(
            PolicyName::OlmOcrBf16,
            OcrPolicy {
                name: PolicyName::OlmOcrBf16,
                model: "allenai/olmOCR-2-7B-1025".into(),
                endpoint: "http://127.0.0.1:8002/v1/ocr".into(),
                max_tile_dimension: 1288,
                prompt_template: OLMOCR_PROMPT.into(),
                precision: Precision::Bf16,
                concurrency_ceiling: 4,
                fallback: None,
            },
        );
        policies.insert(
            PolicyName::GlmOcr,
            OcrPolicy {
                name: PolicyName::GlmOcr,
                model: "zai-org/GLM-4.1V-9B-Thinking".into(),
                endpoint: "http://127.0.0.1:8003/v1/ocr".into(),
                max_tile_dimension: 2048,
                prompt_template: GLM_OCR_PROMPT.into(),
                precision: Precision::Bf16,
                concurrency_ceiling: 4,
                fallback: Some(PolicyName::OlmOcrBf16),
            },
        );
        Self { policies }
    }
}

impl PolicyTable {
    /// Default table with endpoints overridden by `MDWB_OCR_*_URL` variables.
    pub fn from_env() -> Self {
        let mut table = Self::default();
        for name in PolicyName::ALL {
            if let Ok(url) = std::env::var(name.env_key()) {
                if !url.is_empty() {
                    if let Some(p) = table.policies.get_mut(&name) {
                        p.endpoint = url;
                    }
                }
            }
        }
        table
    }

    pub fn get(&self, name: PolicyName) -> Option<&OcrPolicy> {
        self.policies.get(&name)
    }

    /// Replace (or add) a policy record.
    pub fn with_policy(mut self, policy: OcrPolicy) -> Self {
        self.policies.insert(policy.name, policy);
        self
    }

    /// The primary followed by its fallback pointers, cycles cut.
    pub fn chain(&self, primary: PolicyName) -> Vec<PolicyName> {
        let mut chain = Vec::new();
        let mut next = Some(primary);
        while let Some(name) = next {
            if chain.contains(&name) {
                break;
            }
            let Some(policy) = self.policies.get(&name) else {
                break;
            };
            chain.push(name);
            next = policy.fallback;
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chain_falls_back_to_bf16() {
        let table = PolicyTable::default();
        assert_eq!(
            table.chain(PolicyName::OlmOcrFp8),
            vec![PolicyName::OlmOcrFp8, PolicyName::OlmOcrBf16]
        );
    }

    #[test]
    fn chain_cuts_cycles() {
        let mut bf16 = PolicyTable::default()
            .get(PolicyName::OlmOcrBf16)
            .cloned()
            .unwrap();
        bf16.fallback = Some(PolicyName::OlmOcrFp8);
        let table = PolicyTable::default().with_policy(bf16);
        assert_eq!(table.chain(PolicyName::OlmOcrFp8).len(), 2);
    }

    #[test]
    fn accepts_respects_dimension() {
        let table = PolicyTable::default();
        let p = table.get(PolicyName::OlmOcrFp8).unwrap();
        assert!(p.accepts(1288, 900));
        assert!(!p.accepts(1289, 900));
    }

    #[test]
    fn parse_round_trip_names() {
        for name in PolicyName::ALL {
            assert_eq!(name.as_str().parse::<PolicyName>().unwrap(), name);
        }
        assert!("tesseract".parse::<PolicyName>().is_err());
    }
}
