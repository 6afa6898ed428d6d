//! Recognition service: tile image in, structured text blocks out.
//!
//! Two implementations ship with the crate:
//!
//! * [`HttpRecognizer`] talks to an olmOCR-style inference server
//!   (`POST {endpoint}` with a base64 PNG, JSON back).
//! * [`VisionRecognizer`] drives any `edgequake_llm` vision provider with the
//!   policy's prompt template.
//!
//! Both map transport failures onto [`RecognitionError`] so the OCR engine
//! can tell back-off signals from hard failures.

use crate::error::RecognitionError;
use crate::pipeline::encode::{image_data, to_base64};
use crate::pipeline::postprocess::{clean_chunk, is_table_row};
use crate::policy::{OcrPolicy, Precision};
use crate::prompts::render_prompt;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Structural role of a recognized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Heading { level: u8 },
    Paragraph,
    ListItem,
    /// A GFM table, possibly only a fragment of one.
    Table,
    Code,
}

/// Vertical extent of a block inside its tile, tile pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpan {
    pub top: u32,
    pub bottom: u32,
}

/// One recognized block of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub kind: BlockKind,
    pub text: String,
    /// Present only when the service reports geometry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<BlockSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl TextBlock {
    pub fn new(kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            span: None,
            confidence: None,
        }
    }

    /// Markdown form of the block.
    pub fn to_markdown(&self) -> String {
        match &self.kind {
            BlockKind::Heading { level } => {
                format!("{} {}", "#".repeat((*level).clamp(1, 6) as usize), self.text)
            }
            _ => self.text.clone(),
        }
    }
}

/// One tile submitted for recognition.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    /// `tile_0003`
    pub tile_id: String,
    pub png: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    /// Rows at the top repeated from the previous tile.
    pub overlap_px: u32,
    pub policy: OcrPolicy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognitionResponse {
    pub blocks: Vec<TextBlock>,
    pub confidence: Option<f32>,
    pub request_id: Option<String>,
}

/// Anything that can turn a tile into text blocks.
#[async_trait]
pub trait RecognitionService: Send + Sync {
    async fn recognize(
        &self,
        request: &RecognitionRequest,
    ) -> Result<RecognitionResponse, RecognitionError>;
}

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").unwrap());
static RE_LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d{1,3}[.)])\s+").unwrap());

/// Split cleaned Markdown into typed blocks.
///
/// Headings and list items are one line each; contiguous table rows form
/// one table block; fenced code is kept whole; other non-blank lines are
/// grouped into paragraphs.
pub fn blocks_from_markdown(markdown: &str) -> Vec<TextBlock> {
    fn flush(kind: &mut Option<BlockKind>, buf: &mut Vec<String>, out: &mut Vec<TextBlock>) {
        if let Some(k) = kind.take() {
            if !buf.is_empty() {
                out.push(TextBlock::new(k, buf.join("\n")));
            }
        }
        buf.clear();
    }

    let mut out = Vec::new();
    let mut kind: Option<BlockKind> = None;
    let mut buf: Vec<String> = Vec::new();

    for line in markdown.lines() {
        if kind == Some(BlockKind::Code) {
            buf.push(line.to_string());
            if line.trim_start().starts_with("```") {
                flush(&mut kind, &mut buf, &mut out);
            }
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush(&mut kind, &mut buf, &mut out);
            continue;
        }
        if trimmed.starts_with("```") {
            flush(&mut kind, &mut buf, &mut out);
            kind = Some(BlockKind::Code);
            buf.push(line.to_string());
            continue;
        }
        if let Some(caps) = RE_HEADING.captures(trimmed) {
            flush(&mut kind, &mut buf, &mut out);
            out.push(TextBlock::new(
                BlockKind::Heading {
                    level: caps[1].len() as u8,
                },
                caps[2].to_string(),
            ));
            continue;
        }
        if is_table_row(trimmed) {
            if kind != Some(BlockKind::Table) {
                flush(&mut kind, &mut buf, &mut out);
                kind = Some(BlockKind::Table);
            }
            buf.push(trimmed.to_string());
            continue;
        }
        if RE_LIST_ITEM.is_match(line) {
            flush(&mut kind, &mut buf, &mut out);
            out.push(TextBlock::new(BlockKind::ListItem, line.trim_end().to_string()));
            continue;
        }
        if kind != Some(BlockKind::Paragraph) {
            flush(&mut kind, &mut buf, &mut out);
            kind = Some(BlockKind::Paragraph);
        }
        buf.push(trimmed.to_string());
    }
    flush(&mut kind, &mut buf, &mut out);
    out
}

// ── HTTP (olmOCR server) ──────────────────────────────────────────────────

/// Client for olmOCR-compatible inference servers.
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    client: reqwest::Client,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpRecognizer {
    pub fn new(timeout: Duration, api_key: Option<String>) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognitionError::Rejected(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            timeout,
        })
    }

    /// Same as [`HttpRecognizer::new`], with the key read from `MDWB_OCR_API_KEY`.
    pub fn from_env(timeout: Duration) -> Result<Self, RecognitionError> {
        let key = std::env::var("MDWB_OCR_API_KEY").ok().filter(|k| !k.is_empty());
        Self::new(timeout, key)
    }

    fn payload(request: &RecognitionRequest) -> Value {
        serde_json::json!({
            "model": request.policy.model,
            "input": [{ "id": request.tile_id, "image": to_base64(&request.png) }],
            "prompt": render_prompt(&request.policy.prompt_template, &request.tile_id, request.overlap_px),
            "options": { "fp8": request.policy.precision == Precision::Fp8 },
        })
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl RecognitionService for HttpRecognizer {
    async fn recognize(
        &self,
        request: &RecognitionRequest,
    ) -> Result<RecognitionResponse, RecognitionError> {
        let endpoint = &request.policy.endpoint;
        let mut req = self.client.post(endpoint).json(&Self::payload(request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RecognitionError::Timeout {
                    elapsed: self.timeout,
                }
            } else {
                RecognitionError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RecognitionError::RateLimited {
                endpoint: endpoint.clone(),
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(RecognitionError::Transient(format!("HTTP {status} from {endpoint}")));
        }
        if !status.is_success() {
            return Err(RecognitionError::Rejected(format!("HTTP {status} from {endpoint}")));
        }

        let header_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RecognitionError::Timeout {
                    elapsed: self.timeout,
                }
            } else {
                RecognitionError::Transient(format!("unreadable body: {e}"))
            }
        })?;

        let mut parsed = parse_response(&body)?;
        if header_id.is_some() {
            parsed.request_id = header_id;
        }
        debug!(
            "{}: {} blocks from {} (request {:?})",
            request.tile_id,
            parsed.blocks.len(),
            endpoint,
            parsed.request_id
        );
        Ok(parsed)
    }
}

fn entry_markdown(entry: &Value) -> Option<&str> {
    entry
        .get("markdown")
        .or_else(|| entry.get("content"))
        .and_then(Value::as_str)
}

fn structured_block(entry: &Value) -> Option<TextBlock> {
    let text = entry.get("text").and_then(Value::as_str)?.trim().to_string();
    let kind = match entry.get("kind").or_else(|| entry.get("type")).and_then(Value::as_str) {
        Some("heading") => BlockKind::Heading {
            level: entry
                .get("level")
                .and_then(Value::as_u64)
                .unwrap_or(2)
                .clamp(1, 6) as u8,
        },
        Some("list_item") => BlockKind::ListItem,
        Some("table") => BlockKind::Table,
        Some("code") => BlockKind::Code,
        _ => BlockKind::Paragraph,
    };
    let span = match (
        entry.get("top").and_then(Value::as_u64),
        entry.get("bottom").and_then(Value::as_u64),
    ) {
        (Some(top), Some(bottom)) if bottom >= top => Some(BlockSpan {
            top: top as u32,
            bottom: bottom as u32,
        }),
        _ => None,
    };
    Some(TextBlock {
        kind,
        text,
        span,
        confidence: entry
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| c as f32),
    })
}

/// Normalise the response shapes olmOCR-style servers return.
///
/// Accepted: `{"blocks": [...]}` with geometry, `{"results": [{markdown}]}`,
/// `{"data": [{content}]}`, or a bare `{"markdown": ...}`/`{"content": ...}`.
pub fn parse_response(body: &Value) -> Result<RecognitionResponse, RecognitionError> {
    let malformed = || RecognitionError::Transient("OCR response has no recognizable content".into());
    if !body.is_object() {
        return Err(RecognitionError::Transient("OCR response must be a JSON object".into()));
    }
    let confidence = body.get("confidence").and_then(Value::as_f64).map(|c| c as f32);
    let request_id = body
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(blocks) = body.get("blocks").and_then(Value::as_array) {
        let blocks = blocks.iter().filter_map(structured_block).collect();
        return Ok(RecognitionResponse {
            blocks,
            confidence,
            request_id,
        });
    }

    let entry = ["results", "data"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_array).and_then(|a| a.first()));
    let markdown = match entry {
        Some(e) => entry_markdown(e).ok_or_else(malformed)?,
        None => entry_markdown(body).ok_or_else(malformed)?,
    };
    let entry_confidence = entry
        .and_then(|e| e.get("confidence"))
        .and_then(Value::as_f64)
        .map(|c| c as f32);

    Ok(RecognitionResponse {
        blocks: blocks_from_markdown(&clean_chunk(markdown)),
        confidence: entry_confidence.or(confidence),
        request_id,
    })
}

// ── Vision LLM ────────────────────────────────────────────────────────────

/// Recognizer backed by a multimodal chat model.
pub struct VisionRecognizer {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl VisionRecognizer {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            temperature: 0.0,
            max_tokens: 4096,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Map a provider error message onto the engine's signals.
fn classify_provider_error(message: &str) -> RecognitionError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        RecognitionError::RateLimited {
            endpoint: "llm-provider".into(),
            retry_after: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        RecognitionError::Timeout {
            elapsed: Duration::ZERO,
        }
    } else if ["400", "401", "403", "404", "invalid", "unsupported"]
        .iter()
        .any(|m| lower.contains(m))
    {
        RecognitionError::Rejected(message.to_string())
    } else {
        RecognitionError::Transient(message.to_string())
    }
}

#[async_trait]
impl RecognitionService for VisionRecognizer {
    async fn recognize(
        &self,
        request: &RecognitionRequest,
    ) -> Result<RecognitionResponse, RecognitionError> {
        let prompt = render_prompt(
            &request.policy.prompt_template,
            &request.tile_id,
            request.overlap_px,
        );
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user_with_images("", vec![image_data(&request.png)]),
        ];
        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| classify_provider_error(&format!("{e}")))?;
        debug!(
            "{}: {} input tokens, {} output tokens",
            request.tile_id, response.prompt_tokens, response.completion_tokens
        );
        Ok(RecognitionResponse {
            blocks: blocks_from_markdown(&clean_chunk(&response.content)),
            confidence: None,
            request_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn markdown_splits_into_typed_blocks() {
        let md = "# Pricing\n\nPlans start at $5.\nBilled monthly.\n\n- Free tier\n- Pro tier\n\n| Plan | Price |\n| --- | --- |\n| Pro | $5 |\n\n```\nlet x = 1;\n\nlet y = 2;\n```";
        let blocks = blocks_from_markdown(md);
        let kinds: Vec<&BlockKind> = blocks.iter().map(|b| &b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                &BlockKind::Heading { level: 1 },
                &BlockKind::Paragraph,
                &BlockKind::ListItem,
                &BlockKind::ListItem,
                &BlockKind::Table,
                &BlockKind::Code,
            ]
        );
        assert_eq!(blocks[0].text, "Pricing");
        assert_eq!(blocks[1].text, "Plans start at $5.\nBilled monthly.");
        assert_eq!(blocks[4].text.lines().count(), 3);
        assert!(blocks[5].text.contains("let y = 2;"));
    }

    #[test]
    fn heading_round_trips_to_markdown() {
        let b = &blocks_from_markdown("### Setup ###")[0];
        assert_eq!(b.kind, BlockKind::Heading { level: 3 });
        assert_eq!(b.to_markdown(), "### Setup");
    }

    #[test]
    fn parses_results_shape() {
        let body = json!({"results": [{"markdown": "```markdown\n# A\n\nbody\n```", "confidence": 0.9}]});
        let r = parse_response(&body).unwrap();
        assert_eq!(r.blocks.len(), 2);
        assert_eq!(r.confidence, Some(0.9));
    }

    #[test]
    fn parses_single_content_shape() {
        let body = json!({"content": "hello", "request_id": "req-1"});
        let r = parse_response(&body).unwrap();
        assert_eq!(r.blocks[0].text, "hello");
        assert_eq!(r.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn parses_structured_blocks_with_geometry() {
        let body = json!({"blocks": [
            {"kind": "heading", "level": 2, "text": "Intro", "top": 0, "bottom": 40},
            {"kind": "paragraph", "text": "Body", "top": 50, "bottom": 120, "confidence": 0.7}
        ]});
        let r = parse_response(&body).unwrap();
        assert_eq!(r.blocks[0].kind, BlockKind::Heading { level: 2 });
        assert_eq!(r.blocks[1].span, Some(BlockSpan { top: 50, bottom: 120 }));
        assert_eq!(r.blocks[1].confidence, Some(0.7));
    }

    #[test]
    fn malformed_body_is_transient() {
        let err = parse_response(&json!({"status": "ok"})).unwrap_err();
        assert!(matches!(err, RecognitionError::Transient(_)));
        assert!(parse_response(&json!([1, 2])).is_err());
    }

    #[test]
    fn provider_errors_are_classified() {
        assert!(classify_provider_error("HTTP 429 Too Many Requests").is_throttle());
        assert!(classify_provider_error("request timed out").is_throttle());
        assert!(!classify_provider_error("400 invalid image").is_retryable());
        assert!(matches!(
            classify_provider_error("connection reset by peer"),
            RecognitionError::Transient(_)
        ));
    }

    #[test]
    fn payload_carries_precision_and_prompt() {
        let policy = crate::policy::PolicyTable::default()
            .get(crate::policy::PolicyName::GlmOcr)
            .cloned()
            .unwrap();
        let req = RecognitionRequest {
            tile_id: "tile_0001".into(),
            png: Arc::new(vec![1, 2, 3]),
            width: 10,
            height: 10,
            overlap_px: 24,
            policy,
        };
        let p = HttpRecognizer::payload(&req);
        assert_eq!(p["options"]["fp8"], json!(false));
        assert_eq!(p["input"][0]["id"], json!("tile_0001"));
        assert!(p["prompt"].as_str().unwrap().contains("24 pixels"));
    }
}
