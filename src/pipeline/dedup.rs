//! Dedup engine.
//!
//! Two passes over the stitched blocks:
//!
//! 1. **exact**: SHA-256 of the normalised text; a later block whose hash was
//!    already kept is dropped
//! 2. **near**: trigram embedding cosine against kept blocks whose document
//!    position lies within [`DedupConfig::window_px`]; the higher-confidence
//!    block survives, the earlier one on a tie
//!
//! Placeholders for failed tiles and warning blocks are never dropped and
//! never act as a match. Every drop is recorded as a [`DedupDecision`].

use crate::pipeline::encode::sha256_hex;
use crate::pipeline::stitch::StitchedBlock;
use crate::similarity::{normalize_text, TextEmbedding};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enable_near: bool,
    /// Cosine similarity at or above which two blocks are the same text.
    pub near_threshold: f32,
    /// Only blocks this close in the document (CSS px) are compared.
    pub window_px: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enable_near: true,
            near_threshold: 0.92,
            window_px: 1600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupAction {
    DropExact,
    DropNear,
}

/// Why a block was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupDecision {
    pub block_id: usize,
    pub action: DedupAction,
    /// The block that was kept instead.
    pub kept_block_id: usize,
    pub similarity: f32,
    pub text_sha256: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutput {
    pub kept: Vec<StitchedBlock>,
    pub decisions: Vec<DedupDecision>,
}

struct Candidate {
    block: StitchedBlock,
    hash: String,
    embedding: Option<TextEmbedding>,
}

fn text_hash(block: &StitchedBlock) -> Option<String> {
    let norm = normalize_text(&block.text);
    (!norm.is_empty()).then(|| sha256_hex(norm.as_bytes()))
}

/// Drop duplicated blocks, preserving the order of the survivors.
pub fn dedup(blocks: Vec<StitchedBlock>, config: &DedupConfig) -> DedupOutput {
    let mut decisions = Vec::new();

    // Exact pass.
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut survivors: Vec<Candidate> = Vec::with_capacity(blocks.len());
    for block in blocks {
        let hash = match (block.is_protected(), text_hash(&block)) {
            (false, Some(hash)) => hash,
            _ => {
                survivors.push(Candidate {
                    block,
                    hash: String::new(),
                    embedding: None,
                });
                continue;
            }
        };
        if let Some(&kept) = seen.get(&hash) {
            debug!("Block {} duplicates block {} exactly", block.id, kept);
            decisions.push(DedupDecision {
                block_id: block.id,
                action: DedupAction::DropExact,
                kept_block_id: kept,
                similarity: 1.0,
                text_sha256: hash,
                reason: "normalized text hash already kept".into(),
            });
            continue;
        }
        seen.insert(hash.clone(), block.id);
        survivors.push(Candidate {
            block,
            hash,
            embedding: None,
        });
    }

    if !config.enable_near {
        return DedupOutput {
            kept: survivors.into_iter().map(|c| c.block).collect(),
            decisions,
        };
    }

    // Near pass.
    let mut kept: Vec<Candidate> = Vec::with_capacity(survivors.len());
    for mut cand in survivors {
        if cand.hash.is_empty() {
            kept.push(cand);
            continue;
        }
        let emb = TextEmbedding::new(&cand.block.text);
        let matches: Vec<(usize, f32)> = kept
            .iter()
            .enumerate()
            .filter_map(|(i, k)| {
                let other = k.embedding.as_ref()?;
                let distance = k.block.page_y_start.abs_diff(cand.block.page_y_start);
                if distance > config.window_px {
                    return None;
                }
                let sim = emb.cosine(other);
                (sim >= config.near_threshold).then_some((i, sim))
            })
            .collect();
        cand.embedding = Some(emb);

        if matches.is_empty() {
            kept.push(cand);
            continue;
        }

        let wins = matches
            .iter()
            .all(|(i, _)| cand.block.confidence > kept[*i].block.confidence);
        if wins {
            for &(i, sim) in matches.iter().rev() {
                let loser = kept.remove(i);
                debug!(
                    "Block {} replaced by higher-confidence block {} ({:.3})",
                    loser.block.id, cand.block.id, sim
                );
                decisions.push(DedupDecision {
                    block_id: loser.block.id,
                    action: DedupAction::DropNear,
                    kept_block_id: cand.block.id,
                    similarity: sim,
                    text_sha256: loser.hash,
                    reason: format!(
                        "near duplicate with higher confidence ({:.2} > {:.2})",
                        cand.block.confidence, loser.block.confidence
                    ),
                });
            }
            kept.push(cand);
        } else {
            let (best, sim) = matches
                .iter()
                .copied()
                .fold((matches[0].0, matches[0].1), |acc, m| if m.1 > acc.1 { m } else { acc });
            let winner = &kept[best].block;
            debug!("Block {} near-duplicates block {} ({:.3})", cand.block.id, winner.id, sim);
            decisions.push(DedupDecision {
                block_id: cand.block.id,
                action: DedupAction::DropNear,
                kept_block_id: winner.id,
                similarity: sim,
                text_sha256: cand.hash,
                reason: if winner.confidence == cand.block.confidence {
                    "near duplicate, earlier block kept on tie".into()
                } else {
                    format!(
                        "near duplicate with lower confidence ({:.2} < {:.2})",
                        cand.block.confidence, winner.confidence
                    )
                },
            });
        }
    }

    decisions.sort_by_key(|d| d.block_id);
    DedupOutput {
        kept: kept.into_iter().map(|c| c.block).collect(),
        decisions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::BlockKind;

    fn block(id: usize, text: &str, y: u32, confidence: f32) -> StitchedBlock {
        StitchedBlock {
            id,
            kind: BlockKind::Paragraph,
            text: text.into(),
            tiles: vec![id],
            page_y_start: y,
            page_y_end: y + 20,
            provenance: None,
            confidence,
            missing: false,
            warning: false,
            original_heading: None,
            seam: None,
            dom_assists: Vec::new(),
            table_trims: Vec::new(),
        }
    }

    fn ids(out: &DedupOutput) -> Vec<usize> {
        out.kept.iter().map(|b| b.id).collect()
    }

    #[test]
    fn exact_duplicates_are_dropped_after_normalisation() {
        let blocks = vec![
            block(0, "Pricing starts at **$9**", 0, 0.9),
            block(1, "Something else entirely", 40, 0.9),
            block(2, "pricing   starts at $9", 80, 0.9),
        ];
        let out = dedup(blocks, &DedupConfig::default());
        assert_eq!(ids(&out), vec![0, 1]);
        assert_eq!(out.decisions.len(), 1);
        assert_eq!(out.decisions[0].action, DedupAction::DropExact);
        assert_eq!(out.decisions[0].kept_block_id, 0);
    }

    #[test]
    fn near_duplicate_keeps_higher_confidence() {
        let a = "The quick brown fox jumps over the lazy dog near the river bank.";
        let b = "The quick brown fox jumps over the lazy dog near the river bank";
        let out = dedup(
            vec![block(0, a, 0, 0.6), block(1, "Unrelated sentence here.", 30, 0.9), block(2, b, 60, 0.8)],
            &DedupConfig::default(),
        );
        assert_eq!(ids(&out), vec![1, 2]);
        assert_eq!(out.decisions[0].block_id, 0);
        assert_eq!(out.decisions[0].kept_block_id, 2);
    }

    #[test]
    fn near_duplicate_tie_keeps_earlier() {
        let a = "Invoices are emailed on the first business day of every month.";
        let b = "Invoices are emailed on the first business day of every month!";
        let out = dedup(vec![block(0, a, 0, 0.9), block(1, b, 50, 0.9)], &DedupConfig::default());
        assert_eq!(ids(&out), vec![0]);
        assert!(out.decisions[0].reason.contains("tie"));
    }

    #[test]
    fn far_apart_near_duplicates_survive() {
        let a = "Invoices are emailed on the first business day of every month.";
        let b = "Invoices are emailed on the first business day of every month!";
        let out = dedup(vec![block(0, a, 0, 0.9), block(1, b, 5000, 0.9)], &DedupConfig::default());
        assert_eq!(ids(&out), vec![0, 1]);
        assert!(out.decisions.is_empty());
    }

    #[test]
    fn placeholders_and_warnings_are_never_dropped() {
        let mut p1 = block(0, "", 0, 0.0);
        p1.missing = true;
        let mut p2 = block(1, "", 10, 0.0);
        p2.missing = true;
        let mut w = block(2, "> **Warning:** x", 0, 0.0);
        w.warning = true;
        let mut w2 = w.clone();
        w2.id = 3;
        let out = dedup(vec![p1, p2, w, w2], &DedupConfig::default());
        assert_eq!(out.kept.len(), 4);
        assert!(out.decisions.is_empty());
    }

    #[test]
    fn dedup_is_idempotent() {
        let blocks = vec![
            block(0, "Alpha beta gamma delta epsilon", 0, 0.7),
            block(1, "Alpha beta gamma delta epsilon!", 30, 0.9),
            block(2, "Alpha beta gamma delta epsilon", 60, 0.5),
            block(3, "Zeta eta theta", 90, 0.5),
        ];
        let first = dedup(blocks, &DedupConfig::default());
        let second = dedup(first.kept.clone(), &DedupConfig::default());
        assert!(second.decisions.is_empty());
        assert_eq!(ids(&first), ids(&second));
    }
}
