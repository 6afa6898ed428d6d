//! Stitcher: per-tile OCR results → one ordered block list.
//!
//! ## Seams
//!
//! For every tile that overlaps its predecessor the shared pixel band is cut
//! out of both tiles, converted to grayscale, brought to a common size and
//! scored with SSIM. A score at or above [`StitchOptions::ssim_threshold`]
//! marks the seam stable; anything else (including a band that could not be
//! measured) is `SEAM_UNSTABLE` and the later tile's provenance is
//! unverified.
//!
//! ## Overlap text
//!
//! Both tiles recognized the band, so on a stable seam the later tile's copy
//! is removed and the earlier tile's rendering is kept:
//!
//! * positional trim when every block carries a span (blocks lying wholly
//!   inside the band are dropped)
//! * otherwise textual trim: the longest run of trailing lines of the
//!   earlier tile that equals the leading lines of the later one
//!
//! Nothing is trimmed across an unstable seam or after a failed tile.
//!
//! ## Structure repair
//!
//! Headings are clamped so the level never jumps by more than one (a DOM
//! outline, when given, wins). A table that continues across a seam and
//! repeats its header row has the header dropped and the rows appended to
//! the earlier table; the drop is recorded as a [`TableHeaderTrim`].
//!
//! ## DOM assists
//!
//! A recognized line that looks garbled (see [`LineIssue`]) is swapped for
//! DOM text with the same [`overlay_key`], and the swap is kept as a
//! [`DomAssist`]. Code and table blocks are never touched.

use crate::manifest::{ManifestWarning, WarningCode};
use crate::pipeline::encode::gray_sha256;
use crate::pipeline::links::{overlay_key, DomHeading, DomOutline, DomTextOverlay};
use crate::pipeline::ocr::OcrResult;
use crate::pipeline::postprocess::{finish_document, is_separator_row, is_table_row};
use crate::pipeline::tile::Tile;
use crate::recognizer::{BlockKind, TextBlock};
use crate::similarity::{normalize_text, ssim, TextEmbedding};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Text of the block emitted when no tile could be recognized.
pub const NO_CONTENT_WARNING: &str =
    "> **Warning:** no tile of this page could be recognized; the capture produced no text.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchOptions {
    /// Minimum SSIM for a seam to count as continuous content.
    pub ssim_threshold: f64,
    /// Longest overlap run, in lines, the textual trim will look for.
    pub max_trim_lines: usize,
    pub normalize_headings: bool,
    pub trim_table_headers: bool,
    /// Cosine similarity above which two table headers are the same header.
    pub table_header_similarity: f32,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            ssim_threshold: 0.90,
            max_trim_lines: 40,
            normalize_headings: true,
            trim_table_headers: true,
            table_header_similarity: 0.92,
        }
    }
}

/// Where a piece of output came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub tile_id: String,
    pub tile_index: usize,
    /// Document range, CSS px.
    pub y_start: u32,
    pub y_end: u32,
    pub sha256: String,
    pub scale: f32,
    /// False when the seam above this tile was unstable.
    pub verified: bool,
}

impl Provenance {
    fn of_tile(tile: &Tile, verified: bool) -> Self {
        Self {
            tile_id: tile.tile_id(),
            tile_index: tile.index,
            y_start: tile.page_y_start,
            y_end: tile.page_y_end,
            sha256: tile.sha256.clone(),
            scale: tile.scale,
            verified,
        }
    }
}

/// Per-tile provenance header used when rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSource {
    pub provenance: Provenance,
    /// Tile height in tile pixels.
    pub height: u32,
    pub missing: bool,
}

/// Result of comparing the shared band of two adjacent tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeamMarker {
    pub prev_tile: usize,
    pub next_tile: usize,
    /// Band height in the later tile's pixels.
    pub overlap_px: u32,
    pub ssim: Option<f64>,
    /// SHA-256 of the earlier tile's normalised band.
    pub fingerprint: String,
    /// Both bands hashed identically after normalisation.
    pub exact_match: bool,
    pub stable: bool,
}

/// Why a recognized line was treated as garbled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineIssue {
    /// Contains U+FFFD.
    ReplacementChar,
    /// Three or more of `!`, `?`, `…`.
    Punctuation,
    /// Digits and letters mixed in one line.
    MixedNumeric,
    /// Under 45% letters in a line of six or more characters.
    LowAlpha,
    /// Ends in `-` and the next line starts lowercase.
    HyphenBreak,
}

impl fmt::Display for LineIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LineIssue::ReplacementChar => "replacement-char",
            LineIssue::Punctuation => "punctuation",
            LineIssue::MixedNumeric => "mixed-numeric",
            LineIssue::LowAlpha => "low-alpha",
            LineIssue::HyphenBreak => "hyphen-break",
        })
    }
}

/// A recognized line replaced by DOM text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomAssist {
    pub tile_index: usize,
    /// Line number within the tile's recognized blocks, from 0. Blank
    /// lines between blocks are not counted.
    pub line: usize,
    pub reason: LineIssue,
    pub dom_text: String,
    pub original_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimReason {
    Identical,
    Similar,
}

impl fmt::Display for TrimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrimReason::Identical => "identical",
            TrimReason::Similar => "similar",
        })
    }
}

/// A repeated table header dropped while merging a continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableHeaderTrim {
    /// Tile whose header row was dropped.
    pub tile_index: usize,
    pub reason: TrimReason,
    /// Header cosine similarity, only for [`TrimReason::Similar`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

/// One block of the stitched document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchedBlock {
    pub id: usize,
    pub kind: BlockKind,
    pub text: String,
    /// Tiles that contributed, first one is the origin.
    pub tiles: Vec<usize>,
    pub page_y_start: u32,
    pub page_y_end: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    pub confidence: f32,
    /// Placeholder for a tile whose OCR failed.
    #[serde(default)]
    pub missing: bool,
    /// Document-level warning, not page content.
    #[serde(default)]
    pub warning: bool,
    /// Heading line as recognized, when normalisation changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_heading: Option<String>,
    /// Seam that follows this block, when it is the last one before a tile boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seam: Option<SeamMarker>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dom_assists: Vec<DomAssist>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub table_trims: Vec<TableHeaderTrim>,
}

impl StitchedBlock {
    pub fn to_markdown(&self) -> String {
        match &self.kind {
            BlockKind::Heading { level } => {
                format!("{} {}", "#".repeat((*level).clamp(1, 6) as usize), self.text)
            }
            _ => self.text.clone(),
        }
    }

    /// Blocks the dedup engine must never drop.
    pub fn is_protected(&self) -> bool {
        self.missing || self.warning
    }

    pub fn origin_tile(&self) -> Option<usize> {
        self.tiles.first().copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StitchOutput {
    pub blocks: Vec<StitchedBlock>,
    pub seams: Vec<SeamMarker>,
    pub sources: Vec<TileSource>,
    pub warnings: Vec<ManifestWarning>,
    pub dom_assists: Vec<DomAssist>,
    pub usable_tiles: usize,
}

/// Walks the DOM heading outline in document order.
struct HeadingGuide<'a> {
    headings: &'a [DomHeading],
    cursor: usize,
}

impl<'a> HeadingGuide<'a> {
    fn new(headings: &'a [DomHeading]) -> Self {
        Self { headings, cursor: 0 }
    }

    fn target_level(&mut self, text: &str) -> Option<u8> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return None;
        }
        let offset = self.headings[self.cursor..]
            .iter()
            .position(|h| h.normalized == normalized)?;
        let heading = &self.headings[self.cursor + offset];
        self.cursor += offset + 1;
        Some(heading.level.clamp(1, 6))
    }
}

/// DOM overlays by key; the first overlay with a key wins.
struct OverlayIndex<'a> {
    by_key: HashMap<&'a str, &'a DomTextOverlay>,
}

impl<'a> OverlayIndex<'a> {
    fn new(overlays: &'a [DomTextOverlay]) -> Self {
        let mut by_key = HashMap::new();
        for overlay in overlays {
            by_key.entry(overlay.normalized.as_str()).or_insert(overlay);
        }
        Self { by_key }
    }

    fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn lookup(&self, line: &str) -> Option<&'a DomTextOverlay> {
        let key = overlay_key(line.trim_start_matches(|c: char| c == '#' || c.is_whitespace()));
        if key.is_empty() {
            return None;
        }
        self.by_key.get(key.as_str()).copied()
    }
}

fn line_issue(line: &str, next: Option<&str>) -> Option<LineIssue> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }
    if s.contains('\u{FFFD}') {
        return Some(LineIssue::ReplacementChar);
    }
    if s.chars().filter(|c| matches!(c, '!' | '?' | '…')).count() >= 3 {
        return Some(LineIssue::Punctuation);
    }
    if s.chars().any(char::is_numeric) && s.chars().any(char::is_alphabetic) {
        return Some(LineIssue::MixedNumeric);
    }
    let len = s.chars().count();
    let alpha = s.chars().filter(|c| c.is_alphabetic()).count();
    if len >= 6 && (alpha as f32) < 0.45 * len as f32 {
        return Some(LineIssue::LowAlpha);
    }
    if s.ends_with('-') && next.and_then(|n| n.chars().next()).is_some_and(char::is_lowercase) {
        return Some(LineIssue::HyphenBreak);
    }
    None
}

/// Keep a leading `##` run, replace the rest with `dom_text`.
fn merge_overlay(line: &str, dom_text: &str) -> String {
    let stripped = line.trim_start();
    match stripped.split_once(' ') {
        Some((hashes, _)) if !hashes.is_empty() && hashes.chars().all(|c| c == '#') => {
            format!("{hashes} {dom_text}")
        }
        _ => dom_text.to_string(),
    }
}

/// Swap garbled lines of `text` for DOM text. `first_line` numbers the
/// first line within its tile.
fn apply_overlays(
    text: &str,
    index: &OverlayIndex<'_>,
    tile_index: usize,
    first_line: usize,
) -> (String, Vec<DomAssist>) {
    let lines: Vec<&str> = text.lines().collect();
    let mut assists = Vec::new();
    let mut out = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let replacement = line_issue(line, lines.get(i + 1).copied()).and_then(|reason| {
            let overlay = index.lookup(line)?;
            let merged = merge_overlay(line, &overlay.text);
            (merged.trim() != line.trim()).then(|| {
                assists.push(DomAssist {
                    tile_index,
                    line: first_line + i,
                    reason,
                    dom_text: overlay.text.clone(),
                    original_text: line.trim().to_string(),
                });
                merged
            })
        });
        out.push(replacement.unwrap_or_else(|| line.to_string()));
    }
    if assists.is_empty() {
        return (text.to_string(), assists);
    }
    (out.join("\n"), assists)
}

fn band(img: &RgbaImage, top: u32, bottom: u32) -> Option<GrayImage> {
    if img.width() == 0 || top >= img.height() || bottom <= top {
        return None;
    }
    let h = bottom.min(img.height()) - top;
    let crop = imageops::crop_imm(img, 0, top, img.width(), h).to_image();
    Some(DynamicImage::ImageRgba8(crop).to_luma8())
}

/// Compare the band `cur` shares with `prev`.
pub fn measure_seam(prev: &Tile, cur: &Tile, threshold: f64) -> SeamMarker {
    let (top, bottom) =
        prev.rows_for_page_span(cur.page_y_start, cur.page_y_start + cur.overlap_page_px);
    let a = band(&prev.pixels, top, bottom);
    let b = band(&cur.pixels, 0, cur.overlap_px);

    let (score, fingerprint, exact_match) = match (a, b) {
        (Some(a), Some(b)) => {
            let w = a.width().min(b.width());
            let h = a.height().min(b.height());
            let fit = |g: GrayImage| {
                if g.dimensions() == (w, h) {
                    g
                } else {
                    imageops::resize(&g, w, h, FilterType::Triangle)
                }
            };
            let (a, b) = (fit(a), fit(b));
            let fa = gray_sha256(&a);
            let exact = fa == gray_sha256(&b);
            (ssim(&a, &b), fa, exact)
        }
        _ => (None, String::new(), false),
    };

    SeamMarker {
        prev_tile: prev.index,
        next_tile: cur.index,
        overlap_px: cur.overlap_px,
        ssim: score,
        fingerprint,
        exact_match,
        stable: score.is_some_and(|s| s >= threshold),
    }
}

fn content_lines(blocks: &[TextBlock]) -> Vec<String> {
    blocks
        .iter()
        .flat_map(|b| b.text.lines())
        .map(normalize_text)
        .filter(|l| !l.is_empty())
        .collect()
}

/// Longest `k <= max` with `prev[len-k..] == cur[..k]`.
fn shared_run(prev: &[String], cur: &[String], max: usize) -> usize {
    let limit = max.min(prev.len()).min(cur.len());
    (1..=limit)
        .rev()
        .find(|&k| prev[prev.len() - k..] == cur[..k])
        .unwrap_or(0)
}

/// Remove the first `n` content lines from `blocks`, dropping blocks left empty.
fn drop_leading_lines(blocks: Vec<TextBlock>, mut n: usize) -> Vec<TextBlock> {
    let mut out = Vec::with_capacity(blocks.len());
    for mut block in blocks {
        if n == 0 {
            out.push(block);
            continue;
        }
        let mut kept: Vec<&str> = Vec::new();
        for line in block.text.lines() {
            let content = !normalize_text(line).is_empty();
            if n > 0 {
                if content {
                    n -= 1;
                }
                continue;
            }
            kept.push(line);
        }
        if kept.iter().any(|l| !normalize_text(l).is_empty()) {
            block.text = kept.join("\n");
            block.span = None;
            out.push(block);
        }
    }
    out
}

fn trim_overlap(
    prev_blocks: &[TextBlock],
    blocks: Vec<TextBlock>,
    overlap_px: u32,
    max_lines: usize,
) -> (Vec<TextBlock>, bool) {
    if !blocks.is_empty() && blocks.iter().all(|b| b.span.is_some()) {
        let before = blocks.len();
        let kept: Vec<TextBlock> = blocks
            .into_iter()
            .filter(|b| b.span.is_some_and(|s| s.bottom > overlap_px))
            .collect();
        let trimmed = kept.len() != before;
        return (kept, trimmed);
    }
    let k = shared_run(&content_lines(prev_blocks), &content_lines(&blocks), max_lines);
    if k == 0 {
        return (blocks, false);
    }
    (drop_leading_lines(blocks, k), true)
}

/// `header\nseparator` when a table block opens with one.
fn table_header(text: &str) -> Option<String> {
    let mut lines = text.lines();
    let header = lines.next()?.trim();
    let sep = lines.next()?.trim();
    (is_table_row(header) && is_separator_row(sep)).then(|| format!("{header}\n{sep}"))
}

/// Rows of `text` that continue an earlier table, or `None` when it is a
/// new table. A repeated header is dropped and reported as
/// `(reason, similarity)`.
fn continuation_rows(
    text: &str,
    prev_header: &str,
    threshold: f32,
) -> Option<(String, Option<(TrimReason, Option<f32>)>)> {
    match table_header(text) {
        Some(header) => {
            let trim = if header == prev_header {
                (TrimReason::Identical, None)
            } else {
                let score = TextEmbedding::new(&header).cosine(&TextEmbedding::new(prev_header));
                if score < threshold {
                    return None;
                }
                (TrimReason::Similar, Some(score))
            };
            let rows = text.lines().skip(2).collect::<Vec<_>>().join("\n");
            Some((rows, Some(trim)))
        }
        None => text
            .lines()
            .next()
            .is_some_and(|l| is_table_row(l.trim()))
            .then(|| (text.to_string(), None)),
    }
}

/// Join recognized tiles into one block list.
pub fn stitch(
    tiles: &[Tile],
    results: &[OcrResult],
    dom: &DomOutline,
    options: &StitchOptions,
) -> StitchOutput {
    let by_tile: HashMap<usize, &OcrResult> = results.iter().map(|r| (r.tile_index, r)).collect();
    let usable_tiles = tiles
        .iter()
        .filter(|t| by_tile.get(&t.index).is_some_and(|r| r.is_success()))
        .count();

    let mut out = StitchOutput {
        usable_tiles,
        ..Default::default()
    };
    let mut guide = HeadingGuide::new(&dom.headings);
    let overlays = OverlayIndex::new(&dom.overlays);
    let mut last_level: u8 = 0;
    let mut prev_blocks: Option<&[TextBlock]> = None;

    for (pos, tile) in tiles.iter().enumerate() {
        let seam = match (tile.overlap_with_previous, pos.checked_sub(1).map(|p| &tiles[p])) {
            (true, Some(prev)) => {
                let seam = measure_seam(prev, tile, options.ssim_threshold);
                if !seam.stable {
                    let score = seam.ssim.map_or("n/a".to_string(), |s| format!("{s:.3}"));
                    warn!(
                        "Seam {} → {} unstable (ssim={})",
                        prev.tile_id(),
                        tile.tile_id(),
                        score
                    );
                    out.warnings.push(
                        ManifestWarning::new(
                            WarningCode::SeamUnstable,
                            format!(
                                "seam {} -> {} below threshold (ssim={score})",
                                prev.tile_id(),
                                tile.tile_id()
                            ),
                        )
                        .at_tile(tile.index),
                    );
                }
                if let Some(last) = out.blocks.last_mut() {
                    last.seam = Some(seam.clone());
                }
                out.seams.push(seam.clone());
                Some(seam)
            }
            _ => None,
        };
        let verified = seam.as_ref().map_or(true, |s| s.stable);

        let result = by_tile.get(&tile.index).filter(|r| r.is_success());
        let Some(result) = result else {
            out.sources.push(TileSource {
                provenance: Provenance::of_tile(tile, verified),
                height: tile.height,
                missing: true,
            });
            if usable_tiles > 0 {
                out.blocks.push(StitchedBlock {
                    id: out.blocks.len(),
                    kind: BlockKind::Paragraph,
                    text: String::new(),
                    tiles: vec![tile.index],
                    page_y_start: tile.page_y_start,
                    page_y_end: tile.page_y_end,
                    provenance: Some(Provenance::of_tile(tile, verified)),
                    confidence: 0.0,
                    missing: true,
                    warning: false,
                    original_heading: None,
                    seam: None,
                    dom_assists: Vec::new(),
                    table_trims: Vec::new(),
                });
            }
            prev_blocks = None;
            continue;
        };

        let mut blocks = result.blocks.clone();
        let mut trimmed = false;
        if let (Some(seam), Some(prev)) = (&seam, prev_blocks) {
            if seam.stable {
                let (kept, did_trim) =
                    trim_overlap(prev, blocks, tile.overlap_px, options.max_trim_lines);
                blocks = kept;
                trimmed = did_trim;
            }
        }
        if trimmed {
            debug!("Trimmed overlap text from {}", tile.tile_id());
        }

        out.sources.push(TileSource {
            provenance: Provenance::of_tile(tile, verified),
            height: tile.height,
            missing: false,
        });

        let body_start = if trimmed {
            tile.page_y_start + tile.overlap_page_px
        } else {
            tile.page_y_start
        };

        let mut line_no = 0;
        for (i, block) in blocks.into_iter().enumerate() {
            let first_line = line_no;
            line_no += block.text.lines().count();
            let (y0, y1) = match block.span {
                Some(s) => (tile.page_y_of_row(s.top), tile.page_y_of_row(s.bottom)),
                None => (body_start.min(tile.page_y_end), tile.page_y_end),
            };

            // Table continuing across a stable seam.
            if i == 0 && options.trim_table_headers && block.kind == BlockKind::Table && verified && seam.is_some() {
                if let Some(last) = out.blocks.last_mut() {
                    let prev_header = (last.kind == BlockKind::Table
                        && !last.missing
                        && last.tiles.last() == Some(&tiles[pos - 1].index))
                        .then(|| table_header(&last.text))
                        .flatten();
                    if let Some(prev_header) = prev_header {
                        if let Some((rows, trim)) =
                            continuation_rows(&block.text, &prev_header, options.table_header_similarity)
                        {
                            debug!("Merging table continuation from {}", tile.tile_id());
                            if let Some((reason, similarity)) = trim {
                                last.table_trims.push(TableHeaderTrim {
                                    tile_index: tile.index,
                                    reason,
                                    similarity,
                                });
                            }
                            if !rows.trim().is_empty() {
                                last.text.push('\n');
                                last.text.push_str(rows.trim_end());
                            }
                            last.tiles.push(tile.index);
                            last.page_y_end = last.page_y_end.max(y1);
                            continue;
                        }
                    }
                }
            }

            let (text, dom_assists) =
                if overlays.is_empty() || matches!(block.kind, BlockKind::Code | BlockKind::Table) {
                    (block.text.clone(), Vec::new())
                } else {
                    apply_overlays(&block.text, &overlays, tile.index, first_line)
                };
            for assist in &dom_assists {
                debug!(
                    "DOM assist on {} line {} ({}): {:?} -> {:?}",
                    tile.tile_id(),
                    assist.line,
                    assist.reason,
                    assist.original_text,
                    assist.dom_text
                );
            }
            out.dom_assists.extend(dom_assists.iter().cloned());

            let mut kind = block.kind.clone();
            let mut original_heading = None;
            if let BlockKind::Heading { level } = block.kind {
                let target = match guide.target_level(&text) {
                    Some(dom) => dom,
                    None if !options.normalize_headings => level,
                    None if last_level == 0 => level.min(2),
                    None => level.min(last_level + 1),
                };
                if target != level {
                    original_heading = Some(block.to_markdown());
                    kind = BlockKind::Heading { level: target };
                }
                last_level = target;
            }

            out.blocks.push(StitchedBlock {
                id: out.blocks.len(),
                kind,
                text,
                tiles: vec![tile.index],
                page_y_start: y0,
                page_y_end: y1.max(y0),
                provenance: Some(Provenance {
                    y_start: y0,
                    y_end: y1.max(y0),
                    ..Provenance::of_tile(tile, verified)
                }),
                confidence: block.confidence.or(result.confidence).unwrap_or(1.0),
                missing: false,
                warning: false,
                original_heading,
                seam: None,
                dom_assists,
                table_trims: Vec::new(),
            });
        }
        prev_blocks = Some(&result.blocks);
    }

    if usable_tiles == 0 {
        warn!("No usable tiles out of {}", tiles.len());
        out.sources.clear();
        out.blocks = vec![StitchedBlock {
            id: 0,
            kind: BlockKind::Paragraph,
            text: NO_CONTENT_WARNING.to_string(),
            tiles: Vec::new(),
            page_y_start: 0,
            page_y_end: 0,
            provenance: None,
            confidence: 0.0,
            missing: false,
            warning: true,
            original_heading: None,
            seam: None,
            dom_assists: Vec::new(),
            table_trims: Vec::new(),
        }];
    }
    out
}

fn source_comment(source: &TileSource) -> String {
    let p = &source.provenance;
    format!(
        "<!-- source: {}, y={}, height={}, sha256={}, scale={:.2}, verified={} -->",
        p.tile_id, p.y_start, source.height, p.sha256, p.scale, p.verified
    )
}

fn dom_assist_comment(assist: &DomAssist) -> String {
    format!(
        "<!-- dom-assist: tile={}, line={}, reason={}, replacement={:?} -->",
        assist.tile_index, assist.line, assist.reason, assist.dom_text
    )
}

fn table_trim_comment(trim: &TableHeaderTrim) -> String {
    match trim.similarity {
        Some(score) => format!("<!-- table-header-trimmed reason={} similarity={score:.2} -->", trim.reason),
        None => format!("<!-- table-header-trimmed reason={} -->", trim.reason),
    }
}

fn seam_comment(seam: &SeamMarker) -> String {
    let score = seam.ssim.map_or("n/a".to_string(), |s| format!("{s:.3}"));
    format!(
        "<!-- seam-marker: prev=tile_{:04}, curr=tile_{:04}, overlap_px={}, ssim={}, hash={}, stable={} -->",
        seam.prev_tile, seam.next_tile, seam.overlap_px, score, seam.fingerprint, seam.stable
    )
}

/// Render blocks with provenance comments, seam markers and missing-tile notes.
pub fn render_markdown(
    sources: &[TileSource],
    blocks: &[StitchedBlock],
    seams: &[SeamMarker],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    for block in blocks.iter().filter(|b| b.origin_tile().is_none()) {
        parts.push(block.to_markdown());
    }

    for source in sources {
        let index = source.provenance.tile_index;
        if let Some(seam) = seams.iter().find(|s| s.next_tile == index) {
            parts.push(seam_comment(seam));
        }
        if source.missing {
            parts.push(format!(
                "<!-- missing: {} (OCR failed) -->",
                source.provenance.tile_id
            ));
            continue;
        }
        parts.push(source_comment(source));
        for block in blocks.iter().filter(|b| b.origin_tile() == Some(index)) {
            if let Some(original) = &block.original_heading {
                parts.push(format!("<!-- normalized-heading: {original} -->"));
            }
            parts.extend(block.dom_assists.iter().map(dom_assist_comment));
            parts.extend(block.table_trims.iter().map(table_trim_comment));
            let md = block.to_markdown();
            if !md.trim().is_empty() {
                parts.push(md);
            }
        }
    }

    finish_document(&parts.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TilerConfig;
    use crate::error::TileError;
    use crate::pipeline::capture::ViewportFrame;
    use crate::pipeline::encode::{encode_png, sha256_hex};
    use crate::pipeline::tile::slice;
    use crate::policy::{PolicyName, PolicyRole};
    use crate::recognizer::BlockSpan;
    use chrono::Utc;
    use image::Rgba;
    use std::sync::Arc;

    const W: u32 = 200;
    const VH: u32 = 300;

    fn page(h: u32, seed: u32) -> RgbaImage {
        RgbaImage::from_fn(W, h, |x, y| {
            let v = (x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663) ^ seed.wrapping_mul(83_492_791))
                .wrapping_mul(2_654_435_761);
            let g = (v >> 24) as u8;
            Rgba([g, g, g, 255])
        })
    }

    fn frame(index: usize, scroll_y: u32, overlap_px: u32, img: &RgbaImage) -> ViewportFrame {
        let png = encode_png(img).unwrap();
        ViewportFrame {
            index,
            scroll_y,
            document_height: 700,
            overlap_px,
            viewport_height: img.height(),
            device_scale_factor: 1.0,
            captured_at: Utc::now(),
            png_sha256: sha256_hex(&png),
            png: Arc::new(png),
        }
    }

    /// Three frames at 0 / 180 / 360 over one page, 120px overlap each.
    fn three_tiles(broken_third: bool) -> Vec<Tile> {
        let full = page(660, 0);
        let other = page(660, 99);
        let crop = |src: &RgbaImage, y| imageops::crop_imm(src, 0, y, W, VH).to_image();
        let frames = vec![
            frame(0, 0, 0, &crop(&full, 0)),
            frame(1, 180, 120, &crop(&full, 180)),
            frame(2, 360, 120, &crop(if broken_third { &other } else { &full }, 360)),
        ];
        slice(&frames, &TilerConfig::default()).tiles
    }

    fn ok(tile: usize, md: &str) -> OcrResult {
        OcrResult {
            tile_index: tile,
            blocks: crate::recognizer::blocks_from_markdown(md),
            policy: Some(PolicyName::OlmOcrFp8),
            role: PolicyRole::Primary,
            latency_ms: 10,
            attempt_count: 1,
            confidence: Some(0.9),
            error: None,
        }
    }

    fn failed(tile: usize) -> OcrResult {
        OcrResult {
            tile_index: tile,
            blocks: Vec::new(),
            policy: Some(PolicyName::OlmOcrBf16),
            role: PolicyRole::Fallback,
            latency_ms: 0,
            attempt_count: 4,
            confidence: None,
            error: Some(TileError::OcrFailed {
                tile,
                attempts: 4,
                detail: "503".into(),
            }),
        }
    }

    fn texts(out: &StitchOutput) -> Vec<String> {
        out.blocks.iter().map(|b| b.to_markdown()).collect()
    }

    #[test]
    fn stable_seams_trim_overlap_text_once() {
        let tiles = three_tiles(false);
        assert_eq!(tiles.len(), 3);
        let results = vec![
            ok(0, "# Title\n\nIntro paragraph.\n\nShared band line."),
            ok(1, "Shared band line.\n\nMiddle section.\n\nSecond shared line."),
            ok(2, "Second shared line.\n\nClosing words."),
        ];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert_eq!(out.seams.len(), 2);
        assert!(out.seams.iter().all(|s| s.stable && s.exact_match));
        assert!(out.warnings.is_empty());
        let md = render_markdown(&out.sources, &out.blocks, &out.seams);
        assert_eq!(md.matches("Shared band line.").count(), 1);
        assert_eq!(md.matches("Second shared line.").count(), 1);
        assert_eq!(md.matches("<!-- seam-marker:").count(), 2);
        assert_eq!(md.matches("<!-- source: tile_").count(), 3);
        assert!(md.contains("Closing words."));

        let carriers: Vec<(usize, usize)> = out
            .blocks
            .iter()
            .filter_map(|b| b.seam.as_ref().map(|s| (b.id, s.next_tile)))
            .collect();
        assert_eq!(carriers.len(), 2);
        for (id, next) in carriers {
            let block = &out.blocks[id];
            assert_eq!(block.origin_tile(), Some(next - 1));
            assert_eq!(out.blocks[id + 1].origin_tile(), Some(next));
        }
    }

    #[test]
    fn restitching_is_deterministic() {
        let tiles = three_tiles(false);
        let results = vec![ok(0, "A\n\nB"), ok(1, "B\n\nC"), ok(2, "C\n\nD")];
        let a = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        let b = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert_eq!(texts(&a), texts(&b));
        assert_eq!(texts(&a), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn unstable_seam_keeps_text_and_warns() {
        let tiles = three_tiles(true);
        let results = vec![ok(0, "A\n\nB"), ok(1, "B\n\nC"), ok(2, "C\n\nD")];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert!(out.seams[0].stable);
        assert!(!out.seams[1].stable);
        assert_eq!(texts(&out), vec!["A", "B", "C", "C", "D"]);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].code, WarningCode::SeamUnstable);
        assert_eq!(out.warnings[0].tile, Some(2));
        let last = out.blocks.last().unwrap();
        assert!(!last.provenance.as_ref().unwrap().verified);
        let md = render_markdown(&out.sources, &out.blocks, &out.seams);
        assert!(md.contains("verified=false"));
    }

    #[test]
    fn positional_trim_uses_spans() {
        let tiles = three_tiles(false);
        let mut r1 = ok(1, "");
        r1.blocks = vec![
            TextBlock {
                span: Some(BlockSpan { top: 10, bottom: 100 }),
                ..TextBlock::new(BlockKind::Paragraph, "inside band")
            },
            TextBlock {
                span: Some(BlockSpan { top: 110, bottom: 200 }),
                ..TextBlock::new(BlockKind::Paragraph, "straddles band")
            },
        ];
        let results = vec![ok(0, "inside band"), r1, ok(2, "tail")];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert_eq!(texts(&out), vec!["inside band", "straddles band", "tail"]);
        let straddle = &out.blocks[1];
        assert_eq!((straddle.page_y_start, straddle.page_y_end), (290, 380));
    }

    #[test]
    fn failed_tile_becomes_placeholder_without_trim() {
        let tiles = three_tiles(false);
        let results = vec![ok(0, "A\n\nB"), failed(1), ok(2, "B\n\nC")];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert_eq!(out.usable_tiles, 2);
        assert!(out.blocks[2].missing);
        assert!(out.blocks[2].text.is_empty());
        assert_eq!(texts(&out), vec!["A", "B", "", "B", "C"]);
        let md = render_markdown(&out.sources, &out.blocks, &out.seams);
        assert!(md.contains("<!-- missing: tile_0001 (OCR failed) -->"));
    }

    #[test]
    fn zero_usable_tiles_yield_single_warning_block() {
        let tiles = three_tiles(false);
        let results = vec![failed(0), failed(1), failed(2)];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert_eq!(out.usable_tiles, 0);
        assert_eq!(out.blocks.len(), 1);
        assert!(out.blocks[0].warning);
        let md = render_markdown(&out.sources, &out.blocks, &out.seams);
        assert_eq!(md, format!("{NO_CONTENT_WARNING}\n"));
    }

    #[test]
    fn heading_jumps_are_clamped_and_recorded() {
        let tiles = three_tiles(false);
        let results = vec![ok(0, "### Intro\n\n##### Deep"), ok(1, "x"), ok(2, "y")];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert_eq!(out.blocks[0].kind, BlockKind::Heading { level: 2 });
        assert_eq!(out.blocks[0].original_heading.as_deref(), Some("### Intro"));
        assert_eq!(out.blocks[1].kind, BlockKind::Heading { level: 3 });
        let md = render_markdown(&out.sources, &out.blocks, &out.seams);
        assert!(md.contains("<!-- normalized-heading: ##### Deep -->"));
    }

    #[test]
    fn dom_outline_overrides_heading_level() {
        let tiles = three_tiles(false);
        let dom = DomOutline {
            headings: vec![DomHeading {
                level: 1,
                text: "Intro".into(),
                normalized: "intro".into(),
            }],
            ..Default::default()
        };
        let results = vec![ok(0, "### Intro"), ok(1, "x"), ok(2, "y")];
        let out = stitch(&tiles, &results, &dom, &StitchOptions::default());
        assert_eq!(out.blocks[0].kind, BlockKind::Heading { level: 1 });
    }

    #[test]
    fn repeated_table_header_is_merged() {
        let tiles = three_tiles(false);
        let results = vec![
            ok(0, "| Plan | Price |\n| --- | --- |\n| Free | $0 |"),
            ok(1, "| Plan | Price |\n| --- | --- |\n| Pro | $9 |"),
            ok(2, "Footer"),
        ];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        assert_eq!(out.blocks.len(), 2);
        assert_eq!(out.blocks[0].tiles, vec![0, 1]);
        assert_eq!(
            out.blocks[0].text,
            "| Plan | Price |\n| --- | --- |\n| Free | $0 |\n| Pro | $9 |"
        );
    }

    #[test]
    fn trimmed_table_header_is_recorded_and_rendered() {
        let tiles = three_tiles(false);
        let results = vec![
            ok(0, "| Plan | Price |\n| --- | --- |\n| Free | $0 |"),
            ok(1, "| Plan | Price |\n| --- | --- |\n| Pro | $9 |"),
            ok(2, "Footer"),
        ];
        let out = stitch(&tiles, &results, &DomOutline::default(), &StitchOptions::default());
        let trims = &out.blocks[0].table_trims;
        assert_eq!(trims.len(), 1);
        assert_eq!((trims[0].tile_index, trims[0].reason, trims[0].similarity), (1, TrimReason::Identical, None));
        let md = render_markdown(&out.sources, &out.blocks, &out.seams);
        assert!(md.contains("<!-- table-header-trimmed reason=identical -->"));

        let similar = TableHeaderTrim {
            tile_index: 1,
            reason: TrimReason::Similar,
            similarity: Some(0.956),
        };
        assert_eq!(
            table_trim_comment(&similar),
            "<!-- table-header-trimmed reason=similar similarity=0.96 -->"
        );
    }

    #[test]
    fn near_identical_header_is_trimmed_as_similar() {
        let rows = continuation_rows(
            "| Plan | Price  |\n| --- | --- |\n| Pro | $9 |",
            "| Plan | Price |\n| --- | --- |",
            0.5,
        );
        let (rows, trim) = rows.unwrap();
        assert_eq!(rows, "| Pro | $9 |");
        let (reason, score) = trim.unwrap();
        assert_eq!(reason, TrimReason::Similar);
        assert!(score.is_some_and(|s| s >= 0.5));
        assert!(continuation_rows("| Pro | $9 |", "| Plan | Price |\n| --- | --- |", 0.5)
            .is_some_and(|(_, trim)| trim.is_none()));
    }

    fn overlay(text: &str, source: &str) -> DomTextOverlay {
        DomTextOverlay {
            text: text.into(),
            normalized: overlay_key(text),
            source: source.into(),
        }
    }

    #[test]
    fn garbled_lines_take_dom_text() {
        let tiles = three_tiles(false);
        let dom = DomOutline {
            overlays: vec![overlay("Revenue Q4", "figcaption"), overlay("Net margin", "td")],
            ..Default::default()
        };
        let results = vec![
            ok(0, "Intro text\n\nRevenue Q4???"),
            ok(1, "```\nnet margin!!!\n```"),
            ok(2, "## Net margin?!?"),
        ];
        let out = stitch(&tiles, &results, &dom, &StitchOptions::default());
        assert_eq!(out.dom_assists.len(), 2);
        let first = &out.dom_assists[0];
        assert_eq!((first.tile_index, first.line, first.reason), (0, 1, LineIssue::Punctuation));
        assert_eq!(first.original_text, "Revenue Q4???");
        assert_eq!(out.blocks[1].text, "Revenue Q4");
        assert_eq!(out.blocks[1].dom_assists, vec![first.clone()]);

        let md = render_markdown(&out.sources, &out.blocks, &out.seams);
        assert!(md.contains(
            "<!-- dom-assist: tile=0, line=1, reason=punctuation, replacement=\"Revenue Q4\" -->\n\nRevenue Q4\n"
        ));
        assert!(md.contains("net margin!!!"));
        assert!(md.contains("## Net margin\n"));
    }

    #[test]
    fn line_issues_follow_heuristics() {
        assert_eq!(line_issue("Total \u{FFFD}", None), Some(LineIssue::ReplacementChar));
        assert_eq!(line_issue("Wait?!…", None), Some(LineIssue::Punctuation));
        assert_eq!(line_issue("Q4 results", None), Some(LineIssue::MixedNumeric));
        assert_eq!(line_issue("-- == ** a", None), Some(LineIssue::LowAlpha));
        assert_eq!(line_issue("inter-", Some("national")), Some(LineIssue::HyphenBreak));
        assert_eq!(line_issue("inter-", Some("National")), None);
        assert_eq!(line_issue("A plain sentence.", None), None);
        assert_eq!(line_issue("   ", None), None);
        assert_eq!(merge_overlay("### Revnue??", "Revenue"), "### Revenue");
        assert_eq!(merge_overlay("#hashtag?!?", "Tag"), "Tag");
    }

    #[test]
    fn shared_run_finds_longest_suffix_prefix() {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(shared_run(&s(&["a", "b", "c"]), &s(&["b", "c", "d"]), 10), 2);
        assert_eq!(shared_run(&s(&["a"]), &s(&["b"]), 10), 0);
        assert_eq!(shared_run(&s(&["a", "b"]), &s(&["a", "b"]), 1), 0);
    }
}
