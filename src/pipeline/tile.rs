//! Tiler: viewport frames → OCR-sized tiles.
//!
//! Most frames become exactly one tile. Frames taller than
//! [`TilerConfig::max_frame_height`] are split into overlapping chunks, and
//! any chunk whose long side exceeds [`TilerConfig::target_long_side`] is
//! downscaled with a fixed filter so identical frames always produce
//! identical tile bytes.
//!
//! Overlap between tiles of consecutive frames comes from the sweep's scroll
//! delta ([`ViewportFrame::overlap_px`]), never from image matching.

use crate::config::TilerConfig;
use crate::manifest::{ManifestWarning, WarningCode};
use crate::pipeline::capture::ViewportFrame;
use crate::pipeline::encode::{encode_png, pixel_sha256};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tiles with a side shorter than this after scaling carry no readable text.
pub const MIN_TILE_SIDE: u32 = 16;

/// One unit of OCR work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tile {
    pub index: usize,
    pub frame_index: usize,
    /// Offset of the chunk inside its frame, source (device) pixels.
    pub x: u32,
    pub y: u32,
    /// Size after scaling.
    pub width: u32,
    pub height: u32,
    /// `tile px / source px`; 1.0 when no downscale was needed.
    pub scale: f32,
    /// SHA-256 over width, height and RGBA pixels after scaling.
    pub sha256: String,
    pub overlap_with_previous: bool,
    /// Rows shared with the previous tile, in this tile's pixels.
    pub overlap_px: u32,
    /// The same band in CSS px.
    pub overlap_page_px: u32,
    /// Document range covered, CSS px.
    pub page_y_start: u32,
    pub page_y_end: u32,
    #[serde(skip)]
    pub png: Arc<Vec<u8>>,
    #[serde(skip)]
    pub pixels: Arc<RgbaImage>,
}

impl Tile {
    /// Stable identifier used in provenance comments and prompts.
    pub fn tile_id(&self) -> String {
        format!("tile_{:04}", self.index)
    }

    /// Tile rows covering the document span `[top, bottom)` (CSS px), clamped to the tile.
    pub fn rows_for_page_span(&self, top: u32, bottom: u32) -> (u32, u32) {
        let span = self.page_y_end.saturating_sub(self.page_y_start).max(1) as f32;
        let per_css = self.height as f32 / span;
        let to_row = |y: u32| {
            let rel = y.clamp(self.page_y_start, self.page_y_end) - self.page_y_start;
            ((rel as f32 * per_css).round() as u32).min(self.height)
        };
        (to_row(top), to_row(bottom))
    }

    /// Document y (CSS px) of a tile row.
    pub fn page_y_of_row(&self, row: u32) -> u32 {
        let span = self.page_y_end.saturating_sub(self.page_y_start) as f32;
        let frac = row.min(self.height) as f32 / self.height.max(1) as f32;
        self.page_y_start + (frac * span).round() as u32
    }
}

/// Tiler output.
#[derive(Debug, Clone, Default)]
pub struct TileSet {
    pub tiles: Vec<Tile>,
    pub warnings: Vec<ManifestWarning>,
}

/// Split `[0, height)` into chunks of at most `max` rows sharing `overlap` rows.
fn chunk_rows(height: u32, max: u32, overlap: u32) -> Vec<(u32, u32)> {
    if height <= max {
        return vec![(0, height)];
    }
    let stride = max.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut y = 0;
    loop {
        let h = (height - y).min(max);
        chunks.push((y, h));
        if y + h >= height {
            break;
        }
        y += stride;
    }
    chunks
}

fn scaled_size(width: u32, height: u32, target_long_side: u32) -> (u32, u32, f32) {
    let long = width.max(height);
    if long <= target_long_side {
        return (width, height, 1.0);
    }
    let scale = target_long_side as f32 / long as f32;
    let w = ((width as f32 * scale).round() as u32).max(1);
    let h = ((height as f32 * scale).round() as u32).max(1);
    (w, h, scale)
}

/// Where the previously emitted tile came from, for adjacency checks.
struct LastTile {
    frame_index: usize,
    chunk: usize,
    last_in_frame: bool,
    source_height: u32,
}

/// Slice every frame into tiles.
pub fn slice(frames: &[ViewportFrame], config: &TilerConfig) -> TileSet {
    let mut set = TileSet::default();
    let mut last: Option<LastTile> = None;

    for frame in frames {
        let img = match image::load_from_memory(&frame.png) {
            Ok(img) => img.to_rgba8(),
            Err(e) => {
                warn!("Frame {} is undecodable: {}", frame.index, e);
                set.warnings.push(
                    ManifestWarning::new(
                        WarningCode::TileGeometryInvalid,
                        format!("frame image undecodable: {e}"),
                    )
                    .at_frame(frame.index),
                );
                last = None;
                continue;
            }
        };

        let dpr = frame.device_scale_factor.max(0.1);
        let chunks = chunk_rows(img.height(), config.max_frame_height, config.overlap_px);
        let chunk_count = chunks.len();

        for (chunk, (top, source_height)) in chunks.into_iter().enumerate() {
            let (width, height, scale) = scaled_size(img.width(), source_height, config.target_long_side);
            if width < MIN_TILE_SIDE || height < MIN_TILE_SIDE {
                warn!(
                    "Frame {} chunk {} is degenerate ({}x{} after scaling)",
                    frame.index, chunk, width, height
                );
                set.warnings.push(
                    ManifestWarning::new(
                        WarningCode::TileGeometryInvalid,
                        format!("chunk {chunk} is {width}x{height} after scaling"),
                    )
                    .at_frame(frame.index),
                );
                last = None;
                continue;
            }

            let crop = imageops::crop_imm(&img, 0, top, img.width(), source_height).to_image();
            let pixels = if scale < 1.0 {
                imageops::resize(&crop, width, height, FilterType::Triangle)
            } else {
                crop
            };
            let png = match encode_png(&pixels) {
                Ok(png) => png,
                Err(e) => {
                    set.warnings.push(
                        ManifestWarning::new(
                            WarningCode::TileGeometryInvalid,
                            format!("chunk {chunk} could not be encoded: {e}"),
                        )
                        .at_frame(frame.index),
                    );
                    last = None;
                    continue;
                }
            };

            // Source rows shared with the previous tile, if it is adjacent.
            let overlap_source = match &last {
                Some(prev) if chunk == 0 && prev.last_in_frame && prev.frame_index + 1 == frame.index => {
                    let rows = (frame.overlap_px as f32 * dpr).round() as u32;
                    rows.min(source_height).min(prev.source_height)
                }
                Some(prev) if chunk > 0 && prev.frame_index == frame.index && prev.chunk + 1 == chunk => {
                    config.overlap_px.min(source_height)
                }
                _ => 0,
            };

            let page_y_start = frame.scroll_y + (top as f32 / dpr).round() as u32;
            let page_y_end = frame.scroll_y + ((top + source_height) as f32 / dpr).round() as u32;
            let index = set.tiles.len();
            let tile = Tile {
                index,
                frame_index: frame.index,
                x: 0,
                y: top,
                width,
                height,
                scale,
                sha256: pixel_sha256(&pixels),
                overlap_with_previous: overlap_source > 0,
                overlap_px: ((overlap_source as f32 * scale).round() as u32).min(height),
                overlap_page_px: (overlap_source as f32 / dpr).round() as u32,
                page_y_start,
                page_y_end,
                png: Arc::new(png),
                pixels: Arc::new(pixels),
            };
            debug!(
                "Tile {} from frame {} rows {}..{} → {}x{} (scale {:.3}, overlap {}px)",
                index,
                frame.index,
                top,
                top + source_height,
                width,
                height,
                scale,
                tile.overlap_px
            );
            set.tiles.push(tile);
            last = Some(LastTile {
                frame_index: frame.index,
                chunk,
                last_in_frame: chunk + 1 == chunk_count,
                source_height,
            });
        }
    }

    set
}
