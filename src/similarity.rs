//! Similarity measures used by the stitcher and dedup engine.
//!
//! * [`ssim`]: mean structural similarity of two grayscale bands, computed
//!   over 8×8 windows with the usual stabilising constants.
//! * [`TextEmbedding`]: a hashed character-trigram vector. Cheap,
//!   deterministic, and good enough to catch the same sentence OCR'd twice
//!   with a few characters off.

use image::GrayImage;

const WINDOW: u32 = 8;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

fn window_ssim(a: &GrayImage, b: &GrayImage, x0: u32, y0: u32, w: u32, h: u32) -> f64 {
    let n = (w * h) as f64;
    let (mut sa, mut sb) = (0.0, 0.0);
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            sa += a.get_pixel(x, y)[0] as f64;
            sb += b.get_pixel(x, y)[0] as f64;
        }
    }
    let (ma, mb) = (sa / n, sb / n);
    let (mut va, mut vb, mut cov) = (0.0, 0.0, 0.0);
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let da = a.get_pixel(x, y)[0] as f64 - ma;
            let db = b.get_pixel(x, y)[0] as f64 - mb;
            va += da * da;
            vb += db * db;
            cov += da * db;
        }
    }
    va /= n;
    vb /= n;
    cov /= n;
    ((2.0 * ma * mb + C1) * (2.0 * cov + C2)) / ((ma * ma + mb * mb + C1) * (va + vb + C2))
}

/// Mean SSIM of two equally sized grayscale images, in `[-1, 1]`.
///
/// Returns `None` when the sizes differ or either image is empty.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> Option<f64> {
    if a.dimensions() != b.dimensions() || a.width() == 0 || a.height() == 0 {
        return None;
    }
    let (w, h) = a.dimensions();
    let (ww, wh) = (WINDOW.min(w), WINDOW.min(h));
    let mut total = 0.0;
    let mut count = 0usize;
    let mut y = 0;
    while y + wh <= h {
        let mut x = 0;
        while x + ww <= w {
            total += window_ssim(a, b, x, y, ww, wh);
            count += 1;
            x += ww;
        }
        y += wh;
    }
    Some(total / count.max(1) as f64)
}

/// Lower-case, strip Markdown markup characters and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut space = false;
    for c in text.chars() {
        if matches!(c, '#' | '*' | '_' | '`' | '|' | '>' | '~') {
            continue;
        }
        if c.is_whitespace() {
            space = !out.is_empty();
            continue;
        }
        if space {
            out.push(' ');
            space = false;
        }
        out.extend(c.to_lowercase());
    }
    out
}

const DIMS: usize = 512;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Hashed trigram count vector, L2-normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct TextEmbedding {
    v: Vec<f32>,
}

impl TextEmbedding {
    pub fn new(text: &str) -> Self {
        let norm = normalize_text(text);
        let chars: Vec<char> = norm.chars().collect();
        let mut v = vec![0f32; DIMS];
        if chars.len() < 3 {
            if !chars.is_empty() {
                v[(fnv1a(norm.as_bytes()) % DIMS as u64) as usize] = 1.0;
            }
        } else {
            let mut buf = [0u8; 12];
            for gram in chars.windows(3) {
                let mut len = 0;
                for c in gram {
                    len += c.encode_utf8(&mut buf[len..]).len();
                }
                v[(fnv1a(&buf[..len]) % DIMS as u64) as usize] += 1.0;
            }
        }
        let norm2 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm2 > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm2);
        }
        Self { v }
    }

    pub fn is_empty(&self) -> bool {
        self.v.iter().all(|x| *x == 0.0)
    }

    /// Cosine similarity; 0 when either side is empty.
    pub fn cosine(&self, other: &Self) -> f32 {
        self.v.iter().zip(&other.v).map(|(a, b)| a * b).sum()
    }
}
