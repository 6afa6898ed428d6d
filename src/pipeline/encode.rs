//! Image encoding and content hashing.
//!
//! PNG is used for every tile and frame artifact: it is lossless, and the
//! `image` crate's encoder is deterministic, so identical pixels always give
//! identical bytes. Hashes are taken over raw post-scale pixels rather than
//! the PNG stream so they stay stable across encoder versions.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{GrayImage, RgbaImage};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use tracing::debug;

/// Encode pixels as PNG.
pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded {}x{} image → {} bytes PNG", img.width(), img.height(), buf.len());
    Ok(buf)
}

/// Base64 form of an encoded image, as sent in JSON request bodies.
pub fn to_base64(png: &[u8]) -> String {
    STANDARD.encode(png)
}

/// Wrap a tile PNG for a vision-model chat message.
///
/// `detail: "high"` keeps fine print legible on GPT-4-class models.
pub fn image_data(png: &[u8]) -> ImageData {
    ImageData::new(to_base64(png), "image/png").with_detail("high")
}

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 over dimensions + RGBA bytes.
pub fn pixel_sha256(img: &RgbaImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(img.width().to_be_bytes());
    hasher.update(img.height().to_be_bytes());
    hasher.update(img.as_raw());
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 over a grayscale band (used for seam fingerprints).
pub fn gray_sha256(img: &GrayImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(img.width().to_be_bytes());
    hasher.update(img.height().to_be_bytes());
    hasher.update(img.as_raw());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn encode_is_deterministic() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]));
        let a = encode_png(&img).expect("encode should succeed");
        let b = encode_png(&img).expect("encode should succeed");
        assert_eq!(a, b);
        let decoded = STANDARD.decode(to_base64(&a)).expect("valid base64");
        assert_eq!(decoded, a);
    }

    #[test]
    fn pixel_hash_depends_on_shape() {
        let a = RgbaImage::from_pixel(4, 2, Rgba([1, 2, 3, 4]));
        let b = RgbaImage::from_pixel(2, 4, Rgba([1, 2, 3, 4]));
        assert_ne!(pixel_sha256(&a), pixel_sha256(&b));
        assert_eq!(pixel_sha256(&a).len(), 64);
    }

    #[test]
    fn image_data_is_png() {
        let img = RgbaImage::from_pixel(3, 3, Rgba([0, 0, 0, 255]));
        let data = image_data(&encode_png(&img).unwrap());
        assert_eq!(data.mime_type, "image/png");
        assert!(!data.data.is_empty());
    }
}
