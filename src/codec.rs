//! Region image encoding
//!
//! Turns BGRA regions into the compressed `encoded_image` bytes carried by
//! `ScreenRegion` payloads, and back. PNG is lossless, so a decoded region
//! is pixel-identical to what was captured. JPEG trades exactness for size
//! and is driven by the adaptive quality in the streamer.

use crate::capture::types::{Bitmap, Rect};
use crate::error::{CodecError, CodecResult};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Instant;
use tracing::trace;

/// Lowest usable JPEG quality
const JPEG_MIN_QUALITY: u8 = 1;

/// Highest JPEG quality
const JPEG_MAX_QUALITY: u8 = 100;

/// Default JPEG quality
pub const JPEG_DEFAULT_QUALITY: u8 = 75;

/// Compressed image format for region payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCodec {
    /// Lossless PNG
    #[default]
    Png,
    /// Lossy JPEG
    Jpeg,
}

/// Encodes bitmap regions
#[derive(Debug, Clone)]
pub struct RegionEncoder {
    codec: ImageCodec,
    quality: u8,
}

impl RegionEncoder {
    /// Creates a new encoder
    pub fn new(codec: ImageCodec, quality: u8) -> Self {
        Self {
            codec,
            quality: quality.clamp(JPEG_MIN_QUALITY, JPEG_MAX_QUALITY),
        }
    }

    /// Creates a lossless PNG encoder
    pub fn png() -> Self {
        Self::new(ImageCodec::Png, JPEG_DEFAULT_QUALITY)
    }

    /// Creates a JPEG encoder with the given quality
    pub fn jpeg(quality: u8) -> Self {
        Self::new(ImageCodec::Jpeg, quality)
    }

    /// Returns the codec
    pub fn codec(&self) -> ImageCodec {
        self.codec
    }

    /// Returns the JPEG quality
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Changes the JPEG quality; ignored by PNG
    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.clamp(JPEG_MIN_QUALITY, JPEG_MAX_QUALITY);
    }

    /// Encodes a whole bitmap
    ///
    /// # Errors
    ///
    /// Returns error if the image library fails to encode
    pub fn encode(&self, bitmap: &Bitmap) -> CodecResult<Vec<u8>> {
        self.encode_with_quality(bitmap, self.quality)
    }

    /// Encodes a bitmap with an explicit JPEG quality (keyframes use the
    /// default quality regardless of adaptation)
    ///
    /// # Errors
    ///
    /// Returns error if the image library fails to encode
    pub fn encode_with_quality(&self, bitmap: &Bitmap, quality: u8) -> CodecResult<Vec<u8>> {
        let start = Instant::now();
        let rgba = bitmap.to_rgba_image();
        let mut buffer = Cursor::new(Vec::new());

        match self.codec {
            ImageCodec::Png => {
                DynamicImage::ImageRgba8(rgba)
                    .write_to(&mut buffer, ImageFormat::Png)
                    .map_err(|e| CodecError::EncodeFailed(format!("PNG encoding failed: {}", e)))?;
            }
            ImageCodec::Jpeg => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();
                let quality = quality.clamp(JPEG_MIN_QUALITY, JPEG_MAX_QUALITY);
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality)
                    .encode_image(&rgb)
                    .map_err(|e| CodecError::EncodeFailed(format!("JPEG encoding failed: {}", e)))?;
            }
        }

        let encoded = buffer.into_inner();
        trace!(
            "Encoded {}x{} region as {:?}: {} bytes in {:.2}ms",
            bitmap.width(),
            bitmap.height(),
            self.codec,
            encoded.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(encoded)
    }

    /// Crops `region` out of `bitmap` and encodes it
    ///
    /// # Errors
    ///
    /// Returns error if the region is outside the bitmap or encoding fails
    pub fn encode_region(&self, bitmap: &Bitmap, region: Rect, quality: u8) -> CodecResult<Vec<u8>> {
        let cropped = bitmap.crop(region)?;
        self.encode_with_quality(&cropped, quality)
    }
}

impl Default for RegionEncoder {
    fn default() -> Self {
        Self::png()
    }
}

/// Decodes an encoded region (format is detected from its magic bytes)
///
/// # Errors
///
/// Returns error if the bytes are not a supported image
pub fn decode_image(data: &[u8]) -> CodecResult<Bitmap> {
    let image = image::load_from_memory(data)
        .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
    Ok(Bitmap::from_rgba_image(&image.to_rgba8()))
}
