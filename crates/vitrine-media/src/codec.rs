//! Image codec seam: metadata probing and rendition encoding.
//!
//! The codec is a pure function of its inputs: no I/O, no shared state.
//! [`RasterCodec`] is the production implementation over the `image` crate;
//! the trait exists so tests can substitute a deterministic fake and so the
//! CPU-heavy encode work stays behind one seam (the optimization worker
//! moves it onto a blocking thread).

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageReader};

use crate::error::{MediaError, Result};
use crate::types::RenditionMime;

/// Pixel dimensions extracted from an image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
}

/// One encoded rendition blob with its resulting dimensions.
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Encoded bytes.
    pub bytes: Bytes,
    /// Actual pixel width (≤ the requested width; never upscaled).
    pub width: u32,
    /// Actual pixel height.
    pub height: u32,
}

/// Decoding and re-encoding of product images.
///
/// Implementations must be pure: same input, same output, no side effects.
pub trait ImageCodec: Send + Sync {
    /// Extracts pixel dimensions from an image buffer.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::UnsupportedFormat`] if the buffer is not a
    /// decodable image.
    fn probe(&self, bytes: &[u8]) -> Result<Probe>;

    /// Resizes the image to at most `target_width` (preserving aspect
    /// ratio, never upscaling) and encodes it to `format`.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::UnsupportedFormat`] if decoding or encoding
    /// fails.
    fn resize_and_encode(
        &self,
        bytes: &[u8],
        target_width: u32,
        format: RenditionMime,
    ) -> Result<Encoded>;
}

/// AVIF encoder speed (0 = slowest/best, 10 = fastest).
const AVIF_SPEED: u8 = 8;

/// AVIF encoder quality (0-100).
const AVIF_QUALITY: u8 = 80;

/// Production codec over the `image` crate.
///
/// Decodes every accepted original format the build enables, resizes with
/// Lanczos3, and encodes AVIF (rav1e-backed) and lossless WebP renditions.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterCodec;

impl RasterCodec {
    /// Creates a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn decode(bytes: &[u8]) -> Result<DynamicImage> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| MediaError::unsupported_format(format!("format detection failed: {e}")))?
            .decode()
            .map_err(|e| MediaError::unsupported_format(format!("decode failed: {e}")))
    }

    fn encode(image: &DynamicImage, format: RenditionMime) -> Result<Vec<u8>> {
        // Both encoders take RGBA8; normalize once.
        let rgba = image.to_rgba8();
        let (width, height) = (rgba.width(), rgba.height());
        let mut out = Vec::new();

        match format {
            RenditionMime::Avif => {
                AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, AVIF_QUALITY)
                    .write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
                    .map_err(|e| {
                        MediaError::unsupported_format(format!("avif encode failed: {e}"))
                    })?;
            }
            RenditionMime::Webp => {
                WebPEncoder::new_lossless(&mut out)
                    .write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
                    .map_err(|e| {
                        MediaError::unsupported_format(format!("webp encode failed: {e}"))
                    })?;
            }
        }

        Ok(out)
    }
}

impl ImageCodec for RasterCodec {
    fn probe(&self, bytes: &[u8]) -> Result<Probe> {
        let (width, height) = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| MediaError::unsupported_format(format!("format detection failed: {e}")))?
            .into_dimensions()
            .map_err(|e| MediaError::unsupported_format(format!("header decode failed: {e}")))?;
        Ok(Probe { width, height })
    }

    fn resize_and_encode(
        &self,
        bytes: &[u8],
        target_width: u32,
        format: RenditionMime,
    ) -> Result<Encoded> {
        let image = Self::decode(bytes)?;

        let resized = if image.width() > target_width {
            // Height bound is effectively unbounded: only width constrains.
            image.resize(target_width, u32::MAX, FilterType::Lanczos3)
        } else {
            image
        };

        let (width, height) = (resized.width(), resized.height());
        let encoded = Self::encode(&resized, format)?;

        Ok(Encoded {
            bytes: Bytes::from(encoded),
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};

    /// Encodes a solid-color PNG of the given dimensions.
    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, image::Rgba([200, 60, 20, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode fixture");
        out.into_inner()
    }

    #[test]
    fn probe_reads_dimensions() {
        let codec = RasterCodec::new();
        let probe = codec.probe(&png_fixture(640, 360)).unwrap();
        assert_eq!(probe, Probe { width: 640, height: 360 });
    }

    #[test]
    fn probe_rejects_non_images() {
        let codec = RasterCodec::new();
        let err = codec.probe(b"not an image at all").unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedFormat { .. }));
    }

    #[test]
    fn resize_scales_down_preserving_aspect() {
        let codec = RasterCodec::new();
        let encoded = codec
            .resize_and_encode(&png_fixture(1600, 900), 400, RenditionMime::Webp)
            .unwrap();
        assert_eq!(encoded.width, 400);
        assert_eq!(encoded.height, 225);
        assert!(!encoded.bytes.is_empty());
    }

    #[test]
    fn resize_never_upscales() {
        let codec = RasterCodec::new();
        let encoded = codec
            .resize_and_encode(&png_fixture(300, 200), 1200, RenditionMime::Webp)
            .unwrap();
        assert_eq!(encoded.width, 300);
        assert_eq!(encoded.height, 200);
    }

    #[test]
    fn webp_output_decodes_back() {
        let codec = RasterCodec::new();
        let encoded = codec
            .resize_and_encode(&png_fixture(800, 400), 400, RenditionMime::Webp)
            .unwrap();

        let probe = codec.probe(&encoded.bytes).unwrap();
        assert_eq!(probe.width, encoded.width);
        assert_eq!(probe.height, encoded.height);
    }

    #[test]
    fn encode_rejects_garbage_input() {
        let codec = RasterCodec::new();
        let err = codec
            .resize_and_encode(b"garbage", 400, RenditionMime::Avif)
            .unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedFormat { .. }));
    }
}
