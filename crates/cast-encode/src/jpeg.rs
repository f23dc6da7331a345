//! Per-frame JPEG fallback.
//!
//! Used when no H.264 encoder opens. Every output is a complete image, so
//! every frame is a keyframe and new viewers are never gated.

use jpeg_encoder::{ColorType, Encoder};

use crate::EncodeError;

const DEFAULT_QUALITY: u8 = 70;

/// Stateless JPEG encoder.
pub struct JpegFallback {
    quality: u8,
}

impl JpegFallback {
    #[must_use]
    pub fn new() -> Self {
        Self::with_quality(DEFAULT_QUALITY)
    }

    #[must_use]
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    /// Encode one tightly packed BGRA frame as a JPEG image.
    pub fn encode(&self, bgra: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EncodeError> {
        let expected = (width as usize) * (height as usize) * 4;
        if bgra.len() != expected {
            return Err(EncodeError::Geometry {
                got: bgra.len(),
                width,
                height,
            });
        }

        let mut out = Vec::with_capacity(expected / 8);
        let encoder = Encoder::new(&mut out, self.quality);
        encoder.encode(bgra, width as u16, height as u16, ColorType::Bgra)?;
        Ok(out)
    }
}

impl Default for JpegFallback {
    fn default() -> Self {
        Self::new()
    }
}
