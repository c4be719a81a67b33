//! # Bitmap Decoding
//!
//! The engine caches raw encoded bytes only; decoding happens per caller at
//! its requested display scale. The [`ImageDecoder`] trait keeps the codec
//! behind a seam so UI layers can plug in their own.

use bytes::Bytes;

use crate::error::ImageError;

/// A decoded RGBA8 bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    /// Width in physical pixels.
    pub width: u32,
    /// Height in physical pixels.
    pub height: u32,
    /// Display scale factor the bitmap was decoded for.
    pub scale: f32,
    /// Tightly packed RGBA8 pixel data, row-major.
    pub data: Bytes,
}

impl Bitmap {
    /// Width in display points at the bitmap's scale factor.
    pub fn point_width(&self) -> f32 {
        self.width as f32 / self.scale
    }

    /// Height in display points at the bitmap's scale factor.
    pub fn point_height(&self) -> f32 {
        self.height as f32 / self.scale
    }
}

/// Decodes raw payload bytes into a displayable bitmap.
pub trait ImageDecoder: Send + Sync {
    /// Decode `payload` for display at the given scale factor.
    fn decode(&self, payload: &Bytes, scale: f32) -> Result<Bitmap, ImageError>;
}

/// Default decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecoder;

impl ImageDecoder for StandardDecoder {
    fn decode(&self, payload: &Bytes, scale: f32) -> Result<Bitmap, ImageError> {
        let image =
            image::load_from_memory(payload).map_err(|e| ImageError::Decoding(e.to_string()))?;

        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();

        Ok(Bitmap {
            width,
            height,
            scale,
            data: Bytes::from(rgba.into_raw()),
        })
    }
}
