//! Image decoding through the `image` crate.

use anyhow::Context;

use crate::platform::api::{DecodedImage, ImageDecoder};

/// Decodes any format the `image` crate recognizes into tightly packed RGBA.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<DecodedImage> {
        let decoded = image::load_from_memory(bytes).context("Unrecognized or corrupt image data")?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(DecodedImage {
            width,
            height,
            channels: 4,
            pixels: rgba.into_raw(),
        })
    }
}
