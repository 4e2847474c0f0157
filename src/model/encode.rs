//! Mask and raster PNG encoding
//!
//! Mask layers travel as 8-bit luma+alpha PNGs: the luma channel holds the
//! classmap (class id where the mask is set, 0 elsewhere) and the alpha
//! channel holds the mask itself (255 set, 0 clear). Decoding accepts any
//! PNG: with an alpha channel the mask is the nonzero alpha plane, without
//! one it is the nonzero luma plane.

use std::io::Cursor;

use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, RgbaImage};

use crate::error::{Error, Result};
use crate::model::Layer;

/// Encode a layer's classmap as a luma+alpha PNG.
///
/// Fails with [`Error::Unsupported`] for layers that do not carry a mask.
pub fn encode_classmap_png(layer: &Layer) -> Result<Vec<u8>> {
    let mask = layer.image.as_ref().ok_or_else(|| {
        Error::Unsupported(format!("layer '{}' has no mask to encode", layer.name()))
    })?;

    let mut out = GrayAlphaImage::new(mask.width(), mask.height());
    for (src, dst) in mask.pixels().zip(out.pixels_mut()) {
        if src.0[0] != 0 {
            dst.0 = [layer.class_id, 255];
        } else {
            dst.0 = [0, 0];
        }
    }

    let mut bytes = Cursor::new(Vec::new());
    out.write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Decode PNG bytes into a binary 0/1 mask.
pub fn decode_mask_png(bytes: &[u8]) -> Result<GrayImage> {
    let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
    Ok(mask_from_dynamic(&decoded))
}

/// Extract a binary mask from a decoded image: the nonzero alpha plane when
/// an alpha channel exists, the nonzero luma plane otherwise.
pub fn mask_from_dynamic(decoded: &DynamicImage) -> GrayImage {
    if decoded.color().has_alpha() {
        let la = decoded.to_luma_alpha8();
        let mut mask = GrayImage::new(la.width(), la.height());
        for (src, dst) in la.pixels().zip(mask.pixels_mut()) {
            dst.0[0] = u8::from(src.0[1] != 0);
        }
        mask
    } else {
        let mut mask = decoded.to_luma8();
        for px in mask.pixels_mut() {
            px.0[0] = u8::from(px.0[0] != 0);
        }
        mask
    }
}

/// Encode an RGBA raster as PNG bytes.
pub fn encode_rgba_png(raster: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    raster.write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Decode PNG bytes into an RGBA raster.
pub fn decode_rgba_png(bytes: &[u8]) -> Result<RgbaImage> {
    let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
    Ok(decoded.to_rgba8())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_layer() -> Layer {
        let mut mask = GrayImage::new(3, 2);
        mask.put_pixel(0, 0, image::Luma([1]));
        mask.put_pixel(2, 1, image::Luma([1]));
        Layer::with_mask("crack", 100, mask)
    }

    #[test]
    fn classmap_png_round_trip() {
        let layer = sample_layer();
        let bytes = encode_classmap_png(&layer).unwrap();
        let mask = decode_mask_png(&bytes).unwrap();

        assert_eq!(mask.dimensions(), (3, 2));
        assert_eq!(mask.get_pixel(0, 0).0[0], 1);
        assert_eq!(mask.get_pixel(1, 0).0[0], 0);
        assert_eq!(mask.get_pixel(2, 1).0[0], 1);
    }

    #[test]
    fn encode_rejects_maskless_layer() {
        let layer = Layer::new("crack");
        assert!(encode_classmap_png(&layer).is_err());
    }

    #[test]
    fn decode_falls_back_to_luma_without_alpha() {
        let mut gray = GrayImage::new(2, 1);
        gray.put_pixel(0, 0, image::Luma([100]));
        let mut bytes = Cursor::new(Vec::new());
        gray.write_to(&mut bytes, ImageFormat::Png).unwrap();

        let mask = decode_mask_png(&bytes.into_inner()).unwrap();
        assert_eq!(mask.get_pixel(0, 0).0[0], 1);
        assert_eq!(mask.get_pixel(1, 0).0[0], 0);
    }
}
