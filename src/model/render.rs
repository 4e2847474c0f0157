//! Class-map fusion and preview rendering
//!
//! Fusion stacks every valid mask layer's classmap onto the image canvas and
//! reduces the stack pixel by pixel. The default reducer is the elementwise
//! maximum, so overlapping masks resolve to the higher class id.

use image::{GrayImage, Rgba, RgbaImage};

use crate::model::{Dimension, Layer, MultiLayerImage};

/// Default bounding box for [`MultiLayerImage::thumbnail`].
pub const THUMBNAIL_MAX: Dimension = Dimension {
    width: 400,
    height: 350,
};

/// Paste a layer's classmap onto a canvas-sized zero plane, honoring the
/// layer offset and clipping anything outside the canvas.
fn canvas_plane(layer: &Layer, canvas: Dimension) -> Option<GrayImage> {
    let classmap = layer.classmap()?;
    let mut plane = GrayImage::new(canvas.width, canvas.height);
    for (mx, my, px) in classmap.enumerate_pixels() {
        if px.0[0] == 0 {
            continue;
        }
        let cx = layer.x + mx as i32;
        let cy = layer.y + my as i32;
        if cx < 0 || cy < 0 || cx as u32 >= canvas.width || cy as u32 >= canvas.height {
            continue;
        }
        plane.put_pixel(cx as u32, cy as u32, *px);
    }
    Some(plane)
}

impl MultiLayerImage {
    /// Fuse all mask layers into one canvas-sized classmap with the default
    /// maximum reducer.
    pub fn fused_classmap(&self) -> GrayImage {
        self.fused_classmap_with(|stack| stack.iter().copied().max().unwrap_or(0))
    }

    /// Fuse all mask layers with a caller-supplied reducer. The reducer sees
    /// one value per valid layer (0 where that layer's mask is clear) and
    /// returns the fused value for the pixel.
    pub fn fused_classmap_with<F>(&self, fusion: F) -> GrayImage
    where
        F: Fn(&[u8]) -> u8,
    {
        let canvas = self.dimension();
        let planes: Vec<GrayImage> = self
            .layers
            .iter()
            .filter_map(|l| canvas_plane(l, canvas))
            .collect();

        let mut fused = GrayImage::new(canvas.width, canvas.height);
        if planes.is_empty() {
            return fused;
        }

        let mut stack = vec![0u8; planes.len()];
        for (x, y, px) in fused.enumerate_pixels_mut() {
            for (slot, plane) in stack.iter_mut().zip(&planes) {
                *slot = plane.get_pixel(x, y).0[0];
            }
            px.0[0] = fusion(&stack);
        }
        fused
    }

    /// Render the original raster with every defect pixel stamped in the
    /// fused classmap's gray value at full opacity.
    pub fn blended_image(&self) -> RgbaImage {
        let fused = self.fused_classmap();
        let mut blended = self.original().clone();
        for (x, y, px) in blended.enumerate_pixels_mut() {
            let v = fused.get_pixel(x, y).0[0];
            if v != 0 {
                *px = Rgba([v, v, v, 255]);
            }
        }
        blended
    }

    /// Blended preview scaled to fit [`THUMBNAIL_MAX`], preserving aspect
    /// ratio and never upscaling.
    pub fn thumbnail(&self) -> RgbaImage {
        self.thumbnail_within(THUMBNAIL_MAX)
    }

    /// Blended preview scaled to fit an arbitrary bounding box.
    pub fn thumbnail_within(&self, max: Dimension) -> RgbaImage {
        let blended = self.blended_image();
        let (w, h) = (blended.width(), blended.height());
        if max.is_empty() || w == 0 || h == 0 || (w <= max.width && h <= max.height) {
            return blended;
        }
        let scale = f64::min(
            f64::from(max.width) / f64::from(w),
            f64::from(max.height) / f64::from(h),
        );
        let tw = ((f64::from(w) * scale).round() as u32).max(1);
        let th = ((f64::from(h) * scale).round() as u32).max(1);
        image::imageops::resize(&blended, tw, th, image::imageops::FilterType::Lanczos3)
    }
}
