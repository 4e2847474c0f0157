//! PSD file import using the `psd` crate
//!
//! Read-only: annotation masks drawn in Photoshop come in through here,
//! one mask per named layer, taken from the layer's alpha channel. There
//! is no PSD writer.

use std::path::Path;

use image::{DynamicImage, RgbaImage};
use psd::Psd;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::file::category::CategoryFilter;
use crate::file::Codec;
use crate::model::encode::mask_from_dynamic;
use crate::model::{Layer, MultiLayerImage};

/// Codec for Photoshop documents. Import only.
pub struct PsdCodec {
    filter: CategoryFilter,
    extensions: Vec<String>,
}

impl PsdCodec {
    pub fn new(filter: CategoryFilter, extensions: Vec<String>) -> Self {
        Self { filter, extensions }
    }
}

/// Place a PSD layer's pixels on a canvas-sized buffer.
///
/// `PsdLayer::rgba` usually hands back canvas-sized data with the content
/// already positioned, but some files produce a buffer sized to the layer
/// bounds instead; those are pasted at the bounds' offset.
fn full_canvas_rgba(source: &psd::PsdLayer, canvas_w: u32, canvas_h: u32) -> Option<RgbaImage> {
    let rgba = source.rgba();
    if rgba.len() == (canvas_w * canvas_h * 4) as usize {
        return RgbaImage::from_raw(canvas_w, canvas_h, rgba);
    }

    let bounds_w = (source.layer_right() - source.layer_left()) as u32;
    let bounds_h = (source.layer_bottom() - source.layer_top()) as u32;
    if bounds_w == 0 || bounds_h == 0 || rgba.len() != (bounds_w * bounds_h * 4) as usize {
        return None;
    }
    let patch = RgbaImage::from_raw(bounds_w, bounds_h, rgba)?;

    let mut canvas = RgbaImage::new(canvas_w, canvas_h);
    for (x, y, px) in patch.enumerate_pixels() {
        let cx = source.layer_left() + x as i32;
        let cy = source.layer_top() + y as i32;
        if (0..canvas_w as i32).contains(&cx) && (0..canvas_h as i32).contains(&cy) {
            canvas.put_pixel(cx as u32, cy as u32, *px);
        }
    }
    Some(canvas)
}

impl Codec for PsdCodec {
    fn supported_extensions(&self) -> &[String] {
        &self.extensions
    }

    fn load(&mut self, path: &Path) -> Result<MultiLayerImage> {
        info!("[PSD] Loading file: {:?}", path);
        let data = std::fs::read(path)?;
        let psd = Psd::from_bytes(&data)
            .map_err(|e| Error::InvalidFormat(format!("PSD parse error: {}", e)))?;

        let width = psd.width();
        let height = psd.height();
        debug!("[PSD] dimensions: {}x{}", width, height);

        let original = RgbaImage::from_raw(width, height, psd.rgba())
            .ok_or_else(|| Error::InvalidFormat("Invalid composite image data".to_string()))?;
        let mut img = MultiLayerImage::new(path, original);

        let mut layers = Vec::new();
        for (idx, psd_layer) in psd.layers().iter().enumerate() {
            let name = psd_layer.name().to_string();
            let class_id = match self.filter.resolve(&name) {
                Some(id) => id,
                None => {
                    debug!("[PSD] skipping layer '{}' (not in categories)", name);
                    continue;
                }
            };
            let full_image = match full_canvas_rgba(psd_layer, width, height) {
                Some(img) => img,
                None => {
                    warn!("[PSD] skipping layer {} '{}': cannot parse RGBA data", idx, name);
                    continue;
                }
            };

            let mask = mask_from_dynamic(&DynamicImage::ImageRgba8(full_image));
            let mut layer = Layer::with_mask(&name, class_id, mask);
            // the psd crate reads the hidden flag as "visible", so invert it
            layer.visibility = !psd_layer.visible();
            layer.set_opacity(psd_layer.opacity() as f32 / 255.0);
            layers.push(layer);
        }

        // PSD stores layers top-to-bottom; flip to bottom-to-top order
        layers.reverse();
        img.layers = layers;

        info!("[PSD] Loaded {:?}: {} mask layers", path, img.layers.len());
        Ok(img)
    }

    fn save(&self, _img: &MultiLayerImage, path: &Path) -> Result<()> {
        Err(Error::Unsupported(format!(
            "PSD writing is not supported: {}",
            path.display()
        )))
    }
}
