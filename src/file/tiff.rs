//! TIFF (.tif/.tiff) format support with embedded layer data
//!
//! Strategy: "payload carrier"
//! - Page 0 (IFD 0): the original raster (viewable in any image viewer)
//! - ImageDescription tag: JSON descriptor with layer structure and metadata
//! - Page 1..N: per-layer classmap RGBA data
//!
//! This is the intermediate used for external-editor round trips, so a save
//! followed by a load must preserve layer names, opacity, visibility, masks,
//! properties and metrics.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::Path;

use image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype::RGBA8, TiffEncoder};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::file::category::CategoryFilter;
use crate::file::Codec;
use crate::model::encode::mask_from_dynamic;
use crate::model::{Layer, MultiLayerImage, PropertyValue};

/// Magic marker in ImageDescription identifying our multi-page layout.
const TIFF_MARKER: &str = "MASKPACK_PROJECT_V1:";

/// Layer metadata stored in the descriptor (without pixel data).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TiffLayerMeta {
    name: String,
    class_id: u8,
    opacity: f32,
    visibility: bool,
    x: i32,
    y: i32,
    /// Which TIFF page carries this layer's pixels.
    page_index: usize,
}

/// Image metadata stored in the first page's ImageDescription.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TiffImageMeta {
    width: u32,
    height: u32,
    title: String,
    properties: IndexMap<String, PropertyValue>,
    metrics: IndexMap<String, f64>,
    layers: Vec<TiffLayerMeta>,
}

/// Codec for the multi-page TIFF intermediate.
pub struct TiffCodec {
    filter: CategoryFilter,
    extensions: Vec<String>,
}

impl TiffCodec {
    pub fn new(filter: CategoryFilter, extensions: Vec<String>) -> Self {
        Self { filter, extensions }
    }
}

/// Decode the current page into a buffer that remembers whether the source
/// had an alpha channel, so mask extraction can pick the right plane.
fn read_page_dynamic<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<DynamicImage> {
    let (width, height) = decoder.dimensions()?;
    let samples = match decoder.read_image()? {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => {
            return Err(Error::InvalidFormat(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    };

    let pixels = width as usize * height as usize;
    let invalid =
        || Error::InvalidFormat(format!("invalid TIFF page data for {width}x{height}"));
    if pixels == 0 {
        return Ok(DynamicImage::ImageRgba8(RgbaImage::new(width, height)));
    }
    match samples.len() / pixels {
        4 if samples.len() == pixels * 4 => RgbaImage::from_raw(width, height, samples)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(invalid),
        3 if samples.len() == pixels * 3 => RgbImage::from_raw(width, height, samples)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(invalid),
        2 if samples.len() == pixels * 2 => GrayAlphaImage::from_raw(width, height, samples)
            .map(DynamicImage::ImageLumaA8)
            .ok_or_else(invalid),
        1 if samples.len() == pixels => GrayImage::from_raw(width, height, samples)
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

impl Codec for TiffCodec {
    fn supported_extensions(&self) -> &[String] {
        &self.extensions
    }

    fn load(&mut self, path: &Path) -> Result<MultiLayerImage> {
        info!("[TIFF] Loading file: {:?}", path);
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut decoder = Decoder::new(&mut reader)?;

        // 1. The descriptor is mandatory
        let description = decoder
            .get_tag_ascii_string(tiff::tags::Tag::ImageDescription)
            .map_err(|_| {
                Error::InvalidFormat(format!(
                    "TIFF has no layer descriptor: {}",
                    path.display()
                ))
            })?;
        let json = description.strip_prefix(TIFF_MARKER).ok_or_else(|| {
            Error::InvalidFormat(format!(
                "TIFF descriptor carries no recognized marker: {}",
                path.display()
            ))
        })?;
        let meta: TiffImageMeta = serde_json::from_str(json)
            .map_err(|e| Error::InvalidFormat(format!("malformed TIFF descriptor: {e}")))?;

        // 2. Page 0 is the original raster
        let original = read_page_dynamic(&mut decoder)?.to_rgba8();
        let mut img = MultiLayerImage::new(path, original);
        img.set_title(&meta.title);
        img.properties = meta.properties;
        img.metrics = meta.metrics;

        // 3. One page per descriptor layer, in page order
        for layer_meta in &meta.layers {
            if !decoder.more_images() {
                return Err(Error::InvalidFormat(format!(
                    "TIFF page missing for layer '{}'",
                    layer_meta.name
                )));
            }
            decoder.next_image()?;

            let class_id = match self.filter.resolve(&layer_meta.name) {
                Some(id) => id,
                None => {
                    debug!(
                        "[TIFF] skipping layer '{}' (not in categories)",
                        layer_meta.name
                    );
                    continue;
                }
            };
            let page = read_page_dynamic(&mut decoder)?;
            let mut layer = Layer::with_mask(&layer_meta.name, class_id, mask_from_dynamic(&page));
            layer.set_opacity(layer_meta.opacity);
            layer.visibility = layer_meta.visibility;
            layer.x = layer_meta.x;
            layer.y = layer_meta.y;
            img.layers.push(layer);
        }

        info!(
            "[TIFF] Loaded {:?}: {} mask layers, {}x{}",
            path,
            img.layers.len(),
            img.dimension().width,
            img.dimension().height
        );
        Ok(img)
    }

    fn save(&self, img: &MultiLayerImage, path: &Path) -> Result<()> {
        info!("[TIFF] Saving file: {:?}", path);
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let mut encoder = TiffEncoder::new(&mut writer)?;

        // Build the descriptor; page 0 is the original, layers start at page 1
        let mut layer_metas = Vec::new();
        let mut pages = Vec::new();
        for layer in &img.layers {
            let page = match layer.classmap_rgba() {
                Some(p) => p,
                None => {
                    warn!("[TIFF] skipping layer '{}' without a mask", layer.name());
                    continue;
                }
            };
            layer_metas.push(TiffLayerMeta {
                name: layer.name().to_string(),
                class_id: layer.class_id,
                opacity: layer.opacity,
                visibility: layer.visibility,
                x: layer.x,
                y: layer.y,
                page_index: pages.len() + 1,
            });
            pages.push(page);
        }

        let dim = img.dimension();
        let meta = TiffImageMeta {
            width: dim.width,
            height: dim.height,
            title: img.title().to_string(),
            properties: img.properties.clone(),
            metrics: img.metrics.clone(),
            layers: layer_metas,
        };
        let descriptor = format!("{}{}", TIFF_MARKER, serde_json::to_string(&meta)?);

        // Page 0: original raster with the descriptor tag
        let mut first_page = encoder.new_image::<RGBA8>(dim.width, dim.height)?;
        first_page
            .encoder()
            .write_tag(tiff::tags::Tag::ImageDescription, descriptor.as_str())?;
        first_page
            .encoder()
            .write_tag(tiff::tags::Tag::Software, "maskpack")?;
        first_page.write_data(img.original().as_raw())?;

        // Pages 1..N: per-layer classmap data
        for page_img in &pages {
            let page = encoder.new_image::<RGBA8>(page_img.width(), page_img.height())?;
            page.write_data(page_img.as_raw())?;
        }

        info!("[TIFF] Saved {:?}: {} mask layers", path, pages.len());
        Ok(())
    }
}
