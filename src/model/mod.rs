//! In-memory multi-layer image model
//!
//! A [`MultiLayerImage`] is one base raster (the "original" layer) plus an
//! ordered list of named binary mask [`Layer`]s, each tagged with a semantic
//! class id. Codecs under [`crate::file`] load and save this model; the
//! composition and statistics operators live in [`render`] and [`stats`].

pub mod encode;
pub mod render;
pub mod stats;

use std::fmt;
use std::path::{Path, PathBuf};

use image::{GrayImage, RgbaImage};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::file::pkg::archive::PackageArchive;

/// Reserved name of the base raster layer.
pub const ORIGINAL_LAYER_KEY: &str = "original";

/// Width/height pair of a raster or mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count, floored to 1 so it is safe as a divisor.
    pub fn area_clamped(&self) -> u64 {
        (u64::from(self.width) * u64::from(self.height)).max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Normalize a layer name into its identity key: trimmed and lower-cased.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A named binary mask plus class id, opacity, visibility and offset.
///
/// The mask is a 0/1 `GrayImage`; everything a codec writes for the layer is
/// derived from `mask * class_id` (the classmap). Offsets are non-zero only
/// when the mask is smaller than the image canvas.
#[derive(Clone)]
pub struct Layer {
    name: String,
    /// Layer opacity in [0, 1]. Clamped by the constructors and setters.
    pub opacity: f32,
    /// Whether the layer is hidden (false) or shown (true).
    pub visibility: bool,
    /// Semantic class id; class maps are 8-bit, so ids live in 0..=255.
    pub class_id: u8,
    /// Binary 0/1 mask. A layer without a mask is not valid yet.
    pub image: Option<GrayImage>,
    /// Horizontal placement of the mask on the canvas.
    pub x: i32,
    /// Vertical placement of the mask on the canvas.
    pub y: i32,
}

impl Layer {
    /// Create an empty layer with default attributes (opacity 1.0, visible,
    /// class id 1, no mask).
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize_name(name),
            opacity: 1.0,
            visibility: true,
            class_id: 1,
            image: None,
            x: 0,
            y: 0,
        }
    }

    /// Create a layer carrying a binary mask.
    pub fn with_mask(name: &str, class_id: u8, mask: GrayImage) -> Self {
        let mut layer = Self::new(name);
        layer.class_id = class_id;
        layer.image = Some(mask);
        layer
    }

    /// Normalized layer name (the identity key).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = normalize_name(name);
    }

    /// Set the opacity, clamped into [0, 1].
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    /// A layer is valid once its mask is present.
    pub fn is_valid(&self) -> bool {
        self.image.is_some()
    }

    /// Mask shape, if a mask is present.
    pub fn dimension(&self) -> Option<Dimension> {
        self.image
            .as_ref()
            .map(|m| Dimension::new(m.width(), m.height()))
    }

    /// Number of set pixels in the mask.
    pub fn pixel_count(&self) -> u64 {
        match &self.image {
            Some(mask) => mask.pixels().filter(|p| p.0[0] != 0).count() as u64,
            None => 0,
        }
    }

    /// The classmap: mask multiplied elementwise by the class id.
    pub fn classmap(&self) -> Option<GrayImage> {
        let mask = self.image.as_ref()?;
        let mut map = mask.clone();
        for px in map.pixels_mut() {
            px.0[0] = if px.0[0] != 0 { self.class_id } else { 0 };
        }
        Some(map)
    }

    /// RGBA rendering of the classmap: opaque gray class value where the
    /// mask is set, transparent elsewhere.
    pub fn classmap_rgba(&self) -> Option<RgbaImage> {
        let mask = self.image.as_ref()?;
        let mut out = RgbaImage::new(mask.width(), mask.height());
        for (src, dst) in mask.pixels().zip(out.pixels_mut()) {
            if src.0[0] != 0 {
                dst.0 = [self.class_id, self.class_id, self.class_id, 255];
            }
        }
        Some(out)
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("class_id", &self.class_id)
            .field("opacity", &self.opacity)
            .field("visibility", &self.visibility)
            .field("dimension", &self.dimension())
            .field("offset", &(self.x, self.y))
            .finish()
    }
}

/// A property value attached to an image: free text or a raw binary payload.
///
/// Binary payloads are hex-encoded when the map is serialized into package
/// metadata entries; they come back as text on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Binary(Vec<u8>),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Binary(_) => None,
        }
    }

    /// The serialized form: text verbatim, binary as lowercase hex.
    pub fn to_serial_string(&self) -> String {
        match self {
            PropertyValue::Text(s) => s.clone(),
            PropertyValue::Binary(b) => hex::encode(b),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Text(s)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(b: Vec<u8>) -> Self {
        PropertyValue::Binary(b)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_serial_string())
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_serial_string())
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(PropertyValue::Text(String::deserialize(deserializer)?))
    }
}

/// An original raster plus an ordered set of mask layers and metadata.
///
/// The canvas dimension is defined by the original raster; mask layers may be
/// smaller and carry offsets. Layer names are not required to be unique;
/// lookups return the first match.
pub struct MultiLayerImage {
    filepath: PathBuf,
    title: String,
    /// Open string-keyed metadata (text or binary values).
    pub properties: IndexMap<String, PropertyValue>,
    /// String-keyed numeric metrics (IoU, F1, ...).
    pub metrics: IndexMap<String, f64>,
    /// Ordered mask layers. The original raster is not part of this list.
    pub layers: Vec<Layer>,
    original: RgbaImage,
    /// Free-form asset store handle, present for images loaded from a
    /// package file.
    pub archive: Option<PackageArchive>,
}

impl MultiLayerImage {
    /// Create an image from a base raster. The title defaults to the file
    /// stem of `filepath`.
    pub fn new(filepath: impl Into<PathBuf>, original: RgbaImage) -> Self {
        let filepath = filepath.into();
        let title = filepath
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            filepath,
            title,
            properties: IndexMap::new(),
            metrics: IndexMap::new(),
            layers: Vec::new(),
            original,
            archive: None,
        }
    }

    /// Build a package-ready image from a bare raster file: the original
    /// layer only, zero mask layers.
    pub fn from_image_file(path: &Path) -> Result<Self> {
        let original = image::open(path)?.to_rgba8();
        Ok(Self::new(path, original))
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    pub fn set_filepath(&mut self, filepath: impl Into<PathBuf>) {
        self.filepath = filepath.into();
    }

    /// File name component of the path.
    pub fn filename(&self) -> String {
        self.filepath
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
    }

    /// The base raster.
    pub fn original(&self) -> &RgbaImage {
        &self.original
    }

    /// Canvas dimension, defined by the original raster.
    pub fn dimension(&self) -> Dimension {
        Dimension::new(self.original.width(), self.original.height())
    }

    /// Mask layer count plus one for the original layer.
    pub fn count_layers(&self) -> usize {
        self.layers.len() + 1
    }

    /// Names of the mask layers, in order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Look a mask layer up by name (first match wins).
    pub fn get_layer(&self, name: &str) -> Result<&Layer> {
        let key = normalize_name(name);
        self.layers
            .iter()
            .find(|l| l.name() == key)
            .ok_or_else(|| Error::NotFound(format!("layer '{key}' does not exist")))
    }

    /// Mutable variant of [`Self::get_layer`].
    pub fn get_layer_mut(&mut self, name: &str) -> Result<&mut Layer> {
        let key = normalize_name(name);
        self.layers
            .iter_mut()
            .find(|l| l.name() == key)
            .ok_or_else(|| Error::NotFound(format!("layer '{key}' does not exist")))
    }

    /// Look a mask layer up by positional index.
    pub fn get_layer_by_index(&self, index: usize) -> Result<&Layer> {
        self.layers
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("layer index {index} is out of range")))
    }

    pub fn get_property(&self, key: &str) -> Result<&PropertyValue> {
        self.properties
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("property '{key}' not found")))
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn get_metric(&self, key: &str) -> Result<f64> {
        self.metrics
            .get(key)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("metric '{key}' not found")))
    }

    pub fn set_metric(&mut self, key: &str, value: f64) {
        self.metrics.insert(key.to_string(), value);
    }

    /// Adopt the pixel payload (original raster and mask layers) of another
    /// image while keeping this image's path, title and metadata. Used after
    /// reloading an externally edited intermediate file.
    pub fn update_from(&mut self, other: MultiLayerImage) {
        self.original = other.original;
        self.layers = other.layers;
    }

    /// Replace the base raster.
    pub fn set_original(&mut self, original: RgbaImage) {
        self.original = original;
    }
}

impl fmt::Debug for MultiLayerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLayerImage")
            .field("filepath", &self.filepath)
            .field("title", &self.title)
            .field("dimension", &self.dimension())
            .field("layers", &self.layer_names())
            .field("properties", &self.properties.len())
            .field("metrics", &self.metrics.len())
            .field("archive", &self.archive.is_some())
            .finish()
    }
}
