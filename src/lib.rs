//! Maskpack - multi-layer mask annotation containers
//!
//! A multi-layer image pairs an original raster with named binary mask
//! layers, one per annotation category. This crate owns the package
//! container format and bridges it to OpenRaster, multi-page TIFF and
//! Photoshop documents, with batch conversion between any two registered
//! formats.

pub mod convert;
pub mod error;
pub mod file;
pub mod model;

pub use convert::{calculate_stats, ConversionOutcome, ConversionPipeline};
pub use error::{Error, Result};
pub use file::category::CategoryFilter;
pub use file::registry::{CodecEntry, CodecRegistry};
pub use file::{Codec, PackageArchive};
pub use model::stats::{ImageStats, LayerStats};
pub use model::{Dimension, Layer, MultiLayerImage, PropertyValue, ORIGINAL_LAYER_KEY};
