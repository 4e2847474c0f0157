//! File format support module
//!
//! Provides save/load functionality for:
//! - Package (.pkg) - Primary annotation container with the free-form asset store
//! - OpenRaster (.ora) - Interchange format readable by layered raster editors
//! - TIFF (.tif/.tiff) - Multi-page intermediate for external editing round trips
//! - PSD (.psd) - Adobe Photoshop format, read-only

pub mod category;
pub mod ora;
pub mod pkg;
pub mod psd;
pub mod registry;
pub mod tiff;

pub use pkg::PackageArchive;

use std::path::Path;

use crate::error::Result;
use crate::model::MultiLayerImage;

/// Lowercased extension of a path, without the dot.
pub fn path_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Uniform load/save contract implemented by every format adapter.
///
/// Instances are built by [`registry::CodecRegistry::build`], which binds the
/// supported extension list and the category filter. `load` takes `&mut self`
/// because open-set filters assign class ids lazily during it.
pub trait Codec {
    /// Extensions bound at construction, lowercased, first entry primary.
    fn supported_extensions(&self) -> &[String];

    /// Extension membership check.
    fn is_valid(&self, path: &Path) -> bool {
        match path_extension(path) {
            Some(ext) => self.supported_extensions().iter().any(|e| *e == ext),
            None => false,
        }
    }

    fn load(&mut self, path: &Path) -> Result<MultiLayerImage>;

    fn save(&self, img: &MultiLayerImage, path: &Path) -> Result<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(
            path_extension(&PathBuf::from("a/B.PKG")),
            Some("pkg".to_string())
        );
        assert_eq!(path_extension(&PathBuf::from("noext")), None);
    }
}
