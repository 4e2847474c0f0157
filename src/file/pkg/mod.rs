//! Package (.pkg) format support
//!
//! The package is a ZIP archive containing:
//! - meta.info: JSON manifest of the original raster and every mask layer
//! - properties.json / metrics.json: flat string-keyed metadata maps
//! - `<title>`.png: the original raster, losslessly encoded
//! - thumbnail.png: precomputed bounded preview
//! - layers/*.png: one encoded mask per manifest entry
//! - archive/**: the free-form asset store (see [`archive`])
//!
//! The manifest is mandatory; metadata files are optional on load. JSON and
//! pre-compressed PNG payloads are stored uncompressed, per-layer mask PNGs
//! are deflate-compressed.

pub mod archive;

pub use archive::PackageArchive;

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::file::category::CategoryFilter;
use crate::file::Codec;
use crate::model::encode::{decode_mask_png, decode_rgba_png, encode_classmap_png, encode_rgba_png};
use crate::model::{Layer, MultiLayerImage, PropertyValue, ORIGINAL_LAYER_KEY};

const MANIFEST_ENTRY: &str = "meta.info";
const PROPERTIES_ENTRY: &str = "properties.json";
const METRICS_ENTRY: &str = "metrics.json";
const THUMBNAIL_ENTRY: &str = "thumbnail.png";
const TITLE_PROPERTY: &str = "title";

/// One manifest record: where the entry's pixels live and how to present it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    file: String,
    opacity: f32,
    visibility: bool,
}

type Manifest = IndexMap<String, ManifestEntry>;

/// Codec for the package container.
pub struct PkgCodec {
    filter: CategoryFilter,
    extensions: Vec<String>,
    images_only: bool,
}

impl PkgCodec {
    pub fn new(filter: CategoryFilter, extensions: Vec<String>) -> Self {
        Self {
            filter,
            extensions,
            images_only: false,
        }
    }

    /// Skip the properties/metrics files on load.
    pub fn with_images_only(mut self, images_only: bool) -> Self {
        self.images_only = images_only;
        self
    }
}

fn read_entry_bytes(
    zip: &mut ZipArchive<BufReader<File>>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let mut entry = match zip.by_name(name) {
        Ok(e) => e,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::InvalidFormat(format!("malformed package manifest: {e}")))
}

impl Codec for PkgCodec {
    fn supported_extensions(&self) -> &[String] {
        &self.extensions
    }

    fn load(&mut self, path: &Path) -> Result<MultiLayerImage> {
        info!("[PKG] Loading file: {:?}", path);
        let file = File::open(path)?;
        let mut zip = ZipArchive::new(BufReader::new(file))?;

        // 1. Manifest is mandatory
        let manifest_bytes = read_entry_bytes(&mut zip, MANIFEST_ENTRY)?.ok_or_else(|| {
            Error::NotFound(format!(
                "package entry '{MANIFEST_ENTRY}' missing in {}",
                path.display()
            ))
        })?;
        let manifest = parse_manifest(&manifest_bytes)?;

        // 2. Decode the original raster
        let original_entry = manifest.get(ORIGINAL_LAYER_KEY).ok_or_else(|| {
            Error::InvalidFormat(format!(
                "package manifest has no '{ORIGINAL_LAYER_KEY}' entry"
            ))
        })?;
        let original_bytes =
            read_entry_bytes(&mut zip, &original_entry.file)?.ok_or_else(|| {
                Error::NotFound(format!(
                    "package entry '{}' missing in {}",
                    original_entry.file,
                    path.display()
                ))
            })?;
        let original = decode_rgba_png(&original_bytes)?;
        let mut img = MultiLayerImage::new(path, original);

        // 3. Metadata files, unless running images-only
        if !self.images_only {
            if let Some(bytes) = read_entry_bytes(&mut zip, PROPERTIES_ENTRY)? {
                let mut properties: IndexMap<String, PropertyValue> =
                    serde_json::from_slice(&bytes).map_err(|e| {
                        Error::InvalidFormat(format!("malformed {PROPERTIES_ENTRY}: {e}"))
                    })?;
                if let Some(title) = properties.shift_remove(TITLE_PROPERTY) {
                    img.set_title(&title.to_serial_string());
                }
                img.properties = properties;
            } else {
                debug!("[PKG] no {} entry, continuing without", PROPERTIES_ENTRY);
            }
            if let Some(bytes) = read_entry_bytes(&mut zip, METRICS_ENTRY)? {
                img.metrics = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::InvalidFormat(format!("malformed {METRICS_ENTRY}: {e}"))
                })?;
            }
        }

        // 4. Decode the kept mask layers
        for (name, entry) in &manifest {
            if name == ORIGINAL_LAYER_KEY {
                continue;
            }
            let class_id = match self.filter.resolve(name) {
                Some(id) => id,
                None => {
                    debug!("[PKG] skipping layer '{}' (not in categories)", name);
                    continue;
                }
            };
            let mask_bytes = read_entry_bytes(&mut zip, &entry.file)?.ok_or_else(|| {
                Error::NotFound(format!(
                    "package entry '{}' missing in {}",
                    entry.file,
                    path.display()
                ))
            })?;
            let mut layer = Layer::with_mask(name, class_id, decode_mask_png(&mask_bytes)?);
            layer.set_opacity(entry.opacity);
            layer.visibility = entry.visibility;
            img.layers.push(layer);
        }

        img.archive = Some(PackageArchive::new(path));
        info!(
            "[PKG] Loaded {:?}: {} mask layers, {}x{}",
            path,
            img.layers.len(),
            img.dimension().width,
            img.dimension().height
        );
        Ok(img)
    }

    fn save(&self, img: &MultiLayerImage, path: &Path) -> Result<()> {
        info!("[PKG] Saving file: {:?}", path);

        // 1. Capture free-form assets before the container is recreated
        let captured = if path.exists() && img.archive.is_some() {
            let assets = PackageArchive::new(path).collect_raw_assets()?;
            if !assets.is_empty() {
                debug!("[PKG] carrying {} assets across rewrite", assets.len());
            }
            assets
        } else {
            IndexMap::new()
        };

        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);

        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        let options_deflate = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        // 2. Metadata files, title merged into the properties
        let mut properties = img.properties.clone();
        properties.insert(
            TITLE_PROPERTY.to_string(),
            PropertyValue::Text(img.title().to_string()),
        );
        zip.start_file(PROPERTIES_ENTRY, options_stored)?;
        zip.write_all(&serde_json::to_vec_pretty(&properties)?)?;

        zip.start_file(METRICS_ENTRY, options_stored)?;
        zip.write_all(&serde_json::to_vec_pretty(&img.metrics)?)?;

        // 3. Original raster and preview
        let original_file = format!("{}.png", img.title());
        zip.start_file(original_file.as_str(), options_stored)?;
        zip.write_all(&encode_rgba_png(img.original())?)?;

        zip.start_file(THUMBNAIL_ENTRY, options_stored)?;
        zip.write_all(&encode_rgba_png(&img.thumbnail())?)?;

        // 4. Mask layers
        let mut manifest = Manifest::new();
        manifest.insert(
            ORIGINAL_LAYER_KEY.to_string(),
            ManifestEntry {
                file: original_file,
                opacity: 1.0,
                visibility: true,
            },
        );
        for layer in &img.layers {
            if !layer.is_valid() {
                warn!("[PKG] skipping layer '{}' without a mask", layer.name());
                continue;
            }
            let entry_file = format!("layers/{}.png", layer.name());
            zip.start_file(entry_file.as_str(), options_deflate)?;
            zip.write_all(&encode_classmap_png(layer)?)?;
            manifest.insert(
                layer.name().to_string(),
                ManifestEntry {
                    file: entry_file,
                    opacity: layer.opacity,
                    visibility: layer.visibility,
                },
            );
        }

        // 5. Manifest goes in last
        zip.start_file(MANIFEST_ENTRY, options_stored)?;
        zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

        // 6. Re-inject captured assets
        for (physical, bytes) in &captured {
            zip.start_file(physical.as_str(), options_stored)?;
            zip.write_all(bytes)?;
        }

        zip.finish()?;
        info!(
            "[PKG] Saved {:?}: {} mask layers, {} assets",
            path,
            manifest.len() - 1,
            captured.len()
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_json() {
        let mut manifest = Manifest::new();
        manifest.insert(
            "original".to_string(),
            ManifestEntry {
                file: "bridge.png".to_string(),
                opacity: 1.0,
                visibility: true,
            },
        );
        manifest.insert(
            "crack".to_string(),
            ManifestEntry {
                file: "layers/crack.png".to_string(),
                opacity: 0.5,
                visibility: false,
            },
        );

        let json = serde_json::to_vec_pretty(&manifest).unwrap();
        let parsed = parse_manifest(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get_index(0).unwrap().0, "original");
        assert_eq!(parsed["crack"].file, "layers/crack.png");
        assert_eq!(parsed["crack"].opacity, 0.5);
        assert!(!parsed["crack"].visibility);
    }

    #[test]
    fn malformed_manifest_is_invalid_format() {
        let err = parse_manifest(b"{ not json").unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }
}
