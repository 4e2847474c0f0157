//! Free-form asset store embedded in package files
//!
//! Assets live under the `archive/` entry prefix of the package container,
//! addressed by dotted logical paths: `a.b.c` maps to `archive/a/b/c.png`.
//! Every payload is PNG-encoded. The store is independent of the fixed
//! layer/metadata schema, so downstream tools can attach derived rasters
//! (inference outputs, post-processing results) to the same file.
//!
//! Every operation opens the container on entry and closes it before
//! returning; writers are finished explicitly, with drop finalization as
//! the error-path backstop. Handles are not safe to share across threads
//! or processes writing the same file.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use image::RgbaImage;
use indexmap::IndexMap;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::model::encode::{decode_rgba_png, encode_rgba_png};

/// Entry prefix of the free-form asset area inside the container.
pub const ARCHIVE_ROOT: &str = "archive/";

/// Decoded assets kept per handle. Small on purpose, the cache exists to
/// absorb repeated reads of a hot asset, not to hold the archive.
const ASSET_CACHE_CAPACITY: usize = 3;

/// Map a dotted logical path to its physical container entry.
pub fn physical_path(logical: &str) -> Result<String> {
    if logical.trim().is_empty() {
        return Err(Error::InvalidFormat("asset path is empty".to_string()));
    }
    let mut segments = Vec::new();
    for segment in logical.split('.') {
        if segment.is_empty() {
            return Err(Error::InvalidFormat(format!(
                "asset path '{logical}' has an empty segment"
            )));
        }
        if segment.contains('/') || segment.contains('\\') {
            return Err(Error::InvalidFormat(format!(
                "asset path '{logical}' must use dots as separators"
            )));
        }
        segments.push(segment);
    }
    Ok(format!("{ARCHIVE_ROOT}{}.png", segments.join("/")))
}

/// Map a physical container entry back to its dotted logical path.
pub fn logical_path(physical: &str) -> Option<String> {
    let stem = physical.strip_prefix(ARCHIVE_ROOT)?.strip_suffix(".png")?;
    if stem.is_empty() || stem.split('/').any(str::is_empty) {
        return None;
    }
    Some(stem.replace('/', "."))
}

fn is_asset_entry(name: &str) -> bool {
    name.starts_with(ARCHIVE_ROOT) && name.ends_with(".png")
}

/// Handle to the asset area of one package file.
pub struct PackageArchive {
    filepath: PathBuf,
    cache: IndexMap<String, RgbaImage>,
}

impl PackageArchive {
    pub fn new(filepath: impl Into<PathBuf>) -> Self {
        Self {
            filepath: filepath.into(),
            cache: IndexMap::new(),
        }
    }

    /// Path of the package file this handle points at.
    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    fn open_reader(&self) -> Result<ZipArchive<BufReader<File>>> {
        let file = File::open(&self.filepath)?;
        Ok(ZipArchive::new(BufReader::new(file))?)
    }

    fn cache_touch(&mut self, physical: &str) -> Option<RgbaImage> {
        let image = self.cache.shift_remove(physical)?;
        self.cache.insert(physical.to_string(), image.clone());
        Some(image)
    }

    fn cache_insert(&mut self, physical: String, image: RgbaImage) {
        while self.cache.len() >= ASSET_CACHE_CAPACITY {
            self.cache.shift_remove_index(0);
        }
        self.cache.insert(physical, image);
    }

    /// Drop every cached decode.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Read an asset by dotted path, decoding its PNG payload.
    ///
    /// Recently read assets are served from an in-handle cache; the cache is
    /// invalidated whenever the same path is overwritten.
    pub fn get_asset(&mut self, path: &str) -> Result<RgbaImage> {
        let physical = physical_path(path)?;
        if let Some(image) = self.cache_touch(&physical) {
            debug!("[PKG] asset cache hit: {}", path);
            return Ok(image);
        }

        let mut archive = self.open_reader()?;
        let bytes = read_entry(&mut archive, &physical)
            .map_err(|err| not_found_as_asset(err, path))?;
        let image = decode_rgba_png(&bytes)?;
        debug!("[PKG] asset loaded: {} ({} bytes)", path, bytes.len());
        self.cache_insert(physical, image.clone());
        Ok(image)
    }

    /// Write an asset under a dotted path.
    ///
    /// Fails with [`Error::Conflict`] when the path already exists and
    /// `overwrite` is false. New paths are appended to the container;
    /// overwrites rewrite it so the replaced payload is gone for good.
    pub fn set_asset(&mut self, path: &str, data: &RgbaImage, overwrite: bool) -> Result<()> {
        let physical = physical_path(path)?;
        let bytes = encode_rgba_png(data)?;

        let exists = self.open_reader()?.index_for_name(&physical).is_some();
        if exists && !overwrite {
            return Err(Error::Conflict(format!(
                "asset '{path}' already exists (pass overwrite to replace it)"
            )));
        }

        if exists {
            self.rewrite_with(&physical, &bytes)?;
        } else {
            self.append_entry(&physical, &bytes)?;
        }
        debug!(
            "[PKG] asset written: {} ({} bytes, replaced: {})",
            path,
            bytes.len(),
            exists
        );
        self.cache.shift_remove(&physical);
        Ok(())
    }

    fn append_entry(&self, physical: &str, bytes: &[u8]) -> Result<()> {
        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.filepath)?;
        let mut zip = ZipWriter::new_append(file)?;
        zip.start_file(physical, options_stored)?;
        zip.write_all(bytes)?;
        zip.finish()?;
        Ok(())
    }

    fn rewrite_with(&self, physical: &str, bytes: &[u8]) -> Result<()> {
        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);

        let staging = self.filepath.with_extension("tmp");
        {
            let mut source = self.open_reader()?;
            let out = File::create(&staging)?;
            let mut zip = ZipWriter::new(out);
            for index in 0..source.len() {
                let entry = source.by_index_raw(index)?;
                if entry.name() == physical {
                    continue;
                }
                zip.raw_copy_file(entry)?;
            }
            zip.start_file(physical, options_stored)?;
            zip.write_all(bytes)?;
            zip.finish()?;
        }
        fs::rename(&staging, &self.filepath)?;
        Ok(())
    }

    /// Dotted paths of every asset in the container, deduplicated.
    pub fn get_asset_list(&self) -> Result<Vec<String>> {
        let archive = self.open_reader()?;
        let mut paths = Vec::new();
        for name in archive.file_names() {
            if let Some(logical) = logical_path(name) {
                if !paths.contains(&logical) {
                    paths.push(logical);
                }
            }
        }
        Ok(paths)
    }

    /// Read and decode every asset in one pass. Bypasses the cache so a
    /// bulk read does not evict hot entries.
    pub fn get_assets(&self) -> Result<IndexMap<String, RgbaImage>> {
        let mut archive = self.open_reader()?;
        let names: Vec<String> = archive
            .file_names()
            .filter(|n| is_asset_entry(n))
            .map(str::to_string)
            .collect();

        let mut assets = IndexMap::new();
        for name in names {
            let logical = match logical_path(&name) {
                Some(p) => p,
                None => continue,
            };
            let bytes = read_entry(&mut archive, &name)?;
            assets.insert(logical, decode_rgba_png(&bytes)?);
        }
        Ok(assets)
    }

    /// Raw PNG payloads of every asset entry, keyed by physical path. Used
    /// when the container is rewritten wholesale and the asset area must
    /// survive the rewrite. Payloads stay PNG-encoded, never pixel-decoded.
    pub(crate) fn collect_raw_assets(&self) -> Result<IndexMap<String, Vec<u8>>> {
        let mut archive = self.open_reader()?;
        let names: Vec<String> = archive
            .file_names()
            .filter(|n| is_asset_entry(n))
            .map(str::to_string)
            .collect();

        let mut assets = IndexMap::new();
        for name in names {
            let bytes = read_entry(&mut archive, &name)?;
            assets.insert(name, bytes);
        }
        Ok(assets)
    }
}

impl fmt::Debug for PackageArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageArchive")
            .field("filepath", &self.filepath)
            .field("cached", &self.cache.len())
            .finish()
    }
}

fn read_entry(archive: &mut ZipArchive<BufReader<File>>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn not_found_as_asset(err: Error, path: &str) -> Error {
    match err {
        Error::Zip(zip::result::ZipError::FileNotFound) => {
            Error::NotFound(format!("asset '{path}' not found in archive"))
        }
        other => other,
    }
}
