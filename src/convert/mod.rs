//! Format conversion pipeline
//!
//! Pairs two registered codecs to transcode single files or whole
//! directories. Directory batches isolate per-file failures and can fan
//! out over a bounded worker pool; workers share only the read-only
//! registry and build fresh codec instances per file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::file::category::CategoryFilter;
use crate::file::registry::CodecRegistry;
use crate::file::path_extension;
use crate::model::stats::ImageStats;

/// The per-file record produced by a directory batch.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub source: PathBuf,
    pub success: bool,
    pub error: Option<String>,
}

/// Transcodes files between two formats picked from a registry.
///
/// Both codec keys are resolved at construction, so an unknown format
/// fails before any file is touched. The pipeline itself holds no open
/// resources; every conversion builds fresh codec instances, which is
/// what lets directory batches run file-per-worker without sharing.
#[derive(Debug)]
pub struct ConversionPipeline<'r> {
    registry: &'r CodecRegistry,
    source_key: String,
    dest_key: String,
    filter: CategoryFilter,
    workers: usize,
}

impl<'r> ConversionPipeline<'r> {
    /// Pair a source and destination format by codec name or extension.
    pub fn new(
        registry: &'r CodecRegistry,
        source: &str,
        dest: &str,
        filter: CategoryFilter,
    ) -> Result<Self> {
        registry.find(source)?;
        registry.find(dest)?;
        Ok(Self {
            registry,
            source_key: source.to_string(),
            dest_key: dest.to_string(),
            filter,
            workers: 0,
        })
    }

    /// Derive the format pair from two file paths' extensions.
    pub fn for_paths(
        registry: &'r CodecRegistry,
        source: &Path,
        dest: &Path,
        filter: CategoryFilter,
    ) -> Result<Self> {
        let source_ext = path_extension(source).ok_or_else(|| {
            Error::InvalidFormat(format!("file has no extension: {}", source.display()))
        })?;
        let dest_ext = path_extension(dest).ok_or_else(|| {
            Error::InvalidFormat(format!("file has no extension: {}", dest.display()))
        })?;
        Self::new(registry, &source_ext, &dest_ext, filter)
    }

    /// Cap the worker pool for directory batches. Zero picks the
    /// default thread count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Convert a single file.
    pub fn convert_file(&self, source: &Path, dest: &Path) -> Result<()> {
        let mut source_codec = self.registry.build(&self.source_key, self.filter.clone())?;
        if !source_codec.is_valid(source) {
            return Err(Error::InvalidFormat(format!(
                "file is not valid for the source format: {}",
                source.display()
            )));
        }
        let img = source_codec.load(source)?;
        if img.dimension().is_empty() {
            return Err(Error::ConversionFailed {
                path: source.to_path_buf(),
            });
        }
        let dest_codec = self.registry.build(&self.dest_key, self.filter.clone())?;
        dest_codec.save(&img, dest)
    }

    /// Where a converted source file lands inside `dest_dir`.
    fn output_path(&self, source: &Path, dest_dir: &Path) -> Result<PathBuf> {
        let stem = source.file_stem().ok_or_else(|| {
            Error::InvalidFormat(format!("file has no name: {}", source.display()))
        })?;
        let extension = self.registry.find(&self.dest_key)?.primary_extension();
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(extension);
        Ok(dest_dir.join(name))
    }

    fn convert_one(
        &self,
        entry: std::result::Result<PathBuf, glob::GlobError>,
        dest_dir: &Path,
    ) -> ConversionOutcome {
        let source = match entry {
            Ok(path) => path,
            Err(e) => {
                let source = e.path().to_path_buf();
                warn!("[CONVERT] Cannot read {:?}: {}", source, e);
                return ConversionOutcome {
                    source,
                    success: false,
                    error: Some(e.to_string()),
                };
            }
        };
        debug!("[CONVERT] {:?} -> {:?}", source, dest_dir);
        let result = self
            .output_path(&source, dest_dir)
            .and_then(|out| self.convert_file(&source, &out));
        match result {
            Ok(()) => ConversionOutcome {
                source,
                success: true,
                error: None,
            },
            Err(e) => {
                warn!("[CONVERT] Conversion failed for {:?}: {}", source, e);
                ConversionOutcome {
                    source,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Convert every file matching `pattern` into `dest_dir`, eagerly.
    ///
    /// Each file is an independent unit of work; one failure never aborts
    /// the rest of the batch. Fan-out is bounded by [`with_workers`].
    ///
    /// [`with_workers`]: ConversionPipeline::with_workers
    pub fn convert_dir(&self, pattern: &str, dest_dir: &Path) -> Result<Vec<ConversionOutcome>> {
        fs::create_dir_all(dest_dir)?;
        let entries = glob::glob(pattern).map_err(|e| {
            Error::InvalidFormat(format!("bad search pattern '{pattern}': {e}"))
        })?;
        let sources: Vec<_> = entries.collect();
        info!(
            "[CONVERT] Batch of {} files: {} -> {} in {:?}",
            sources.len(),
            self.source_key,
            self.dest_key,
            dest_dir
        );

        use rayon::prelude::*;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let outcomes = pool.install(|| {
            sources
                .into_par_iter()
                .map(|entry| self.convert_one(entry, dest_dir))
                .collect::<Vec<_>>()
        });

        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(
            "[CONVERT] Batch done: {} converted, {} failed",
            outcomes.len() - failed,
            failed
        );
        Ok(outcomes)
    }

    /// Single-pass variant of [`convert_dir`]: files are converted one at
    /// a time as the returned sequence is advanced, and the sequence
    /// cannot be restarted.
    ///
    /// [`convert_dir`]: ConversionPipeline::convert_dir
    pub fn convert_dir_lazy<'a>(
        &'a self,
        pattern: &str,
        dest_dir: &Path,
    ) -> Result<impl Iterator<Item = ConversionOutcome> + 'a> {
        fs::create_dir_all(dest_dir)?;
        let entries = glob::glob(pattern).map_err(|e| {
            Error::InvalidFormat(format!("bad search pattern '{pattern}': {e}"))
        })?;
        let dest_dir = dest_dir.to_path_buf();
        Ok(entries.map(move |entry| self.convert_one(entry, &dest_dir)))
    }
}

/// Analyze a set of files, yielding each file's statistics as the
/// sequence is advanced. Files are loaded one at a time.
pub fn calculate_stats<'a>(
    registry: &'a CodecRegistry,
    files: &'a [PathBuf],
    filter: &'a CategoryFilter,
) -> impl Iterator<Item = (PathBuf, Result<ImageStats>)> + 'a {
    files.iter().map(move |path| {
        debug!("[CONVERT] Analyzing {:?}", path);
        let stats = registry
            .load_file(path, filter.clone())
            .map(|img| img.get_stats());
        (path.clone(), stats)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn filter() -> CategoryFilter {
        CategoryFilter::explicit([("crack", 100u8)])
    }

    #[test]
    fn unknown_source_format_is_rejected() {
        let registry = CodecRegistry::builtin();
        let err = ConversionPipeline::new(&registry, "bmp", "pkg", filter()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unknown_dest_format_is_rejected() {
        let registry = CodecRegistry::builtin();
        let err = ConversionPipeline::new(&registry, "pkg", "bmp", filter()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn format_pair_derives_from_paths() {
        let registry = CodecRegistry::builtin();
        let pipeline = ConversionPipeline::for_paths(
            &registry,
            Path::new("in/a.pkg"),
            Path::new("out/a.tif"),
            filter(),
        )
        .unwrap();
        assert_eq!(pipeline.source_key, "pkg");
        assert_eq!(pipeline.dest_key, "tif");
    }

    #[test]
    fn extensionless_path_is_rejected() {
        let registry = CodecRegistry::builtin();
        let err = ConversionPipeline::for_paths(
            &registry,
            Path::new("in/a"),
            Path::new("out/a.tif"),
            filter(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[test]
    fn output_name_uses_primary_extension() {
        let registry = CodecRegistry::builtin();
        let pipeline = ConversionPipeline::new(&registry, "pkg", "tiff", filter()).unwrap();
        let out = pipeline
            .output_path(Path::new("in/photo.pkg"), Path::new("out"))
            .unwrap();
        assert_eq!(out, PathBuf::from("out/photo.tif"));
    }

    #[test]
    fn bad_pattern_is_invalid_format() {
        let registry = CodecRegistry::builtin();
        let pipeline = ConversionPipeline::new(&registry, "pkg", "tiff", filter()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = pipeline.convert_dir("a[", dir.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }
}
