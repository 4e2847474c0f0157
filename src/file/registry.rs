//! Codec registry
//!
//! An explicit, write-once table mapping codec names to constructors and
//! their claimed file extensions. Extension claims are validated at
//! registration time; once frozen, the registry rejects further
//! registrations, so a populated registry can be shared by reference
//! across worker threads without interior locking.

use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::file::category::CategoryFilter;
use crate::file::{ora, path_extension, pkg, psd, tiff, Codec};
use crate::model::MultiLayerImage;

/// Constructor bound at registration: builds a codec instance carrying the
/// given filter and the extension list the registry claimed for it.
pub type CodecConstructor = fn(CategoryFilter, Vec<String>) -> Box<dyn Codec>;

/// One registered format.
#[derive(Debug)]
pub struct CodecEntry {
    name: String,
    extensions: Vec<String>,
    constructor: CodecConstructor,
}

impl CodecEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// The extension used when naming converted output files.
    pub fn primary_extension(&self) -> &str {
        &self.extensions[0]
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

/// Write-once codec table.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    entries: Vec<CodecEntry>,
    frozen: bool,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The start-up registry with every shipped codec, frozen.
    pub fn builtin() -> Self {
        let shipped: [(&str, &[&str], CodecConstructor); 4] = [
            ("pkg", &["pkg"], |filter, exts| {
                Box::new(pkg::PkgCodec::new(filter, exts))
            }),
            ("openraster", &["ora"], |filter, exts| {
                Box::new(ora::OraCodec::new(filter, exts))
            }),
            ("tiff", &["tif", "tiff"], |filter, exts| {
                Box::new(tiff::TiffCodec::new(filter, exts))
            }),
            ("psd", &["psd"], |filter, exts| {
                Box::new(psd::PsdCodec::new(filter, exts))
            }),
        ];
        let mut registry = Self::new();
        for (name, extensions, constructor) in shipped {
            registry.entries.push(CodecEntry {
                name: name.to_string(),
                extensions: extensions.iter().map(|e| e.to_string()).collect(),
                constructor,
            });
        }
        registry.freeze();
        registry
    }

    /// Register a codec under `name`, claiming `extensions`.
    ///
    /// Fails with [`Error::Conflict`] when the registry is frozen, the name
    /// is taken, or any extension is already claimed by another codec.
    pub fn register(
        &mut self,
        name: &str,
        extensions: &[&str],
        constructor: CodecConstructor,
    ) -> Result<()> {
        if self.frozen {
            return Err(Error::Conflict(format!(
                "registry is frozen, cannot register codec '{name}'"
            )));
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Error::Conflict(format!(
                "codec '{name}' is already registered"
            )));
        }
        let extensions: Vec<String> = extensions.iter().map(|e| normalize_extension(e)).collect();
        if extensions.is_empty() || extensions.iter().any(String::is_empty) {
            return Err(Error::InvalidFormat(format!(
                "codec '{name}' must claim at least one non-empty extension"
            )));
        }
        for ext in &extensions {
            if let Some(owner) = self
                .entries
                .iter()
                .find(|e| e.extensions.iter().any(|x| x == ext))
            {
                return Err(Error::Conflict(format!(
                    "extension '{ext}' claimed by '{name}' is already covered by '{}'",
                    owner.name
                )));
            }
        }
        debug!("registered codec '{}' for {:?}", name, extensions);
        self.entries.push(CodecEntry {
            name: name.to_string(),
            extensions,
            constructor,
        });
        Ok(())
    }

    /// Make the registry immutable. Registrations after this fail.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Registered codec names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Look an entry up by codec name or by one of its extensions.
    pub fn find(&self, name_or_extension: &str) -> Result<&CodecEntry> {
        if let Some(entry) = self.entries.iter().find(|e| e.name == name_or_extension) {
            return Ok(entry);
        }
        let ext = normalize_extension(name_or_extension);
        self.entries
            .iter()
            .find(|e| e.extensions.iter().any(|x| *x == ext))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no codec registered under name or extension '{name_or_extension}'"
                ))
            })
    }

    /// Instantiate a codec with the given category filter.
    pub fn build(&self, name_or_extension: &str, filter: CategoryFilter) -> Result<Box<dyn Codec>> {
        let entry = self.find(name_or_extension)?;
        Ok((entry.constructor)(filter, entry.extensions.clone()))
    }

    /// Load a file, picking the codec from the file extension.
    pub fn load_file(&self, path: &Path, filter: CategoryFilter) -> Result<MultiLayerImage> {
        if !path.is_file() {
            return Err(Error::NotFound(format!(
                "file does not exist: {}",
                path.display()
            )));
        }
        let ext = path_extension(path).ok_or_else(|| {
            Error::InvalidFormat(format!("file has no extension: {}", path.display()))
        })?;
        let mut codec = self.build(&ext, filter)?;
        codec.load(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct NullCodec {
        extensions: Vec<String>,
    }

    impl Codec for NullCodec {
        fn supported_extensions(&self) -> &[String] {
            &self.extensions
        }

        fn load(&mut self, path: &Path) -> Result<MultiLayerImage> {
            Err(Error::NotFound(format!("nothing at {}", path.display())))
        }

        fn save(&self, _img: &MultiLayerImage, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn null_constructor(_filter: CategoryFilter, exts: Vec<String>) -> Box<dyn Codec> {
        Box::new(NullCodec { extensions: exts })
    }

    #[test]
    fn duplicate_extension_claims_conflict() {
        let mut registry = CodecRegistry::new();
        registry
            .register("first", &["tif"], null_constructor)
            .unwrap();
        let err = registry
            .register("second", &["tif", "other"], null_constructor)
            .unwrap_err();
        assert!(err.is_conflict(), "got {err:?}");
    }

    #[test]
    fn duplicate_name_conflicts() {
        let mut registry = CodecRegistry::new();
        registry.register("a", &["x"], null_constructor).unwrap();
        let err = registry.register("a", &["y"], null_constructor).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let mut registry = CodecRegistry::new();
        registry.register("a", &["x"], null_constructor).unwrap();
        registry.freeze();
        let err = registry.register("b", &["y"], null_constructor).unwrap_err();
        assert!(err.is_conflict());
        assert!(registry.is_frozen());
    }

    #[test]
    fn lookup_by_name_and_extension() {
        let mut registry = CodecRegistry::new();
        registry
            .register("tiff", &[".TIF", "tiff"], null_constructor)
            .unwrap();
        assert_eq!(registry.find("tiff").unwrap().name(), "tiff");
        assert_eq!(registry.find("tif").unwrap().primary_extension(), "tif");
        assert!(registry.find("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn built_codec_carries_claimed_extensions() {
        let mut registry = CodecRegistry::new();
        registry
            .register("null", &["abc"], null_constructor)
            .unwrap();
        let codec = registry
            .build("null", CategoryFilter::open_set(["crack"]))
            .unwrap();
        assert!(codec.is_valid(&PathBuf::from("f.abc")));
        assert!(!codec.is_valid(&PathBuf::from("f.def")));
    }

    #[test]
    fn builtin_registry_is_frozen_with_all_codecs() {
        let registry = CodecRegistry::builtin();
        assert!(registry.is_frozen());
        assert_eq!(registry.names(), vec!["pkg", "openraster", "tiff", "psd"]);
        assert_eq!(registry.find("ora").unwrap().name(), "openraster");
        assert_eq!(registry.find("tiff").unwrap().primary_extension(), "tif");
    }
}
