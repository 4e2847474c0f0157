//! Error taxonomy shared by the model, codecs and conversion pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for maskpack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by maskpack operations
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown layer name/index, unknown codec name/extension, missing
    /// mandatory container entry or metadata key.
    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong/unsupported extension or a corrupt/incomplete container.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// The codec does not implement the requested direction (e.g. saving
    /// through a read-only bridge).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Write-once violation: asset overwrite without permission, duplicate
    /// extension claims, registration into a frozen registry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A codec produced no usable image for the given source file.
    #[error("conversion failed for {path}: no usable image")]
    ConversionFailed { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("TIFF error: {0}")]
    Tiff(String),
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

impl From<tiff::TiffError> for Error {
    fn from(e: tiff::TiffError) -> Self {
        Error::Tiff(e.to_string())
    }
}

impl Error {
    /// True when the error belongs to the Conflict class of the taxonomy.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// True when the error belongs to the NotFound class of the taxonomy.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
