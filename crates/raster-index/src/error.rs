//! Error types for raster index computation.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur while computing and writing an index raster.
#[derive(Error, Debug)]
pub enum RasterIndexError {
    /// An input raster could not be opened.
    #[error("input raster not found or unreadable: {path}: {reason}")]
    InputNotFound { path: PathBuf, reason: String },

    /// The output raster could not be created or a write failed.
    #[error("failed to write output raster: {0}")]
    WriteFailure(String),

    /// Failed to read pixel data from an input.
    #[error("failed to read raster data: {0}")]
    ReadFailed(String),

    /// The requested window is outside the raster bounds.
    #[error("requested window {requested} is outside raster bounds {raster}")]
    OutOfBounds { requested: String, raster: String },

    /// Buffers or parameters do not match the raster they are applied to.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The requested band does not exist in the source.
    #[error("band {band} requested but {path} has {count} band(s)")]
    InvalidBand {
        path: PathBuf,
        band: usize,
        count: usize,
    },

    /// The file layout is valid TIFF but not one this engine handles.
    #[error("unsupported raster layout: {0}")]
    UnsupportedLayout(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Formula misuse (wrong arity, unknown name).
    #[error("formula error: {0}")]
    Formula(String),
}

impl RasterIndexError {
    /// Create an InputNotFound error.
    pub fn input_not_found(path: &Path, reason: impl ToString) -> Self {
        Self::InputNotFound {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Create a WriteFailure error.
    pub fn write_failure(msg: impl Into<String>) -> Self {
        Self::WriteFailure(msg.into())
    }

    /// Create a ReadFailed error.
    pub fn read_failed(msg: impl Into<String>) -> Self {
        Self::ReadFailed(msg.into())
    }

    /// Create an OutOfBounds error.
    pub fn out_of_bounds(requested: impl Into<String>, raster: impl Into<String>) -> Self {
        Self::OutOfBounds {
            requested: requested.into(),
            raster: raster.into(),
        }
    }

    /// Create an InvalidData error.
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Create an UnsupportedLayout error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedLayout(msg.into())
    }

    /// Whether the failure happened on the output side.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::WriteFailure(_))
    }
}

impl From<std::io::Error> for RasterIndexError {
    fn from(err: std::io::Error) -> Self {
        Self::WriteFailure(err.to_string())
    }
}

impl From<tiff::TiffError> for RasterIndexError {
    fn from(err: tiff::TiffError) -> Self {
        Self::ReadFailed(err.to_string())
    }
}

/// Result type for raster index operations.
pub type Result<T> = std::result::Result<T, RasterIndexError>;
