// Error types for table parsing, background loading, and layer output.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Unable to read table '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed CSV in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Unparseable value '{value}' in column '{column}' of '{path}' (line {line})")]
    Parse {
        path: PathBuf,
        line: u64,
        column: String,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("Unable to decode image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Zarr error for '{path}': {message}")]
    Zarr { path: PathBuf, message: String },
    #[error("Unsupported zarr data type {0} (expected an integer or float type)")]
    UnsupportedDataType(String),
    #[error("Invalid background shape {0:?}, expected at least 2 non-empty dimensions")]
    BadShape(Vec<u64>),
    #[error("Region {rows:?} x {cols:?} lies outside a {shape:?} array")]
    OutOfBounds {
        rows: std::ops::Range<u64>,
        cols: std::ops::Range<u64>,
        shape: (u64, u64),
    },
}

impl BackgroundError {
    pub fn zarr(path: &std::path::Path, e: impl std::fmt::Display) -> Self {
        BackgroundError::Zarr {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("File writing error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("Manifest error: {0}")]
    Json(#[from] json::Error),
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Unable to read background pixels: {0}")]
    Background(#[from] BackgroundError),
    #[error("Unknown points output format for '{0}'")]
    UnknownFormat(String),
}

/// Top level errors reported by the command line tool.
#[derive(Debug, Error)]
pub enum SpotviewError {
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("Invalid exclusion pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("File reading error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Invalid argument: {0}")]
    Argument(String),
}
