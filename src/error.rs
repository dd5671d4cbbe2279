//! Error types for suite discovery and unit execution

use std::path::PathBuf;
use thiserror::Error;

/// Fatal: the run aborts before any unit executes
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Root path not found: {0}")]
    NotFound(PathBuf),

    #[error("Root path not readable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// A document could not be rasterized
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Converter '{tool}' failed on {path}: {stderr}")]
    ToolFailed {
        tool: String,
        path: PathBuf,
        stderr: String,
    },

    #[error("Converter '{0}' not available")]
    ToolMissing(String),

    #[error("Resolution must be a positive number of dots per inch, got {0}")]
    InvalidDpi(f32),

    #[error("Invalid page selection '{0}'")]
    InvalidPages(String),

    #[error("Selected page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    #[error("Document produced no pages: {0}")]
    Empty(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type ConversionResult<T> = Result<T, ConversionError>;

/// Session open, step check or close failure
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Session not open")]
    NotOpen,

    #[error("Session already closed")]
    Closed,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Anything that stops a single unit from producing a verdict
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Unit has no checkpoints")]
    NoCheckpoints,
}

pub type UnitResult<T> = Result<T, UnitError>;

/// The worker pool could not be started
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
