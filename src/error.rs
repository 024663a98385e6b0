//! Error taxonomy for the capture/analysis/storage pipeline.
//!
//! Every failure carries a structured reason so orchestration layers (the
//! daemon, the CLI) can decide between retrying, skipping and surfacing,
//! instead of pattern-matching on strings.

use std::path::PathBuf;
use thiserror::Error;

/// Failures while resolving paths or writing artifacts to the data tree.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode image for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to serialize record for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of a single capture attempt.
///
/// Device problems abort only the current attempt; the caller (scheduler)
/// owns retry policy.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("camera produced no frame")]
    NoFrame,

    #[error("failed to persist capture artifacts")]
    WriteFailed(#[from] StorageError),
}

/// Failures of an analysis pass over an already-persisted raw image.
///
/// Analysis failures never invalidate the raw image or its metadata.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to decode image {path}: {source}")]
    DecodeFailed {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("image has no pixels")]
    EmptyImage,

    #[error("failed to persist analysis artifacts")]
    Storage(#[from] StorageError),
}

/// Failures of plant registration and registry persistence.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plant name must be non-empty")]
    InvalidName,

    #[error("plant '{0}' is already registered")]
    Duplicate(String),

    #[error("failed to persist plant registry")]
    PersistFailed(#[source] StorageError),
}
