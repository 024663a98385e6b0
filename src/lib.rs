//! plantcam: fixed-camera plant monitoring.
//!
//! Captures frames from a camera capability, classifies vegetation with a
//! color-space heuristic, and archives {raw image, overlay, JSON metadata}
//! into a time-keyed directory tree. See the `plantcam` CLI for one-shot
//! operations and `plantcam-daemon` for the scheduled monitoring loop.

pub mod analyzer;
pub mod camera;
pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod registry;
pub mod schedule;
pub mod store;

pub use capture::{AnalysisRecord, CaptureMetadata, PlantMonitor, SystemStats};
pub use error::{AnalysisError, CaptureError, RegistryError, StorageError};
