use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::registry::PlantRecord;

/// The persisted document at `{base}/config.json`: registered plants plus
/// camera/monitoring/analysis settings. This file is the authoritative
/// registry store; consumers of the data tree read it directly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorConfig {
    #[serde(default)]
    pub plants: BTreeMap<String, PlantRecord>,

    #[serde(default)]
    pub camera_settings: CameraSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub analysis_settings: AnalysisSettings,
}

/// Camera resolution and JPEG quality, snapshotted into every
/// capture's metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CameraSettings {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_quality")]
    pub quality: u8,
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_quality() -> u8 {
    95
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            quality: default_quality(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoringSettings {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,

    #[serde(default = "default_auto_analysis")]
    pub auto_analysis: bool,

    #[serde(default = "default_retain_days")]
    pub retain_days: u32,

    /// Start of the daily capture window (0-23). `None` disables the gate.
    #[serde(default = "default_active_hours_start")]
    pub active_hours_start: Option<u8>,

    /// End of the daily capture window (0-23, exclusive).
    #[serde(default = "default_active_hours_end")]
    pub active_hours_end: Option<u8>,

    #[serde(default = "default_max_daily_captures")]
    pub max_daily_captures: u32,
}

fn default_interval_minutes() -> u32 {
    60
}

fn default_auto_analysis() -> bool {
    true
}

fn default_retain_days() -> u32 {
    365
}

fn default_active_hours_start() -> Option<u8> {
    Some(8)
}

fn default_active_hours_end() -> Option<u8> {
    Some(18)
}

fn default_max_daily_captures() -> u32 {
    10
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            auto_analysis: default_auto_analysis(),
            retain_days: default_retain_days(),
            active_hours_start: default_active_hours_start(),
            active_hours_end: default_active_hours_end(),
            max_daily_captures: default_max_daily_captures(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisSettings {
    #[serde(default = "default_save_processed_images")]
    pub save_processed_images: bool,

    #[serde(default = "default_export_data")]
    pub export_data: bool,
}

fn default_save_processed_images() -> bool {
    true
}

fn default_export_data() -> bool {
    true
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            save_processed_images: default_save_processed_images(),
            export_data: default_export_data(),
        }
    }
}

impl MonitorConfig {
    /// Load the document from `path`, or create it with defaults when absent.
    pub fn load_or_create(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
            let config: MonitorConfig =
                serde_json::from_str(&content).map_err(|e| StorageError::Json {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            Ok(config)
        } else {
            let config = MonitorConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Write the document to `path`, temp-then-rename so a reader never
    /// observes a half-written registry.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| StorageError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;

        Ok(())
    }
}

/// Machine-level settings for the binaries: where the data tree lives and
/// which camera backend to drive. Lives in the user config dir as TOML,
/// separate from the data-root `config.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    #[serde(default)]
    pub camera: CameraBackendConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    #[default]
    Command,
    Spool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraBackendConfig {
    #[serde(default)]
    pub backend: CameraBackend,

    /// External still-capture program used by the command backend.
    #[serde(default = "default_camera_command")]
    pub command: String,

    /// Directory watched by the spool backend for freshly dropped frames.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

fn default_camera_command() -> String {
    "rpicam-still".to_string()
}

impl Default for CameraBackendConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::default(),
            command: default_camera_command(),
            spool_dir: None,
        }
    }
}

fn default_base_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plantcam")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            camera: CameraBackendConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Config file location, overridable via `PLANTCAM_CONFIG`.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PLANTCAM_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plantcam")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_original_deployment() {
        let config = MonitorConfig::default();
        assert_eq!(config.camera_settings.width, 1920);
        assert_eq!(config.camera_settings.height, 1080);
        assert_eq!(config.camera_settings.quality, 95);
        assert_eq!(config.monitoring.interval_minutes, 60);
        assert!(config.monitoring.auto_analysis);
        assert_eq!(config.monitoring.retain_days, 365);
        assert!(config.analysis_settings.save_processed_images);
        assert!(config.plants.is_empty());
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = MonitorConfig::load_or_create(&path).unwrap();
        assert!(path.exists());

        let reloaded = MonitorConfig::load_or_create(&path).unwrap();
        assert_eq!(created.camera_settings, reloaded.camera_settings);
        assert_eq!(created.monitoring, reloaded.monitoring);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"camera_settings": {"quality": 80}}"#).unwrap();

        let config = MonitorConfig::load_or_create(&path).unwrap();
        assert_eq!(config.camera_settings.quality, 80);
        assert_eq!(config.camera_settings.width, 1920);
        assert_eq!(config.monitoring.max_daily_captures, 10);
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        MonitorConfig::default().save(&path).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["config.json".to_string()]);
    }
}
