//! Capture pipeline: acquire a frame, archive it, record metadata, update
//! the registry, optionally analyze.
//!
//! One capture is a synchronous transaction. The caller owns serialization:
//! at most one capture may be in flight per data tree at a time (the
//! write-then-rename discipline in the store protects against partial
//! writes, not against concurrent writers). Retry policy also belongs to
//! the caller.

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::analyzer::{self, ImageAnalysis};
use crate::camera::Camera;
use crate::config::{CameraSettings, MonitorConfig};
use crate::error::{AnalysisError, CaptureError, RegistryError, StorageError};
use crate::registry::{PlantRecord, Registry};
use crate::store::{CleanupResult, DiskUsage, ImageStore};

/// Display name recorded for captures without a plant id.
const GENERAL_DISPLAY_NAME: &str = "General";
/// Display name recorded when the given plant id is not registered.
const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// Injectable time source; captures and analyses stamp everything with it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageProperties {
    pub width: u32,
    pub height: u32,
    pub channel_count: u8,
    pub size_in_bytes: u64,
}

/// Evidence of one completed capture. Written only after the raw image it
/// references exists on disk, and never modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureMetadata {
    pub filename: String,
    pub relative_path: String,
    pub absolute_path: PathBuf,

    /// Weak reference: records the id the caller gave, registered or not.
    pub plant_id: Option<String>,
    /// Display name resolved at capture time; a snapshot, not live.
    pub plant_display_name: String,

    pub capture_time: DateTime<Local>,
    pub notes: String,
    pub camera_settings: CameraSettings,
    pub image_properties: ImageProperties,
}

/// A derived computation over an already-persisted raw image. References
/// the raw image; never owns or mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRecord {
    pub source_image_path: PathBuf,
    pub analysis_time: DateTime<Local>,
    /// The triggering capture's metadata, when analysis ran as part of a
    /// capture; null for stand-alone analyses.
    pub metadata: Option<CaptureMetadata>,
    pub analysis: ImageAnalysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_image_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub plants_registered: usize,
    pub total_images: u64,
    pub disk_usage: DiskUsage,
}

pub struct PlantMonitor {
    store: ImageStore,
    registry: Registry,
    clock: Box<dyn Clock>,
}

impl PlantMonitor {
    /// Open (or initialize) the data tree at `base`.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::with_clock(base, Box::new(SystemClock))
    }

    pub fn with_clock(
        base: impl Into<PathBuf>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let store = ImageStore::new(base);
        store.init_layout()?;
        let registry = Registry::open(store.config_path())?;
        Ok(Self {
            store,
            registry,
            clock,
        })
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Snapshot of the persisted settings document.
    pub fn config(&self) -> MonitorConfig {
        self.registry.document()
    }

    /// Run one capture: acquire a frame, write the raw image, then its
    /// metadata record, then update the registry, then (if configured)
    /// analyze.
    ///
    /// An unregistered `plant_id` does not fail the capture: it is archived
    /// as a general capture with the given id recorded in the metadata and
    /// the registry left untouched. This mirrors the permissive behavior
    /// manual callers rely on; it is a policy choice, not an oversight.
    pub fn capture(
        &self,
        camera: &mut dyn Camera,
        plant_id: Option<&str>,
        notes: &str,
    ) -> Result<CaptureMetadata, CaptureError> {
        let frame = camera.acquire_frame()?;
        let now = self.clock.now();
        let config = self.registry.document();

        let registered = plant_id.and_then(|id| self.registry.lookup(id));
        if plant_id.is_some() && registered.is_none() {
            warn!(
                plant_id = plant_id.unwrap_or_default(),
                "plant id not registered, archiving as general capture"
            );
        }

        let display_name = match (&registered, plant_id) {
            (Some(plant), _) => plant.display_name.clone(),
            (None, Some(_)) => UNKNOWN_DISPLAY_NAME.to_string(),
            (None, None) => GENERAL_DISPLAY_NAME.to_string(),
        };

        // The raw image is written first; metadata is evidence of a
        // completed capture, not a promise of one.
        let known_id = registered.as_ref().map(|p| p.id.as_str());
        let image_path = self.store.resolve_raw_path(known_id, now)?;
        let size = self
            .store
            .write_image(&image_path, &frame, config.camera_settings.quality)?;

        let relative_path = image_path
            .strip_prefix(self.store.base())
            .unwrap_or(&image_path)
            .to_string_lossy()
            .to_string();

        let metadata = CaptureMetadata {
            filename: image_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            relative_path,
            absolute_path: image_path.clone(),
            plant_id: plant_id.map(str::to_string),
            plant_display_name: display_name,
            capture_time: now,
            notes: notes.to_string(),
            camera_settings: config.camera_settings,
            image_properties: ImageProperties {
                width: frame.width(),
                height: frame.height(),
                channel_count: 3,
                size_in_bytes: size,
            },
        };

        let metadata_path = self.store.metadata_path(now)?;
        self.store.write_json_record(&metadata_path, &metadata)?;

        // Counter updates come after the persisted artifacts. A persist
        // failure here leaves the counters stale but the capture valid; the
        // metadata tree remains the source of truth.
        if let Some(plant) = &registered {
            if let Err(e) = self.registry.record_capture(&plant.id, now) {
                warn!(plant_id = %plant.id, error = %e, "capture archived but registry counters not updated");
            }
        }

        info!(
            path = %image_path.display(),
            width = frame.width(),
            height = frame.height(),
            size_bytes = size,
            "capture archived"
        );

        if config.monitoring.auto_analysis {
            if let Err(e) = self.analyze(&image_path, Some(&metadata)) {
                // Isolated by design: the capture already succeeded and its
                // artifacts stay on disk.
                warn!(path = %image_path.display(), error = %e, "auto-analysis failed");
            }
        }

        Ok(metadata)
    }

    /// Analyze a raw image already on disk and persist the analysis record
    /// (and, if configured, the overlay image) under the analysis tree.
    ///
    /// Stand-alone by design: the image need not come from the capture that
    /// is currently running, and `analysis_time` is this call's time, not
    /// the capture time.
    pub fn analyze(
        &self,
        image_path: &Path,
        metadata: Option<&CaptureMetadata>,
    ) -> Result<AnalysisRecord, AnalysisError> {
        let img = image::open(image_path)
            .map_err(|e| AnalysisError::DecodeFailed {
                path: image_path.to_path_buf(),
                source: e,
            })?
            .to_rgb8();

        let analysis = analyzer::analyze(&img)?;
        let now = self.clock.now();
        let config = self.registry.document();

        let overlay_image_path = if config.analysis_settings.save_processed_images {
            let path = self.store.processed_image_path(now)?;
            let overlay = analyzer::overlay(&img);
            self.store
                .write_image(&path, &overlay, config.camera_settings.quality)?;
            Some(path)
        } else {
            None
        };

        let record = AnalysisRecord {
            source_image_path: image_path.to_path_buf(),
            analysis_time: now,
            metadata: metadata.cloned(),
            analysis,
            overlay_image_path,
        };

        let record_path = self.store.analysis_data_path(now)?;
        self.store.write_json_record(&record_path, &record)?;

        info!(
            source = %image_path.display(),
            coverage = record.analysis.plant_detection.green_coverage_percent,
            detected = record.analysis.plant_detection.plant_detected,
            "analysis recorded"
        );

        Ok(record)
    }

    /// Register a plant and create its raw-image subtree eagerly.
    pub fn register_plant(
        &self,
        display_name: &str,
        info: BTreeMap<String, serde_json::Value>,
    ) -> Result<PlantRecord, RegistryError> {
        let record = self.registry.register(display_name, info, self.clock.now())?;
        self.store
            .ensure_plant_dir(&record.id)
            .map_err(RegistryError::PersistFailed)?;
        info!(plant_id = %record.id, name = display_name, "plant registered");
        Ok(record)
    }

    /// A plant's captures from the last `within_days` days, ascending by
    /// capture time.
    ///
    /// This scans every persisted metadata record — there is no secondary
    /// index, so cost is O(total metadata records), not O(matching records).
    /// Fine at this system's scale; a per-plant index directory would be the
    /// extension point if that ever changes. Unreadable records are skipped.
    pub fn timeline(
        &self,
        plant_id: &str,
        within_days: u32,
    ) -> Result<Vec<CaptureMetadata>, StorageError> {
        let now = self.clock.now();
        let window = chrono::Duration::days(i64::from(within_days));

        let mut matches = Vec::new();
        for path in self.store.metadata_files()? {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<CaptureMetadata>(&content) else {
                continue;
            };

            if record.plant_id.as_deref() == Some(plant_id)
                && now.signed_duration_since(record.capture_time) <= window
            {
                matches.push(record);
            }
        }

        matches.sort_by_key(|m| m.capture_time);
        Ok(matches)
    }

    pub fn stats(&self) -> Result<SystemStats, StorageError> {
        Ok(SystemStats {
            plants_registered: self.registry.plant_count(),
            total_images: self.registry.total_images(),
            disk_usage: self.store.disk_usage()?,
        })
    }

    /// Advisory cleanup plan for files older than the retention window
    /// (configured `retain_days` unless overridden). Nothing is deleted.
    pub fn plan_cleanup(&self, days: Option<u32>) -> Result<Vec<PathBuf>, StorageError> {
        let retain_days = days.unwrap_or(self.registry.document().monitoring.retain_days);
        self.store.plan_cleanup(retain_days, self.clock.now())
    }

    /// Delete the files in a previously reviewed plan. The only deleting
    /// call in the pipeline, and it must be invoked explicitly.
    pub fn apply_cleanup(&self, plan: &[PathBuf]) -> Result<CleanupResult, StorageError> {
        self.store.apply_cleanup(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use walkdir::WalkDir;

    struct TestCamera {
        frame: RgbImage,
    }

    impl TestCamera {
        fn green(width: u32, height: u32) -> Self {
            Self {
                frame: RgbImage::from_pixel(width, height, image::Rgb([20, 220, 40])),
            }
        }
    }

    impl Camera for TestCamera {
        fn acquire_frame(&mut self) -> Result<RgbImage, CaptureError> {
            Ok(self.frame.clone())
        }
    }

    #[derive(Clone)]
    struct SharedClock(Arc<Mutex<DateTime<Local>>>);

    impl SharedClock {
        fn at(t: DateTime<Local>) -> Self {
            Self(Arc::new(Mutex::new(t)))
        }

        fn set(&self, t: DateTime<Local>) {
            *self.0.lock().unwrap() = t;
        }
    }

    impl Clock for SharedClock {
        fn now(&self) -> DateTime<Local> {
            *self.0.lock().unwrap()
        }
    }

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 14, 10, 0, 0).unwrap()
    }

    fn open_monitor(dir: &tempfile::TempDir, clock: &SharedClock) -> PlantMonitor {
        PlantMonitor::with_clock(dir.path(), Box::new(clock.clone())).unwrap()
    }

    fn count_files(root: &Path) -> usize {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_general_capture_writes_image_then_metadata() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);

        let mut camera = TestCamera::green(32, 24);
        let metadata = monitor.capture(&mut camera, None, "first light").unwrap();

        assert!(metadata.absolute_path.exists());
        assert_eq!(metadata.filename, "capture_20250614_100000.jpg");
        assert_eq!(metadata.relative_path, "raw_images/2025/06/capture_20250614_100000.jpg");
        assert_eq!(metadata.plant_id, None);
        assert_eq!(metadata.plant_display_name, "General");
        assert_eq!(metadata.notes, "first light");
        assert_eq!(metadata.image_properties.width, 32);
        assert_eq!(metadata.image_properties.channel_count, 3);
        assert!(metadata.image_properties.size_in_bytes > 0);

        let metadata_file = dir.path().join("metadata/20250614_100000_metadata.json");
        assert!(metadata_file.exists());
        let read_back: CaptureMetadata =
            serde_json::from_str(&std::fs::read_to_string(metadata_file).unwrap()).unwrap();
        assert_eq!(read_back, metadata);
    }

    #[test]
    fn test_registered_capture_updates_counters() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);
        monitor.register_plant("Basil", BTreeMap::new()).unwrap();

        let mut camera = TestCamera::green(16, 16);
        let mut last = t0();
        for i in 0..3u32 {
            last = t0() + chrono::Duration::hours(i64::from(i));
            clock.set(last);
            let metadata = monitor.capture(&mut camera, Some("basil"), "").unwrap();
            assert_eq!(metadata.plant_display_name, "Basil");
            assert!(metadata
                .relative_path
                .starts_with("raw_images/plants/basil/2025/06/"));
        }

        let plant = monitor.registry().lookup("basil").unwrap();
        assert_eq!(plant.image_count, 3);
        assert_eq!(plant.last_captured, Some(last));
    }

    #[test]
    fn test_unknown_plant_id_is_permissive() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);

        let mut camera = TestCamera::green(16, 16);
        let metadata = monitor.capture(&mut camera, Some("ghost"), "").unwrap();

        // The given id is recorded, the display name falls back, the file
        // lands in the general tree and the registry is untouched.
        assert_eq!(metadata.plant_id.as_deref(), Some("ghost"));
        assert_eq!(metadata.plant_display_name, "Unknown");
        assert!(metadata.relative_path.starts_with("raw_images/2025/"));
        assert_eq!(monitor.registry().plant_count(), 0);
    }

    #[test]
    fn test_failed_image_write_leaves_no_metadata() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);

        // Make raw-image directory creation impossible.
        std::fs::remove_dir_all(dir.path().join("raw_images")).unwrap();
        std::fs::write(dir.path().join("raw_images"), b"not a directory").unwrap();

        let mut camera = TestCamera::green(16, 16);
        let err = monitor.capture(&mut camera, None, "").unwrap_err();
        assert!(matches!(err, CaptureError::WriteFailed(_)));

        assert_eq!(monitor.store().metadata_files().unwrap().len(), 0);
    }

    #[test]
    fn test_auto_analysis_persists_record_and_overlay() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);

        let mut camera = TestCamera::green(16, 16);
        monitor.capture(&mut camera, None, "").unwrap();

        assert_eq!(count_files(&dir.path().join("analysis/data")), 1);
        assert_eq!(count_files(&dir.path().join("analysis/processed")), 1);
        assert!(dir
            .path()
            .join("analysis/data/2025/06/analysis_20250614_100000.json")
            .exists());
        assert!(dir
            .path()
            .join("analysis/processed/2025/06/analyzed_20250614_100000.jpg")
            .exists());
    }

    #[test]
    fn test_standalone_analysis_round_trip() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);

        let img = RgbImage::from_pixel(10, 10, image::Rgb([20, 220, 40]));
        let image_path = monitor.store().resolve_raw_path(None, t0()).unwrap();
        // Analysis decodes from disk; use lossless PNG so pixel values (and
        // so the analysis block) are exact.
        let image_path = image_path.with_extension("png");
        img.save(&image_path).unwrap();

        clock.set(t0() + chrono::Duration::minutes(5));
        let record = monitor.analyze(&image_path, None).unwrap();

        assert_eq!(record.source_image_path, image_path);
        assert!(record.metadata.is_none());
        assert!(record.analysis.plant_detection.plant_detected);
        assert_eq!(
            record.analysis_time,
            t0() + chrono::Duration::minutes(5)
        );

        let record_path = dir
            .path()
            .join("analysis/data/2025/06/analysis_20250614_100500.json");
        let read_back: AnalysisRecord =
            serde_json::from_str(&std::fs::read_to_string(record_path).unwrap()).unwrap();
        assert_eq!(read_back.analysis, record.analysis);
        assert_eq!(read_back.overlay_image_path, record.overlay_image_path);
    }

    #[test]
    fn test_analyze_missing_file_is_decode_failure() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);

        let err = monitor
            .analyze(Path::new("/nonexistent/img.jpg"), None)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::DecodeFailed { .. }));
    }

    #[test]
    fn test_timeline_window_and_order() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);
        monitor.register_plant("Basil", BTreeMap::new()).unwrap();

        let mut camera = TestCamera::green(8, 8);
        for days_ago in [40i64, 10, 0] {
            clock.set(t0() - chrono::Duration::days(days_ago));
            monitor.capture(&mut camera, Some("basil"), "").unwrap();
        }

        clock.set(t0());
        let timeline = monitor.timeline("basil", 30).unwrap();

        assert_eq!(timeline.len(), 2);
        assert_eq!(
            timeline[0].capture_time,
            t0() - chrono::Duration::days(10)
        );
        assert_eq!(timeline[1].capture_time, t0());
        assert!(monitor.timeline("mint", 30).unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let clock = SharedClock::at(t0());
        let monitor = open_monitor(&dir, &clock);
        monitor.register_plant("Basil", BTreeMap::new()).unwrap();

        let mut camera = TestCamera::green(8, 8);
        monitor.capture(&mut camera, Some("basil"), "").unwrap();

        let stats = monitor.stats().unwrap();
        assert_eq!(stats.plants_registered, 1);
        assert_eq!(stats.total_images, 1);
        assert!(stats.disk_usage.total_bytes > 0);
        assert!(stats.disk_usage.raw_images_bytes > 0);
    }
}
