//! Filesystem layout and persistence for the data tree.
//!
//! All placement is a pure function of (plant id presence, timestamp):
//!
//! ```text
//! raw_images/{YYYY}/{MM}/capture_{YYYYMMDD_HHMMSS}.jpg
//! raw_images/plants/{plant_id}/{YYYY}/{MM}/{plant_id}_{YYYYMMDD_HHMMSS}.jpg
//! metadata/{YYYYMMDD_HHMMSS}_metadata.json
//! analysis/data/{YYYY}/{MM}/analysis_{YYYYMMDD_HHMMSS}.json
//! analysis/processed/{YYYY}/{MM}/analyzed_{YYYYMMDD_HHMMSS}.jpg
//! config.json
//! ```
//!
//! Raw images are write-once; this module never rewrites an existing raw
//! image. Writes go to a temp name in the destination directory and are
//! renamed into place, so a concurrent reader never sees a truncated file.

use chrono::{DateTime, Local, NaiveDateTime};
use image::{ImageEncoder, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

use crate::error::StorageError;

/// Timestamp format shared by every filename in the tree.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Subdirectories created eagerly at open time.
const LAYOUT_DIRS: &[&str] = &[
    "raw_images",
    "raw_images/plants",
    "analysis",
    "analysis/processed",
    "analysis/data",
    "metadata",
    "logs",
    "temp",
];

pub struct ImageStore {
    base: PathBuf,
}

/// Space accounting over the data tree. This measures what the tree itself
/// occupies (walked file sizes), not filesystem-level free space.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub raw_images_bytes: u64,
    pub analysis_bytes: u64,
    pub file_count: u64,
}

/// Result of an applied cleanup.
#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
}

impl ImageStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Create the full directory layout. Idempotent.
    pub fn init_layout(&self) -> Result<(), StorageError> {
        for dir in LAYOUT_DIRS {
            let path = self.base.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(())
    }

    /// Create a plant's raw-image subtree eagerly (at registration time).
    pub fn ensure_plant_dir(&self, plant_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.base.join("raw_images").join("plants").join(plant_id);
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir)
    }

    /// Resolve the raw-image path for a capture, creating parent directories.
    ///
    /// The mapping is deterministic: the same `(plant_id, at)` pair always
    /// yields the same path. `plant_id` here means "known plant" — the
    /// pipeline passes `None` for general (unregistered) captures.
    pub fn resolve_raw_path(
        &self,
        plant_id: Option<&str>,
        at: DateTime<Local>,
    ) -> Result<PathBuf, StorageError> {
        let stamp = at.format(TIMESTAMP_FORMAT);
        let year = at.format("%Y").to_string();
        let month = at.format("%m").to_string();

        let (dir, filename) = match plant_id {
            Some(id) => (
                self.base
                    .join("raw_images")
                    .join("plants")
                    .join(id)
                    .join(&year)
                    .join(&month),
                format!("{}_{}.jpg", id, stamp),
            ),
            None => (
                self.base.join("raw_images").join(&year).join(&month),
                format!("capture_{}.jpg", stamp),
            ),
        };

        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir.join(filename))
    }

    /// Metadata records live in a single flat directory keyed by timestamp,
    /// independent of the raw image's own tree.
    pub fn metadata_path(&self, at: DateTime<Local>) -> Result<PathBuf, StorageError> {
        let dir = self.base.join("metadata");
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir.join(format!("{}_metadata.json", at.format(TIMESTAMP_FORMAT))))
    }

    pub fn analysis_data_path(&self, at: DateTime<Local>) -> Result<PathBuf, StorageError> {
        let dir = self
            .base
            .join("analysis")
            .join("data")
            .join(at.format("%Y").to_string())
            .join(at.format("%m").to_string());
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir.join(format!("analysis_{}.json", at.format(TIMESTAMP_FORMAT))))
    }

    pub fn processed_image_path(&self, at: DateTime<Local>) -> Result<PathBuf, StorageError> {
        let dir = self
            .base
            .join("analysis")
            .join("processed")
            .join(at.format("%Y").to_string())
            .join(at.format("%m").to_string());
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir.join(format!("analyzed_{}.jpg", at.format(TIMESTAMP_FORMAT))))
    }

    /// Encode `img` as JPEG at `quality` and write it to `path`.
    /// Returns the encoded size in bytes.
    pub fn write_image(
        &self,
        path: &Path,
        img: &RgbImage,
        quality: u8,
    ) -> Result<u64, StorageError> {
        let mut encoded = Vec::new();
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut encoded), quality);
        encoder
            .write_image(
                img.as_raw(),
                img.width(),
                img.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| StorageError::Encode {
                path: path.to_path_buf(),
                source: e,
            })?;

        let size = encoded.len() as u64;
        self.write_atomic(path, &encoded)?;
        Ok(size)
    }

    /// Serialize `record` as pretty JSON and write it to `path`.
    pub fn write_json_record<T: Serialize>(
        &self,
        path: &Path,
        record: &T,
    ) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let content = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.write_atomic(path, &content)
    }

    /// Write bytes to a uniquely named temp file in the destination
    /// directory, then rename into place. The counter keeps temp names
    /// unique when multiple writes land in the same second.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "record".to_string());
        let tmp = path.with_file_name(format!(".{}.{}.tmp", filename, seq));

        std::fs::write(&tmp, bytes).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
        Ok(())
    }

    /// All metadata record files, sorted by filename (which sorts by capture
    /// time, given the shared timestamp format).
    pub fn metadata_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.base.join("metadata");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if path.is_file() && name.ends_with("_metadata.json") {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Walk the data tree and account for its size. O(files in tree).
    pub fn disk_usage(&self) -> Result<DiskUsage, StorageError> {
        let mut usage = DiskUsage::default();
        let raw_root = self.base.join("raw_images");
        let analysis_root = self.base.join("analysis");

        for entry in WalkDir::new(&self.base)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            usage.total_bytes += len;
            usage.file_count += 1;

            if entry.path().starts_with(&raw_root) {
                usage.raw_images_bytes += len;
            } else if entry.path().starts_with(&analysis_root) {
                usage.analysis_bytes += len;
            }
        }

        Ok(usage)
    }

    /// Delete files under `temp/` whose mtime is older than `max_age_days`.
    /// Returns the number of files removed.
    pub fn prune_temp_files(&self, max_age_days: u32) -> Result<usize, StorageError> {
        let dir = self.base.join("temp");
        if !dir.exists() {
            return Ok(0);
        }

        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(u64::from(max_age_days) * 86_400);

        let mut removed = 0;
        let entries = std::fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if stale {
                std::fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// List the archive files that a cleanup with the given retention would
    /// remove. Advisory only: nothing is deleted here. Age is taken from the
    /// timestamp embedded in the filename, falling back to mtime for files
    /// that don't carry one.
    pub fn plan_cleanup(
        &self,
        retain_days: u32,
        now: DateTime<Local>,
    ) -> Result<Vec<PathBuf>, StorageError> {
        let cutoff = now - chrono::Duration::days(i64::from(retain_days));
        let mut plan = Vec::new();

        for root in ["raw_images", "analysis", "metadata"] {
            let root = self.base.join(root);
            for entry in WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }

                let age_source = match file_stamp(entry.path()) {
                    Some(stamp) => Some(stamp),
                    None => entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .map(|mtime| DateTime::<Local>::from(mtime).naive_local()),
                };

                if let Some(at) = age_source {
                    if at < cutoff.naive_local() {
                        plan.push(entry.path().to_path_buf());
                    }
                }
            }
        }

        plan.sort();
        Ok(plan)
    }

    /// Delete the files in a previously computed cleanup plan. The separate
    /// call (and the containment check) keeps deletion an explicit,
    /// confirmed action; capture and analysis never delete anything.
    pub fn apply_cleanup(&self, plan: &[PathBuf]) -> Result<CleanupResult, StorageError> {
        let mut result = CleanupResult::default();

        for path in plan {
            if !path.starts_with(&self.base) {
                continue;
            }
            let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(path).map_err(|e| StorageError::io(path, e))?;
            result.files_deleted += 1;
            result.bytes_freed += len;
        }

        Ok(result)
    }
}

/// Parse the `YYYYMMDD_HHMMSS` stamp out of an archive filename, e.g.
/// `basil_20250614_083000.jpg` or `analysis_20250614_083005.json`.
pub fn file_stamp(path: &Path) -> Option<NaiveDateTime> {
    let stem = path.file_stem()?.to_str()?;
    let candidate = stem.get(stem.len().checked_sub(15)?..)?;
    NaiveDateTime::parse_from_str(candidate, TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_resolve_raw_path_is_deterministic() {
        let dir = tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let t = at(2025, 6, 14, 8, 30, 0);
        let a = store.resolve_raw_path(Some("basil"), t).unwrap();
        let b = store.resolve_raw_path(Some("basil"), t).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("raw_images/plants/basil/2025/06/basil_20250614_083000.jpg"));

        let general = store.resolve_raw_path(None, t).unwrap();
        assert!(general.ends_with("raw_images/2025/06/capture_20250614_083000.jpg"));
    }

    #[test]
    fn test_minute_change_keeps_month_directory() {
        let dir = tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let a = store
            .resolve_raw_path(Some("basil"), at(2025, 6, 14, 8, 30, 0))
            .unwrap();
        let b = store
            .resolve_raw_path(Some("basil"), at(2025, 6, 14, 8, 31, 0))
            .unwrap();
        assert_ne!(a.file_name(), b.file_name());
        assert_eq!(a.parent(), b.parent());
    }

    #[test]
    fn test_init_layout_creates_all_directories() {
        let dir = tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        store.init_layout().unwrap();

        for sub in super::LAYOUT_DIRS {
            assert!(dir.path().join(sub).is_dir(), "missing {}", sub);
        }
    }

    #[test]
    fn test_write_image_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let img = RgbImage::from_pixel(16, 16, image::Rgb([10, 120, 30]));
        let t = at(2025, 6, 14, 8, 30, 0);
        let path = store.resolve_raw_path(None, t).unwrap();
        let size = store.write_image(&path, &img, 95).unwrap();

        assert!(size > 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);

        let siblings: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(siblings, vec!["capture_20250614_083000.jpg".to_string()]);
    }

    #[test]
    fn test_file_stamp_parsing() {
        let stamp = file_stamp(Path::new("/x/basil_20250614_083000.jpg")).unwrap();
        assert_eq!(stamp.format(TIMESTAMP_FORMAT).to_string(), "20250614_083000");

        assert!(file_stamp(Path::new("/x/notes.txt")).is_none());
        assert!(file_stamp(Path::new("/x/basil_20251340_990000.jpg")).is_none());
    }

    #[test]
    fn test_plan_cleanup_selects_only_expired_files() {
        let dir = tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        store.init_layout().unwrap();

        let now = at(2025, 6, 14, 12, 0, 0);
        let img = RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0]));

        let old = store
            .resolve_raw_path(Some("basil"), now - chrono::Duration::days(40))
            .unwrap();
        store.write_image(&old, &img, 90).unwrap();

        let fresh = store
            .resolve_raw_path(Some("basil"), now - chrono::Duration::days(3))
            .unwrap();
        store.write_image(&fresh, &img, 90).unwrap();

        let plan = store.plan_cleanup(30, now).unwrap();
        assert_eq!(plan, vec![old.clone()]);

        let result = store.apply_cleanup(&plan).unwrap();
        assert_eq!(result.files_deleted, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_apply_cleanup_refuses_paths_outside_base() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let stray = outside.path().join("keep.jpg");
        std::fs::write(&stray, b"data").unwrap();

        let store = ImageStore::new(dir.path());
        let result = store.apply_cleanup(&[stray.clone()]).unwrap();

        assert_eq!(result.files_deleted, 0);
        assert!(stray.exists());
    }

    #[test]
    fn test_metadata_files_sorted() {
        let dir = tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let t1 = at(2025, 6, 14, 9, 0, 0);
        let t2 = at(2025, 6, 13, 9, 0, 0);
        store
            .write_json_record(&store.metadata_path(t1).unwrap(), &serde_json::json!({}))
            .unwrap();
        store
            .write_json_record(&store.metadata_path(t2).unwrap(), &serde_json::json!({}))
            .unwrap();

        let files = store.metadata_files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("20250613_090000_metadata.json"));
        assert!(files[1].ends_with("20250614_090000_metadata.json"));
    }
}
