//! Plant registry: registration info and running counters, persisted inside
//! the data root's `config.json` document.
//!
//! The counters are a cache, not the source of truth for "did a capture
//! happen" — a reconciled count can always be rebuilt from the metadata
//! tree. Persistence is a single read-modify-write critical section per
//! process; cross-process coordination is out of scope.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::MonitorConfig;
use crate::error::{RegistryError, StorageError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlantRecord {
    pub id: String,
    pub display_name: String,
    pub registered_at: DateTime<Local>,

    /// Free-form caller-supplied attributes (species, pot, location, ...).
    #[serde(default)]
    pub info: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub image_count: u64,

    #[serde(default)]
    pub last_captured: Option<DateTime<Local>>,
}

/// Derive a plant id from its display name: lowercased, whitespace runs
/// collapsed to a single underscore. Returns `None` for blank names.
pub fn derive_plant_id(display_name: &str) -> Option<String> {
    let id = display_name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

pub struct Registry {
    path: PathBuf,
    doc: Mutex<MonitorConfig>,
}

impl Registry {
    /// Load the registry document from `config_path`, creating it with
    /// defaults when absent.
    pub fn open(config_path: PathBuf) -> Result<Self, StorageError> {
        let doc = MonitorConfig::load_or_create(&config_path)?;
        Ok(Self {
            path: config_path,
            doc: Mutex::new(doc),
        })
    }

    /// Snapshot of the full document (settings and plants).
    pub fn document(&self) -> MonitorConfig {
        self.lock().clone()
    }

    /// Register a new plant and persist the registry.
    pub fn register(
        &self,
        display_name: &str,
        info: BTreeMap<String, serde_json::Value>,
        at: DateTime<Local>,
    ) -> Result<PlantRecord, RegistryError> {
        let id = derive_plant_id(display_name).ok_or(RegistryError::InvalidName)?;

        let mut doc = self.lock();
        if doc.plants.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        let record = PlantRecord {
            id: id.clone(),
            display_name: display_name.to_string(),
            registered_at: at,
            info,
            image_count: 0,
            last_captured: None,
        };
        doc.plants.insert(id, record.clone());
        self.persist(&doc)?;

        Ok(record)
    }

    pub fn lookup(&self, plant_id: &str) -> Option<PlantRecord> {
        self.lock().plants.get(plant_id).cloned()
    }

    pub fn contains(&self, plant_id: &str) -> bool {
        self.lock().plants.contains_key(plant_id)
    }

    pub fn plant_count(&self) -> usize {
        self.lock().plants.len()
    }

    /// Sum of per-plant image counters.
    pub fn total_images(&self) -> u64 {
        self.lock().plants.values().map(|p| p.image_count).sum()
    }

    /// Plant ids in registration order (ascending `registered_at`, id as
    /// tie-break — the persisted map itself carries no order).
    pub fn list_ids(&self) -> Vec<String> {
        let doc = self.lock();
        let mut plants: Vec<&PlantRecord> = doc.plants.values().collect();
        plants.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        plants.into_iter().map(|p| p.id.clone()).collect()
    }

    /// Bump a plant's counters after a successful capture and persist.
    /// Unknown ids are a no-op, matching the pipeline's permissive policy.
    pub fn record_capture(
        &self,
        plant_id: &str,
        at: DateTime<Local>,
    ) -> Result<(), RegistryError> {
        let mut doc = self.lock();
        let Some(plant) = doc.plants.get_mut(plant_id) else {
            return Ok(());
        };

        plant.image_count += 1;
        plant.last_captured = Some(at);
        self.persist(&doc)
    }

    fn persist(&self, doc: &MonitorConfig) -> Result<(), RegistryError> {
        doc.save(&self.path).map_err(RegistryError::PersistFailed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorConfig> {
        // A poisoned lock means a panic mid-update; the document itself is
        // still consistent (mutations are single assignments), so recover.
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 14, h, mi, s).unwrap()
    }

    fn open_registry(dir: &tempfile::TempDir) -> Registry {
        Registry::open(dir.path().join("config.json")).unwrap()
    }

    #[test]
    fn test_derive_plant_id() {
        assert_eq!(derive_plant_id("Basil"), Some("basil".to_string()));
        assert_eq!(
            derive_plant_id("Cherry  Tomato"),
            Some("cherry_tomato".to_string())
        );
        assert_eq!(derive_plant_id("  "), None);
        assert_eq!(derive_plant_id(""), None);
    }

    #[test]
    fn test_register_and_lookup() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);

        let record = registry
            .register("Cherry Tomato", BTreeMap::new(), at(8, 0, 0))
            .unwrap();
        assert_eq!(record.id, "cherry_tomato");
        assert_eq!(record.image_count, 0);

        let found = registry.lookup("cherry_tomato").unwrap();
        assert_eq!(found.display_name, "Cherry Tomato");
        assert!(registry.lookup("basil").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);

        registry
            .register("Basil", BTreeMap::new(), at(8, 0, 0))
            .unwrap();
        let err = registry
            .register("basil", BTreeMap::new(), at(9, 0, 0))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(id) if id == "basil"));
    }

    #[test]
    fn test_blank_name_rejected() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        let err = registry
            .register("   ", BTreeMap::new(), at(8, 0, 0))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName));
    }

    #[test]
    fn test_list_ids_in_registration_order() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);

        registry
            .register("Zinnia", BTreeMap::new(), at(8, 0, 0))
            .unwrap();
        registry
            .register("Basil", BTreeMap::new(), at(9, 0, 0))
            .unwrap();
        registry
            .register("Mint", BTreeMap::new(), at(10, 0, 0))
            .unwrap();

        assert_eq!(registry.list_ids(), vec!["zinnia", "basil", "mint"]);
    }

    #[test]
    fn test_record_capture_updates_counters() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        registry
            .register("Basil", BTreeMap::new(), at(8, 0, 0))
            .unwrap();

        for i in 0..3 {
            registry.record_capture("basil", at(9 + i, 0, 0)).unwrap();
        }

        let plant = registry.lookup("basil").unwrap();
        assert_eq!(plant.image_count, 3);
        assert_eq!(plant.last_captured, Some(at(11, 0, 0)));
        assert_eq!(registry.total_images(), 3);
    }

    #[test]
    fn test_record_capture_unknown_plant_is_noop() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);

        registry.record_capture("ghost", at(9, 0, 0)).unwrap();
        assert_eq!(registry.plant_count(), 0);
        assert_eq!(registry.total_images(), 0);
    }

    #[test]
    fn test_counters_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let registry = open_registry(&dir);
            registry
                .register("Basil", BTreeMap::new(), at(8, 0, 0))
                .unwrap();
            registry.record_capture("basil", at(9, 0, 0)).unwrap();
        }

        let reopened = open_registry(&dir);
        assert_eq!(reopened.lookup("basil").unwrap().image_count, 1);
    }
}
