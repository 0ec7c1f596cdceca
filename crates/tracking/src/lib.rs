//! Durable path -> identity map plus the bounded detach history.

use std::collections::BTreeMap;
use std::path::Path;
use vhdm_core::{
    now_utc_rfc3339, Config, DetachHistoryEntry, Result, TrackingFile, TrackingRecord, VhdError,
};

mod backend;

pub use backend::{read_tracking_file, write_atomic, DirectFile, LockedFile, TrackingBackend};

pub struct TrackingStore {
    backend: Box<dyn TrackingBackend>,
    history_limit: usize,
}

impl TrackingStore {
    pub fn new(backend: Box<dyn TrackingBackend>, history_limit: usize) -> Self {
        Self {
            backend,
            history_limit,
        }
    }

    /// Picks the backend the config asks for.
    pub fn open(config: &Config, owner: Option<(u32, u32)>) -> Self {
        let backend: Box<dyn TrackingBackend> = if config.store_locking {
            Box::new(LockedFile::new(&config.tracking_file).with_owner(owner))
        } else {
            Box::new(DirectFile::new(&config.tracking_file).with_owner(owner))
        };
        tracing::debug!(
            path = %config.tracking_file.display(),
            locking = config.store_locking,
            "opened tracking store"
        );
        Self::new(backend, config.history_limit)
    }

    pub fn path(&self) -> &Path {
        self.backend.path()
    }

    pub fn load(&self) -> Result<TrackingFile> {
        self.backend.load()
    }

    /// Records a mount/attach observation for `path`. A record's UUID never
    /// changes once set; use [`TrackingStore::replace_mapping`] after a format.
    pub fn save_mapping(
        &self,
        path: &str,
        uuid: &str,
        mount_point: &str,
        device_name: &str,
    ) -> Result<()> {
        let timestamp = now_utc_rfc3339();
        self.backend.update(&mut |file| {
            let record = file.mappings.entry(path.to_string()).or_default();
            if !record.uuid.is_empty() && !uuid.is_empty() && record.uuid != uuid {
                return Err(VhdError::IdentityConflict(format!(
                    "{path} is tracked with UUID {}, refusing to overwrite it with {uuid}",
                    record.uuid
                )));
            }
            if !uuid.is_empty() {
                record.uuid = uuid.to_string();
            }
            record.device_name = device_name.to_string();
            record.mount_point = mount_point.to_string();
            record.last_attached = timestamp.clone();
            Ok(())
        })?;
        tracing::debug!(path, uuid, mount_point, device = device_name, "saved mapping");
        Ok(())
    }

    /// Drops whatever was known about `path` and starts a fresh record. Only
    /// a format should call this.
    pub fn replace_mapping(&self, path: &str, uuid: &str, device_name: &str) -> Result<()> {
        let timestamp = now_utc_rfc3339();
        self.backend.update(&mut |file| {
            let previous = file.mappings.insert(
                path.to_string(),
                TrackingRecord {
                    uuid: uuid.to_string(),
                    device_name: device_name.to_string(),
                    mount_point: String::new(),
                    last_attached: timestamp.clone(),
                },
            );
            if let Some(previous) = previous.filter(|record| !record.uuid.is_empty()) {
                tracing::info!(path, old_uuid = %previous.uuid, new_uuid = uuid, "replaced tracked UUID");
            }
            Ok(())
        })
    }

    /// Marks `path` as no longer mounted, keeping the rest of the record.
    pub fn clear_mount_point(&self, path: &str) -> Result<()> {
        self.backend.update(&mut |file| {
            if let Some(record) = file.mappings.get_mut(path) {
                record.mount_point.clear();
            }
            Ok(())
        })
    }

    pub fn remove_mapping(&self, path: &str) -> Result<bool> {
        let mut removed = false;
        self.backend.update(&mut |file| {
            removed = file.mappings.remove(path).is_some();
            Ok(())
        })?;
        Ok(removed)
    }

    pub fn lookup_record(&self, path: &str) -> Result<Option<TrackingRecord>> {
        Ok(self.load()?.mappings.remove(path))
    }

    pub fn lookup_uuid_by_path(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .lookup_record(path)?
            .map(|record| record.uuid)
            .filter(|uuid| !uuid.is_empty()))
    }

    pub fn lookup_path_by_uuid(&self, uuid: &str) -> Result<Option<String>> {
        if uuid.is_empty() {
            return Ok(None);
        }
        Ok(self
            .load()?
            .mappings
            .into_iter()
            .find(|(_, record)| record.uuid == uuid)
            .map(|(path, _)| path))
    }

    pub fn lookup_device_by_path(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .lookup_record(path)?
            .map(|record| record.device_name)
            .filter(|name| !name.is_empty()))
    }

    pub fn mappings(&self) -> Result<BTreeMap<String, TrackingRecord>> {
        Ok(self.load()?.mappings)
    }

    /// Appends to the history, evicting the oldest entries beyond the
    /// retention limit.
    pub fn save_detach_history(&self, entry: DetachHistoryEntry) -> Result<()> {
        let limit = self.history_limit;
        self.backend.update(&mut |file| {
            file.detach_history.push(entry.clone());
            let excess = file.detach_history.len().saturating_sub(limit);
            if excess > 0 {
                file.detach_history.drain(..excess);
            }
            Ok(())
        })
    }

    pub fn remove_detach_history(&self, path: &str) -> Result<usize> {
        let mut removed = 0;
        self.backend.update(&mut |file| {
            let before = file.detach_history.len();
            file.detach_history.retain(|entry| entry.path != path);
            removed = before - file.detach_history.len();
            Ok(())
        })?;
        Ok(removed)
    }

    /// Up to `limit` entries, newest first.
    pub fn get_history(&self, limit: usize) -> Result<Vec<DetachHistoryEntry>> {
        Ok(self
            .load()?
            .detach_history
            .into_iter()
            .rev()
            .take(limit)
            .collect())
    }
}

pub fn detach_entry(path: &str, uuid: &str, device_name: &str) -> DetachHistoryEntry {
    DetachHistoryEntry {
        path: path.to_string(),
        uuid: uuid.to_string(),
        device_name: device_name.to_string(),
        timestamp: now_utc_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, history_limit: usize) -> TrackingStore {
        TrackingStore::new(
            Box::new(LockedFile::new(dir.path().join("vhd_mapping.json"))),
            history_limit,
        )
    }

    #[test]
    fn mapping_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        store
            .save_mapping("C:/VMs/data.vhdx", "uuid-1", "/mnt/data", "sde")
            .unwrap();
        assert_eq!(
            store.lookup_uuid_by_path("C:/VMs/data.vhdx").unwrap().as_deref(),
            Some("uuid-1")
        );
        assert_eq!(
            store.lookup_path_by_uuid("uuid-1").unwrap().as_deref(),
            Some("C:/VMs/data.vhdx")
        );
        assert_eq!(
            store.lookup_device_by_path("C:/VMs/data.vhdx").unwrap().as_deref(),
            Some("sde")
        );
        assert_eq!(store.lookup_uuid_by_path("C:/other.vhdx").unwrap(), None);
        assert_eq!(store.lookup_path_by_uuid("").unwrap(), None);
    }

    #[test]
    fn file_layout_matches_documented_shape() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        store.save_mapping("C:/a.vhdx", "u", "/mnt/a", "sdd").unwrap();
        store
            .save_detach_history(detach_entry("C:/b.vhdx", "v", "sde"))
            .unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], "1.0");
        let record = &raw["mappings"]["C:/a.vhdx"];
        for key in ["uuid", "device_name", "mount_point", "last_attached"] {
            assert!(record.get(key).is_some(), "missing {key}");
        }
        let entry = &raw["detach_history"][0];
        for key in ["path", "uuid", "device_name", "timestamp"] {
            assert!(entry.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn uuid_is_immutable_once_set() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        store.save_mapping("C:/a.vhdx", "u1", "/mnt/a", "sdd").unwrap();
        let err = store.save_mapping("C:/a.vhdx", "u2", "/mnt/a", "sdd").unwrap_err();
        assert!(matches!(err, VhdError::IdentityConflict(_)));

        // An empty UUID observation keeps the known one.
        store.save_mapping("C:/a.vhdx", "", "", "sdf").unwrap();
        let record = store.lookup_record("C:/a.vhdx").unwrap().unwrap();
        assert_eq!(record.uuid, "u1");
        assert_eq!(record.device_name, "sdf");

        store.replace_mapping("C:/a.vhdx", "u2", "sdf").unwrap();
        assert_eq!(store.lookup_uuid_by_path("C:/a.vhdx").unwrap().as_deref(), Some("u2"));
    }

    #[test]
    fn remount_refreshes_only_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        store.save_mapping("C:/a.vhdx", "u1", "/mnt/a", "sdd").unwrap();
        let first = store.lookup_record("C:/a.vhdx").unwrap().unwrap();
        store.save_mapping("C:/a.vhdx", "u1", "/mnt/a", "sdd").unwrap();
        let second = store.lookup_record("C:/a.vhdx").unwrap().unwrap();
        assert_eq!(
            (first.uuid, first.device_name, first.mount_point),
            (second.uuid, second.device_name, second.mount_point)
        );
        assert!(second.last_attached >= first.last_attached);
    }

    #[test]
    fn history_is_a_bounded_fifo() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        for index in 0..4 {
            store
                .save_detach_history(detach_entry(&format!("C:/{index}.vhdx"), "u", "sdd"))
                .unwrap();
        }
        let stored: Vec<String> = store
            .load()
            .unwrap()
            .detach_history
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        assert_eq!(stored, vec!["C:/1.vhdx", "C:/2.vhdx", "C:/3.vhdx"]);

        let newest: Vec<String> = store
            .get_history(2)
            .unwrap()
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        assert_eq!(newest, vec!["C:/3.vhdx", "C:/2.vhdx"]);
    }

    #[test]
    fn history_and_mappings_can_be_removed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        store.save_mapping("C:/a.vhdx", "u1", "/mnt/a", "sdd").unwrap();
        store.save_detach_history(detach_entry("C:/a.vhdx", "u1", "sdd")).unwrap();
        store.save_detach_history(detach_entry("C:/b.vhdx", "u2", "sde")).unwrap();
        store.save_detach_history(detach_entry("C:/a.vhdx", "u1", "sdd")).unwrap();

        assert_eq!(store.remove_detach_history("C:/a.vhdx").unwrap(), 2);
        assert_eq!(store.get_history(10).unwrap().len(), 1);
        assert!(store.remove_mapping("C:/a.vhdx").unwrap());
        assert!(!store.remove_mapping("C:/a.vhdx").unwrap());
    }

    #[test]
    fn clear_mount_point_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        store.save_mapping("C:/a.vhdx", "u1", "/mnt/a", "sdd").unwrap();
        store.clear_mount_point("C:/a.vhdx").unwrap();
        let record = store.lookup_record("C:/a.vhdx").unwrap().unwrap();
        assert_eq!(record.mount_point, "");
        assert_eq!(record.uuid, "u1");
    }

    #[test]
    fn each_call_rereads_the_file() {
        let dir = TempDir::new().unwrap();
        let first = store(&dir, 10);
        let second = store(&dir, 10);
        first.save_mapping("C:/a.vhdx", "u1", "", "sdd").unwrap();
        second.save_mapping("C:/b.vhdx", "u2", "", "sde").unwrap();
        let paths: Vec<String> = first.mappings().unwrap().into_keys().collect();
        assert_eq!(paths, vec!["C:/a.vhdx", "C:/b.vhdx"]);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let writers = 8;
        std::thread::scope(|scope| {
            for index in 0..writers {
                let dir = &dir;
                scope.spawn(move || {
                    let store = store(dir, 10);
                    for round in 0..5 {
                        store
                            .save_mapping(
                                &format!("C:/disk{index}.vhdx"),
                                &format!("uuid-{index}"),
                                &format!("/mnt/disk{index}"),
                                &format!("sd{}", (b'd' + index as u8) as char),
                            )
                            .unwrap();
                        store
                            .save_detach_history(detach_entry(
                                &format!("C:/disk{index}.vhdx"),
                                &format!("uuid-{index}"),
                                &format!("round-{round}"),
                            ))
                            .unwrap();
                    }
                });
            }
        });

        let store = store(&dir, 10);
        let mappings = store.mappings().unwrap();
        assert_eq!(mappings.len(), writers);
        for index in 0..writers {
            let record = &mappings[&format!("C:/disk{index}.vhdx")];
            assert_eq!(record.uuid, format!("uuid-{index}"));
        }
        assert_eq!(store.load().unwrap().detach_history.len(), 10);
    }
}
