use crate::VhdManager;
use serde::Serialize;
use std::collections::BTreeSet;
use vhdm_core::{
    is_dynamic_vhd_device, BlockDevice, DetachHistoryEntry, Result, TrackingRecord, VhdSelector,
};
use vhdm_safety::{validate_selector, validate_vhd_path};

/// Live state of one VHD joined with what the tracking store remembers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub path: Option<String>,
    pub uuid: Option<String>,
    pub device_name: Option<String>,
    pub attached: bool,
    pub mount_point: Option<String>,
    pub tracked: bool,
    pub fs_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub fs_used_bytes: Option<u64>,
    pub fs_use_percent: Option<String>,
    pub last_attached: Option<String>,
}

impl StatusEntry {
    fn new(path: Option<String>, record: Option<&TrackingRecord>, device: Option<&BlockDevice>) -> Self {
        let recorded_uuid = record
            .map(|record| record.uuid.clone())
            .filter(|uuid| !uuid.is_empty());
        Self {
            path,
            uuid: device.and_then(|device| device.uuid.clone()).or(recorded_uuid),
            device_name: device.map(|device| device.name.clone()),
            attached: device.is_some(),
            mount_point: device
                .and_then(|device| device.first_mount_point())
                .map(str::to_string),
            tracked: record.is_some(),
            fs_type: device.and_then(|device| device.fs_type.clone()),
            size_bytes: device.map(|device| device.size_bytes),
            fs_used_bytes: device.and_then(|device| device.fs_used_bytes),
            fs_use_percent: device.and_then(|device| device.fs_use_percent.clone()),
            last_attached: record
                .map(|record| record.last_attached.clone())
                .filter(|stamp| !stamp.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForgetReport {
    pub path: String,
    pub mapping_removed: bool,
    pub history_removed: usize,
}

impl VhdManager<'_> {
    /// One entry for the selected VHD, or without a selector every tracked
    /// VHD followed by attached VHDs nobody is tracking.
    pub fn status(&self, selector: Option<&VhdSelector>) -> Result<Vec<StatusEntry>> {
        if let Some(selector) = selector {
            let identity = self.resolve(&validate_selector(selector)?, None)?;
            let snapshot = self.devices.snapshot()?;
            let device = identity
                .device_name
                .as_ref()
                .and_then(|name| snapshot.iter().find(|device| &device.name == name));
            let record = match &identity.path {
                Some(path) => self.store.lookup_record(path)?,
                None => None,
            };
            let mut entry = StatusEntry::new(identity.path.clone(), record.as_ref(), device);
            entry.uuid = entry.uuid.or(identity.uuid);
            return Ok(vec![entry]);
        }

        let snapshot = self.devices.snapshot()?;
        let mappings = self.store.mappings()?;
        let mut entries = Vec::new();
        let mut tracked_uuids = BTreeSet::new();
        for (path, record) in &mappings {
            let device = snapshot
                .iter()
                .find(|device| !record.uuid.is_empty() && device.uuid.as_ref() == Some(&record.uuid));
            if !record.uuid.is_empty() {
                tracked_uuids.insert(record.uuid.as_str());
            }
            entries.push(StatusEntry::new(Some(path.clone()), Some(record), device));
        }
        for device in &snapshot {
            let untracked = device
                .uuid
                .as_deref()
                .map_or(true, |uuid| !tracked_uuids.contains(uuid));
            if is_dynamic_vhd_device(&device.name) && untracked {
                entries.push(StatusEntry::new(None, None, Some(device)));
            }
        }
        Ok(entries)
    }

    /// Newest detach events first.
    pub fn history(&self, limit: usize) -> Result<Vec<DetachHistoryEntry>> {
        self.store.get_history(limit)
    }

    /// Drops everything the tracking store knows about `path`. The VHD itself
    /// is left alone.
    pub fn forget(&self, path: &str) -> Result<ForgetReport> {
        let path = validate_vhd_path(path)?;
        let mapping_removed = self.store.remove_mapping(&path)?;
        let history_removed = self.store.remove_detach_history(&path)?;
        tracing::info!(path = %path, mapping_removed, history_removed, "forgot VHD");
        Ok(ForgetReport {
            path,
            mapping_removed,
            history_removed,
        })
    }
}
