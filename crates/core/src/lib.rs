use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;

mod config;
mod error;
pub mod exec;
mod lock;

pub use config::{invoking_user, Config, InvokingUser};
pub use error::{Result, VhdError};
pub use lock::{create_dir_all_owned, FileLock, LockMode};

pub const TRACKING_SCHEMA_VERSION: &str = "1.0";

/// One block device as reported by the kernel at snapshot time.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub uuid: Option<String>,
    pub fs_type: Option<String>,
    pub mount_points: Vec<String>,
    pub size_bytes: u64,
    pub fs_used_bytes: Option<u64>,
    pub fs_use_percent: Option<String>,
}

impl BlockDevice {
    pub fn first_mount_point(&self) -> Option<&str> {
        self.mount_points
            .iter()
            .map(|mount| mount.as_str())
            .find(|mount| !mount.is_empty())
    }

    pub fn is_mounted_at(&self, mount_point: &str) -> bool {
        let wanted = normalize_mount_point(mount_point);
        self.mount_points
            .iter()
            .any(|mount| normalize_mount_point(mount) == wanted)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TrackingRecord {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub mount_point: String,
    #[serde(default)]
    pub last_attached: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DetachHistoryEntry {
    pub path: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub device_name: String,
    pub timestamp: String,
}

/// On-disk layout of the tracking file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TrackingFile {
    #[serde(default = "default_schema_version")]
    pub version: String,
    #[serde(default)]
    pub mappings: BTreeMap<String, TrackingRecord>,
    #[serde(default)]
    pub detach_history: Vec<DetachHistoryEntry>,
}

impl Default for TrackingFile {
    fn default() -> Self {
        Self {
            version: default_schema_version(),
            mappings: BTreeMap::new(),
            detach_history: Vec::new(),
        }
    }
}

fn default_schema_version() -> String {
    TRACKING_SCHEMA_VERSION.to_string()
}

/// Whatever the caller knows about a VHD. Any subset of fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhdSelector {
    pub path: Option<String>,
    pub uuid: Option<String>,
    pub device_name: Option<String>,
}

impl VhdSelector {
    pub fn new(path: Option<String>, uuid: Option<String>, device_name: Option<String>) -> Self {
        Self {
            path: non_empty(path),
            uuid: non_empty(uuid),
            device_name: non_empty(device_name).map(|name| strip_dev_prefix(&name).to_string()),
        }
    }

    pub fn by_path(path: impl Into<String>) -> Self {
        Self::new(Some(path.into()), None, None)
    }

    pub fn by_uuid(uuid: impl Into<String>) -> Self {
        Self::new(None, Some(uuid.into()), None)
    }

    pub fn by_device(device_name: impl Into<String>) -> Self {
        Self::new(None, None, Some(device_name.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.uuid.is_none() && self.device_name.is_none()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn strip_dev_prefix(name: &str) -> &str {
    name.strip_prefix("/dev/").unwrap_or(name)
}

/// Trailing slashes are not significant when comparing mount points.
pub fn normalize_mount_point(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Device names reserved for dynamically attached disks.
///
/// The host's own disks occupy `sda`..`sdc`; everything from `sdd` on,
/// including the two-letter `sdaa` range, belongs to attached VHDs.
pub fn is_dynamic_vhd_device(name: &str) -> bool {
    let name = strip_dev_prefix(name);
    let Some(suffix) = name.strip_prefix("sd") else {
        return false;
    };
    let bytes = suffix.as_bytes();
    if bytes.is_empty() || !bytes.iter().all(|b| b.is_ascii_lowercase()) {
        return false;
    }
    match bytes.len() {
        1 => bytes[0] >= b'd',
        2 => true,
        _ => false,
    }
}

/// Device Inspector contract. Every query works on a fresh snapshot.
pub trait BlockDevices {
    fn snapshot(&self) -> Result<Vec<BlockDevice>>;

    fn enumerate_devices(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.into_iter().map(|device| device.name).collect())
    }

    fn uuid_of(&self, device_name: &str) -> Result<Option<String>> {
        let name = strip_dev_prefix(device_name);
        Ok(self
            .snapshot()?
            .into_iter()
            .find(|device| device.name == name)
            .and_then(|device| device.uuid))
    }

    fn device_of(&self, uuid: &str) -> Result<Option<String>> {
        Ok(self
            .snapshot()?
            .into_iter()
            .find(|device| device.uuid.as_deref() == Some(uuid))
            .map(|device| device.name))
    }

    fn mount_point_of(&self, uuid: &str) -> Result<Option<String>> {
        Ok(self
            .snapshot()?
            .iter()
            .find(|device| device.uuid.as_deref() == Some(uuid))
            .and_then(|device| device.first_mount_point().map(str::to_string)))
    }

    fn uuid_at_mount_point(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .snapshot()?
            .into_iter()
            .find(|device| device.is_mounted_at(path))
            .and_then(|device| device.uuid))
    }

    fn dynamic_vhd_names(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .snapshot()?
            .into_iter()
            .map(|device| device.name)
            .filter(|name| is_dynamic_vhd_device(name))
            .collect())
    }

    fn count_dynamic_vhds(&self) -> Result<usize> {
        Ok(self.dynamic_vhd_names()?.len())
    }

    fn find_single_dynamic_vhd_uuid(&self) -> Result<String> {
        let dynamic: Vec<BlockDevice> = self
            .snapshot()?
            .into_iter()
            .filter(|device| is_dynamic_vhd_device(&device.name))
            .collect();
        if dynamic.len() != 1 {
            return Err(VhdError::AmbiguousDevice {
                candidates: dynamic.into_iter().map(|device| device.name).collect(),
            });
        }
        let device = &dynamic[0];
        device
            .uuid
            .clone()
            .ok_or_else(|| VhdError::not_formatted(&device.name))
    }
}

/// Mount, unmount and format primitives.
pub trait MountOps {
    fn create_mount_point(&self, mount_point: &Path) -> Result<()>;
    fn mount_by_uuid(&self, uuid: &str, mount_point: &Path) -> Result<()>;
    fn unmount(&self, mount_point: &Path) -> Result<()>;
    fn adjust_ownership(&self, mount_point: &Path, owner: Option<(u32, u32)>) -> Result<()>;
    fn format_device(&self, device_name: &str, fs_type: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetachOutcome {
    Detached,
    NotAttached,
}

/// Host-side attach/detach primitive. `attach` never reports which device
/// appeared; callers diff device snapshots to find out.
pub trait VhdAttacher {
    fn attach(&self, path: &str) -> Result<AttachOutcome>;
    fn detach(&self, path: &str, timeout: Duration) -> Result<DetachOutcome>;
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
