//! Identity resolution and the mount/unmount/format workflows built on the
//! collaborator traits from `vhdm-core`.

use std::path::PathBuf;
use std::time::Duration;
use vhdm_core::{BlockDevices, Config, MountOps, VhdAttacher};
use vhdm_tracking::TrackingStore;

mod attach;
mod format;
mod mount;
mod resolve;
mod status;
mod unmount;

#[cfg(test)]
mod fake;
#[cfg(test)]
mod fixture;

pub use attach::{detect_new_device, new_devices, AttachAction, AttachReport};
pub use format::{FormatReport, FormatRequest};
pub use mount::{MountAction, MountReport, MountRequest};
pub use resolve::ResolvedIdentity;
pub use status::{ForgetReport, StatusEntry};
pub use unmount::{UnmountReport, UnmountRequest};

/// Everything the engine needs from the guest kernel.
pub trait DeviceHost: BlockDevices + MountOps {}

impl<T: BlockDevices + MountOps> DeviceHost for T {}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub settle_timeout: Duration,
    pub settle_poll: Duration,
    pub detach_timeout: Duration,
    /// Directory for `attach.lock`.
    pub lock_dir: PathBuf,
    /// uid/gid handed the mount point after mounting.
    pub owner: Option<(u32, u32)>,
    pub default_fs_type: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config, owner: Option<(u32, u32)>) -> Self {
        Self {
            settle_timeout: config.settle_timeout(),
            settle_poll: config.settle_poll_interval(),
            detach_timeout: config.detach_timeout(),
            lock_dir: config.state_dir(),
            owner,
            default_fs_type: config.default_fs_type.clone(),
        }
    }
}

/// Ties the Device Inspector, Attachment Controller and Tracking Store
/// together. Holds no state of its own; every operation reads the kernel
/// and the store afresh.
pub struct VhdManager<'a> {
    devices: &'a dyn DeviceHost,
    attacher: &'a dyn VhdAttacher,
    store: &'a TrackingStore,
    settings: EngineSettings,
}

impl<'a> VhdManager<'a> {
    pub fn new(
        devices: &'a dyn DeviceHost,
        attacher: &'a dyn VhdAttacher,
        store: &'a TrackingStore,
        settings: EngineSettings,
    ) -> Self {
        Self {
            devices,
            attacher,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Runs a bookkeeping write that must not undo kernel-level work already
    /// done. A failure becomes a warning on the report.
    fn record(&self, what: &str, warnings: &mut Vec<String>, write: impl FnOnce() -> vhdm_core::Result<()>) {
        if let Err(err) = write() {
            tracing::warn!(error = %err, "{what} failed, tracking file may be behind");
            warnings.push(format!("{what} failed: {err}"));
        }
    }
}

