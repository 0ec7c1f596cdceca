use std::path::{Path, PathBuf};
use std::sync::Arc;
use vhdm_core::exec::{classify, CommandRunner, SystemRunner, ToolOutcome};
use vhdm_core::{strip_dev_prefix, BlockDevice, BlockDevices, MountOps, Result, VhdError};

mod lsblk;
mod mounts;

use lsblk::{parse_lsblk, COLUMNS, LEGACY_COLUMNS};

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// blkid exits with 2 when the device carries no recognisable filesystem
/// or the token could not be found.
const BLKID_NOT_FOUND: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LsblkFailure {
    UnknownColumn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UmountFailure {
    NotMounted,
}

const LSBLK_SIGNATURES: &[(&str, LsblkFailure)] = &[("unknown column", LsblkFailure::UnknownColumn)];
const UMOUNT_SIGNATURES: &[(&str, UmountFailure)] = &[
    ("not mounted", UmountFailure::NotMounted),
    ("no mount point specified", UmountFailure::NotMounted),
];

/// Device Inspector and mount primitives for the Linux guest.
#[derive(Clone)]
pub struct LinuxHost {
    runner: Arc<dyn CommandRunner>,
    mounts_path: PathBuf,
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new(Arc::new(SystemRunner))
    }
}

impl LinuxHost {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            mounts_path: PathBuf::from(PROC_MOUNTS),
        }
    }

    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }

    fn lsblk(&self, columns: &str) -> Result<ToolOutcome<LsblkFailure>> {
        let output = self
            .runner
            .run("lsblk", &["-J", "-b", "-o", columns], None)
            .map_err(|err| VhdError::DeviceQuery(err.to_string()))?;
        Ok(classify(output, LSBLK_SIGNATURES))
    }
}

impl BlockDevices for LinuxHost {
    fn snapshot(&self) -> Result<Vec<BlockDevice>> {
        let output = match self.lsblk(COLUMNS)? {
            ToolOutcome::Success(output) => output,
            ToolOutcome::Known(LsblkFailure::UnknownColumn, _) => {
                tracing::debug!("lsblk lacks MOUNTPOINTS, retrying with MOUNTPOINT");
                match self.lsblk(LEGACY_COLUMNS)? {
                    ToolOutcome::Success(output) => output,
                    ToolOutcome::Known(_, output)
                    | ToolOutcome::TimedOut(output)
                    | ToolOutcome::Failed(output) => {
                        return Err(VhdError::DeviceQuery(format!("lsblk: {}", output.combined())))
                    }
                }
            }
            ToolOutcome::TimedOut(output) | ToolOutcome::Failed(output) => {
                return Err(VhdError::DeviceQuery(format!("lsblk: {}", output.combined())))
            }
        };

        let mut devices = parse_lsblk(&output.stdout)?;
        // lsblk relies on udev, which can lag behind the kernel mount table.
        let table = mounts::read_mounts(&self.mounts_path);
        for device in &mut devices {
            if let Some(extra) = table.get(&device.name) {
                for mount in extra {
                    if !device.mount_points.contains(mount) {
                        device.mount_points.push(mount.clone());
                    }
                }
            }
        }
        tracing::trace!(count = devices.len(), "block device snapshot");
        Ok(devices)
    }

    fn uuid_of(&self, device_name: &str) -> Result<Option<String>> {
        let device = format!("/dev/{}", strip_dev_prefix(device_name));
        let output = self
            .runner
            .run("blkid", &["-s", "UUID", "-o", "value", &device], None)?;
        if output.status == Some(BLKID_NOT_FOUND) {
            return Ok(None);
        }
        if !output.success() {
            return Err(output.into_error("blkid"));
        }
        let uuid = output.stdout.trim();
        Ok((!uuid.is_empty()).then(|| uuid.to_string()))
    }

    fn device_of(&self, uuid: &str) -> Result<Option<String>> {
        let from_snapshot = self
            .snapshot()?
            .into_iter()
            .find(|device| device.uuid.as_deref() == Some(uuid))
            .map(|device| device.name);
        if from_snapshot.is_some() {
            return Ok(from_snapshot);
        }
        let output = self.runner.run("blkid", &["-U", uuid], None)?;
        if output.status == Some(BLKID_NOT_FOUND) {
            return Ok(None);
        }
        if !output.success() {
            return Err(output.into_error("blkid"));
        }
        let path = output.stdout.trim();
        Ok((!path.is_empty()).then(|| strip_dev_prefix(path).to_string()))
    }
}

impl MountOps for LinuxHost {
    fn create_mount_point(&self, mount_point: &Path) -> Result<()> {
        std::fs::create_dir_all(mount_point)?;
        Ok(())
    }

    fn mount_by_uuid(&self, uuid: &str, mount_point: &Path) -> Result<()> {
        let source = format!("UUID={uuid}");
        let target = mount_point.display().to_string();
        tracing::info!(uuid, mount_point = %target, "mounting filesystem");
        let output = self.runner.run("mount", &[&source, &target], None)?;
        if output.success() {
            Ok(())
        } else {
            Err(output.into_error("mount"))
        }
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let target = mount_point.display().to_string();
        tracing::info!(mount_point = %target, "unmounting filesystem");
        let output = self.runner.run("umount", &[&target], None)?;
        match classify(output, UMOUNT_SIGNATURES) {
            ToolOutcome::Success(_) => Ok(()),
            ToolOutcome::Known(UmountFailure::NotMounted, _) => {
                tracing::debug!(mount_point = %target, "already unmounted");
                Ok(())
            }
            ToolOutcome::TimedOut(output) | ToolOutcome::Failed(output) => {
                Err(output.into_error("umount"))
            }
        }
    }

    fn adjust_ownership(&self, mount_point: &Path, owner: Option<(u32, u32)>) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            if let Some((uid, gid)) = owner {
                std::os::unix::fs::chown(mount_point, Some(uid), Some(gid))?;
            }
            std::fs::set_permissions(mount_point, std::fs::Permissions::from_mode(0o755))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (mount_point, owner);
        }
        Ok(())
    }

    fn format_device(&self, device_name: &str, fs_type: &str) -> Result<()> {
        let device = format!("/dev/{}", strip_dev_prefix(device_name));
        let program = format!("mkfs.{fs_type}");
        let mut args: Vec<&str> = Vec::new();
        // Whole-device ext filesystems otherwise prompt for confirmation.
        if fs_type.starts_with("ext") {
            args.push("-F");
        }
        args.push(&device);
        tracing::info!(device = %device, fs_type, "creating filesystem");
        let output = self.runner.run(&program, &args, None)?;
        if output.success() {
            Ok(())
        } else {
            Err(output.into_error(&program))
        }
    }
}
