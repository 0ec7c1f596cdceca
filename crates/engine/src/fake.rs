//! In-memory guest kernel plus host attach table, shared by the unit tests
//! and the scenario tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use vhdm_core::{
    AttachOutcome, BlockDevice, BlockDevices, DetachOutcome, MountOps, Result, VhdAttacher,
    VhdError,
};

pub const UUID_A: &str = "0a0a0a0a-1111-4111-8111-00000000000a";
pub const UUID_B: &str = "0b0b0b0b-2222-4222-8222-00000000000b";
pub const UUID_S: &str = "05050505-3333-4333-8333-000000000005";
/// Not held by any image.
pub const UUID_X: &str = "0e0e0e0e-4444-4444-8444-00000000000e";

#[derive(Debug, Clone, Default)]
struct Image {
    uuid: Option<String>,
    fs_type: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    images: BTreeMap<String, Image>,
    /// device name -> image path
    attached: BTreeMap<String, String>,
    /// mount point -> device name
    mounts: BTreeMap<String, String>,
    attach_calls: usize,
    formats: usize,
    devices_hidden: bool,
    /// Snapshots a freshly attached device stays invisible for.
    appear_after: usize,
    /// device name -> snapshots left before it shows up
    settling: BTreeMap<String, usize>,
    /// image path -> image the host attaches alongside it
    companions: BTreeMap<String, String>,
    snapshots: usize,
    chown_fails: bool,
}

#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

#[allow(dead_code)]
impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_image(&self, path: &str, uuid: Option<&str>) {
        self.state().images.insert(
            path.to_string(),
            Image {
                uuid: uuid.map(str::to_string),
                fs_type: uuid.map(|_| "ext4".to_string()),
            },
        );
    }

    /// Attaches without going through the engine, like another tool would.
    pub fn attach_outside(&self, path: &str) -> String {
        let mut state = self.state();
        let name = next_free_device(&state);
        state.attached.insert(name.clone(), path.to_string());
        name
    }

    pub fn mount_outside(&self, uuid: &str, mount_point: &str) {
        let mut state = self.state();
        let device = device_with_uuid(&state, uuid).expect("filesystem is not attached");
        state.mounts.insert(mount_point.to_string(), device);
    }

    pub fn detach_outside(&self, path: &str) {
        let mut state = self.state();
        detach_path(&mut state, path);
    }

    /// Attaches succeed but no block device ever shows up.
    pub fn hide_new_devices(&self) {
        self.state().devices_hidden = true;
    }

    /// Devices attached from now on only show up in the `n`th snapshot
    /// after the attach.
    pub fn delay_new_devices(&self, snapshots: usize) {
        self.state().appear_after = snapshots;
    }

    /// Attaching `path` also attaches `companion`, which gets the lower
    /// device name.
    pub fn attach_together(&self, path: &str, companion: &str) {
        self.state()
            .companions
            .insert(path.to_string(), companion.to_string());
    }

    pub fn snapshot_count(&self) -> usize {
        self.state().snapshots
    }

    pub fn fail_chown(&self) {
        self.state().chown_fails = true;
    }

    pub fn attach_calls(&self) -> usize {
        self.state().attach_calls
    }

    pub fn format_calls(&self) -> usize {
        self.state().formats
    }

    pub fn device_of_path(&self, path: &str) -> Option<String> {
        let state = self.state();
        state
            .attached
            .iter()
            .find(|(_, image)| image.as_str() == path)
            .map(|(name, _)| name.clone())
    }

    /// mount point -> UUID of the mounted filesystem
    pub fn mounts(&self) -> BTreeMap<String, String> {
        let state = self.state();
        state
            .mounts
            .iter()
            .filter_map(|(mount_point, device)| {
                let path = state.attached.get(device)?;
                let uuid = state.images.get(path)?.uuid.clone()?;
                Some((mount_point.clone(), uuid))
            })
            .collect()
    }
}

fn next_free_device(state: &State) -> String {
    let single = (b'd'..=b'z').map(|c| format!("sd{}", c as char));
    let double = (b'a'..=b'z')
        .flat_map(|a| (b'a'..=b'z').map(move |b| format!("sd{}{}", a as char, b as char)));
    single
        .chain(double)
        .find(|name| !state.attached.contains_key(name))
        .unwrap_or_else(|| "sdzz".to_string())
}

fn device_with_uuid(state: &State, uuid: &str) -> Option<String> {
    state.attached.iter().find_map(|(name, path)| {
        let image = state.images.get(path)?;
        (image.uuid.as_deref() == Some(uuid)).then(|| name.clone())
    })
}

fn detach_path(state: &mut State, path: &str) -> bool {
    let Some(name) = state
        .attached
        .iter()
        .find(|(_, image)| image.as_str() == path)
        .map(|(name, _)| name.clone())
    else {
        return false;
    };
    state.attached.remove(&name);
    state.mounts.retain(|_, device| *device != name);
    true
}

impl BlockDevices for FakeKernel {
    fn snapshot(&self) -> Result<Vec<BlockDevice>> {
        let mut state = self.state();
        state.snapshots += 1;
        let settling: Vec<String> = state
            .settling
            .iter()
            .filter(|(_, left)| **left > 0)
            .map(|(name, _)| name.clone())
            .collect();
        for left in state.settling.values_mut() {
            *left = left.saturating_sub(1);
        }
        let mut devices = vec![
            BlockDevice {
                name: "sda".to_string(),
                size_bytes: 400 << 20,
                ..Default::default()
            },
            BlockDevice {
                name: "sdb".to_string(),
                fs_type: Some("swap".to_string()),
                ..Default::default()
            },
            BlockDevice {
                name: "sdc".to_string(),
                uuid: Some("root-uuid".to_string()),
                fs_type: Some("ext4".to_string()),
                mount_points: vec!["/".to_string()],
                ..Default::default()
            },
        ];
        if state.devices_hidden {
            return Ok(devices);
        }
        for (name, path) in &state.attached {
            if settling.contains(name) {
                continue;
            }
            let image = state.images.get(path).cloned().unwrap_or_default();
            devices.push(BlockDevice {
                name: name.clone(),
                uuid: image.uuid,
                fs_type: image.fs_type,
                mount_points: state
                    .mounts
                    .iter()
                    .filter(|(_, device)| *device == name)
                    .map(|(mount_point, _)| mount_point.clone())
                    .collect(),
                size_bytes: 100 << 20,
                fs_used_bytes: Some(1 << 20),
                fs_use_percent: Some("1%".to_string()),
            });
        }
        Ok(devices)
    }
}

impl MountOps for FakeKernel {
    fn create_mount_point(&self, _mount_point: &Path) -> Result<()> {
        Ok(())
    }

    fn mount_by_uuid(&self, uuid: &str, mount_point: &Path) -> Result<()> {
        let mut state = self.state();
        let target = mount_point.display().to_string();
        let Some(device) = device_with_uuid(&state, uuid) else {
            return Err(VhdError::ExternalTool {
                tool: "mount".to_string(),
                status: Some(32),
                output: format!("mount: {target}: can't find UUID={uuid}."),
            });
        };
        if state.mounts.contains_key(&target) {
            return Err(VhdError::ExternalTool {
                tool: "mount".to_string(),
                status: Some(32),
                output: format!("mount: {target}: target is busy."),
            });
        }
        state.mounts.insert(target, device);
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.state().mounts.remove(&mount_point.display().to_string());
        Ok(())
    }

    fn adjust_ownership(&self, _mount_point: &Path, _owner: Option<(u32, u32)>) -> Result<()> {
        if self.state().chown_fails {
            return Err(VhdError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        Ok(())
    }

    fn format_device(&self, device_name: &str, fs_type: &str) -> Result<()> {
        let mut state = self.state();
        state.formats += 1;
        let serial = state.formats;
        let path = state
            .attached
            .get(device_name)
            .cloned()
            .ok_or_else(|| VhdError::DeviceNotFound(device_name.to_string()))?;
        let image = state.images.entry(path).or_default();
        image.uuid = Some(format!("00000000-0000-4000-8000-{serial:012}"));
        image.fs_type = Some(fs_type.to_string());
        Ok(())
    }
}

impl VhdAttacher for FakeKernel {
    fn attach(&self, path: &str) -> Result<AttachOutcome> {
        let mut state = self.state();
        state.attach_calls += 1;
        if !state.images.contains_key(path) {
            return Err(VhdError::ExternalTool {
                tool: "wsl.exe --mount".to_string(),
                status: Some(1),
                output: "The system cannot find the file specified.".to_string(),
            });
        }
        if state.attached.values().any(|image| image == path) {
            return Ok(AttachOutcome::AlreadyAttached);
        }
        let mut paths = Vec::new();
        if let Some(companion) = state.companions.get(path).cloned() {
            if !state.attached.values().any(|image| *image == companion) {
                paths.push(companion);
            }
        }
        paths.push(path.to_string());
        for image in paths {
            let name = next_free_device(&state);
            let delay = state.appear_after;
            if delay > 0 {
                state.settling.insert(name.clone(), delay);
            }
            state.attached.insert(name, image);
        }
        Ok(AttachOutcome::Attached)
    }

    fn detach(&self, path: &str, _timeout: Duration) -> Result<DetachOutcome> {
        if detach_path(&mut self.state(), path) {
            Ok(DetachOutcome::Detached)
        } else {
            Ok(DetachOutcome::NotAttached)
        }
    }
}
