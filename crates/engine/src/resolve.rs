use crate::VhdManager;
use serde::Serialize;
use vhdm_core::{Result, VhdError, VhdSelector};

/// What is known about one VHD after cross-checking the kernel and the
/// tracking store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub path: Option<String>,
    pub uuid: Option<String>,
    pub device_name: Option<String>,
    /// Where the filesystem is mounted right now.
    pub mount_point: Option<String>,
    pub attached: bool,
}

impl VhdManager<'_> {
    /// Precedence: an occupied mount point wins, then the device name, then
    /// the UUID (given or remembered for the path). Disagreement between
    /// sources is an error, never a silent override.
    pub fn resolve(
        &self,
        selector: &VhdSelector,
        mount_point: Option<&str>,
    ) -> Result<ResolvedIdentity> {
        if selector.is_empty() {
            return Err(VhdError::InvalidInput(
                "supply at least one of --vhd-path, --uuid or --dev-name".to_string(),
            ));
        }
        if let Some(mount_point) = mount_point {
            if let Some(found) = self.devices.uuid_at_mount_point(mount_point)? {
                return self.resolve_occupied(selector, mount_point, found);
            }
        }

        let tracked = match &selector.path {
            Some(path) => self.store.lookup_uuid_by_path(path)?,
            None => None,
        };
        if let (Some(given), Some(tracked)) = (&selector.uuid, &tracked) {
            if given != tracked {
                return Err(VhdError::IdentityConflict(format!(
                    "{} is tracked with UUID {tracked}, not {given}",
                    selector.path.as_deref().unwrap_or_default()
                )));
            }
        }

        let mut identity = ResolvedIdentity {
            path: selector.path.clone(),
            ..Default::default()
        };

        if let Some(device_name) = &selector.device_name {
            // A device name only exists while the kernel has the disk.
            let snapshot = self.devices.snapshot()?;
            let device = snapshot
                .iter()
                .find(|device| &device.name == device_name)
                .ok_or_else(|| {
                    VhdError::DeviceNotFound(format!("/dev/{device_name} is not present"))
                })?;
            let expected = selector.uuid.as_ref().or(tracked.as_ref());
            if let (Some(expected), Some(found)) = (expected, &device.uuid) {
                if expected != found {
                    return Err(VhdError::IdentityConflict(format!(
                        "/dev/{device_name} holds filesystem {found}, expected {expected}"
                    )));
                }
            }
            identity.device_name = Some(device_name.clone());
            identity.uuid = device.uuid.clone();
            identity.mount_point = device.first_mount_point().map(str::to_string);
            identity.attached = true;
        } else if let Some(uuid) = selector.uuid.clone().or(tracked) {
            match self.devices.device_of(&uuid)? {
                Some(device_name) => {
                    identity.mount_point = self.devices.mount_point_of(&uuid)?;
                    identity.device_name = Some(device_name);
                    identity.attached = true;
                }
                None => {
                    tracing::debug!(uuid = %uuid, "filesystem is not attached");
                }
            }
            identity.uuid = Some(uuid);
        }

        if identity.path.is_none() {
            if let Some(uuid) = &identity.uuid {
                identity.path = self.store.lookup_path_by_uuid(uuid)?;
            }
        }
        if identity.path.is_none() && !identity.attached {
            return Err(VhdError::UuidUnknown {
                uuid: identity.uuid.unwrap_or_default(),
            });
        }
        tracing::debug!(?identity, "resolved identity");
        Ok(identity)
    }

    fn resolve_occupied(
        &self,
        selector: &VhdSelector,
        mount_point: &str,
        found: String,
    ) -> Result<ResolvedIdentity> {
        let conflict = |expected: &str| VhdError::MountPointConflict {
            mount_point: mount_point.to_string(),
            found: found.clone(),
            expected: expected.to_string(),
        };
        if let Some(uuid) = selector.uuid.as_deref().filter(|uuid| *uuid != found) {
            return Err(conflict(uuid));
        }
        if let Some(device_name) = &selector.device_name {
            let on_device = self.devices.uuid_of(device_name)?;
            if let Some(uuid) = on_device.filter(|uuid| *uuid != found) {
                return Err(conflict(&uuid));
            }
        }
        let owner_of_found = self.store.lookup_path_by_uuid(&found)?;
        if let Some(path) = &selector.path {
            let tracked = self.store.lookup_uuid_by_path(path)?;
            if let Some(uuid) = tracked.as_deref().filter(|uuid| *uuid != found) {
                return Err(conflict(uuid));
            }
            if let Some(other) = owner_of_found.as_ref().filter(|other| *other != path) {
                return Err(VhdError::IdentityConflict(format!(
                    "{mount_point} holds the filesystem of {other}, not {path}"
                )));
            }
            let confirmed = tracked.is_some()
                || owner_of_found.is_some()
                || selector.uuid.is_some()
                || selector.device_name.is_some();
            if !confirmed {
                // Nothing ties this path to the mounted filesystem yet; the
                // mount has to attach it and compare UUIDs.
                tracing::debug!(path = %path, found = %found, "mount point holds an unidentified filesystem");
                return Ok(ResolvedIdentity {
                    path: Some(path.clone()),
                    ..Default::default()
                });
            }
        }

        let device_name = self.devices.device_of(&found)?;
        Ok(ResolvedIdentity {
            path: selector.path.clone().or(owner_of_found),
            uuid: Some(found),
            attached: device_name.is_some(),
            device_name,
            mount_point: Some(mount_point.to_string()),
        })
    }
}
