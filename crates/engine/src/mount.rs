use crate::attach::AttachAction;
use crate::VhdManager;
use serde::Serialize;
use std::path::Path;
use vhdm_core::{Result, VhdError, VhdSelector};

#[derive(Debug, Clone)]
pub struct MountRequest {
    pub selector: VhdSelector,
    pub mount_point: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountAction {
    Mounted,
    AttachedAndMounted,
    AlreadyMounted,
}

impl MountAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountAction::Mounted => "mount",
            MountAction::AttachedAndMounted => "attach+mount",
            MountAction::AlreadyMounted => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountReport {
    pub path: Option<String>,
    pub uuid: String,
    pub device_name: String,
    pub mount_point: String,
    pub action: MountAction,
    pub warnings: Vec<String>,
}

impl VhdManager<'_> {
    /// Brings a VHD to "mounted at `mount_point`", attaching it first if
    /// needed. Safe to repeat; never moves a filesystem that is mounted
    /// somewhere else.
    pub fn mount(&self, request: &MountRequest) -> Result<MountReport> {
        let selector = vhdm_safety::validate_selector(&request.selector)?;
        let mount_point = vhdm_safety::validate_mount_point(&request.mount_point)?;
        let identity = self.resolve(&selector, Some(&mount_point))?;

        let mut attached_now = false;
        let (device_name, uuid) = match (&identity.device_name, identity.attached) {
            (Some(device_name), true) => (device_name.clone(), identity.uuid.clone()),
            _ => {
                let path = identity.path.as_deref().ok_or_else(|| VhdError::UuidUnknown {
                    uuid: identity.uuid.clone().unwrap_or_default(),
                })?;
                let (device_name, uuid, action) =
                    self.attach_vhd(path, identity.uuid.as_deref())?;
                if let (Some(expected), Some(found)) = (&identity.uuid, &uuid) {
                    if expected != found {
                        return Err(VhdError::IdentityConflict(format!(
                            "{path} attached as /dev/{device_name} with filesystem {found}, \
                             but it is tracked as {expected}"
                        )));
                    }
                }
                attached_now = action == AttachAction::Attached;
                (device_name, uuid)
            }
        };
        let uuid = uuid.ok_or_else(|| VhdError::not_formatted(&device_name))?;

        let current = self
            .devices
            .snapshot()?
            .into_iter()
            .find(|device| device.uuid.as_deref() == Some(uuid.as_str()));
        let mut warnings = Vec::new();
        let action = match current {
            Some(device) if device.is_mounted_at(&mount_point) => {
                tracing::info!(uuid = %uuid, mount_point = %mount_point, "already mounted");
                MountAction::AlreadyMounted
            }
            Some(device) if device.first_mount_point().is_some() => {
                return Err(VhdError::AlreadyMounted {
                    uuid,
                    mounted_at: device.first_mount_point().unwrap_or_default().to_string(),
                    requested: mount_point,
                });
            }
            _ => {
                if let Some(occupant) = self.devices.uuid_at_mount_point(&mount_point)? {
                    return Err(VhdError::MountPointConflict {
                        mount_point,
                        found: occupant,
                        expected: uuid,
                    });
                }
                let target = Path::new(&mount_point);
                self.devices.create_mount_point(target)?;
                self.devices.mount_by_uuid(&uuid, target)?;
                if let Err(err) = self.devices.adjust_ownership(target, self.settings.owner) {
                    tracing::warn!(error = %err, mount_point = %mount_point, "could not adjust ownership");
                    warnings.push(format!("adjusting ownership of {mount_point} failed: {err}"));
                }
                tracing::info!(uuid = %uuid, device = %device_name, mount_point = %mount_point, "mounted");
                if attached_now {
                    MountAction::AttachedAndMounted
                } else {
                    MountAction::Mounted
                }
            }
        };

        if let Some(path) = &identity.path {
            self.record("saving mapping", &mut warnings, || {
                self.store.save_mapping(path, &uuid, &mount_point, &device_name)
            });
        } else {
            tracing::debug!(uuid = %uuid, "no VHD path known, nothing to track");
        }

        Ok(MountReport {
            path: identity.path,
            uuid,
            device_name,
            mount_point,
            action,
            warnings,
        })
    }
}
