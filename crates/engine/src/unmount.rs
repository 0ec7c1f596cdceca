use crate::VhdManager;
use serde::Serialize;
use std::path::Path;
use vhdm_core::{normalize_mount_point, DetachOutcome, Result, VhdError, VhdSelector};
use vhdm_safety::{validate_mount_point, validate_selector};
use vhdm_tracking::detach_entry;

#[derive(Debug, Clone, Default)]
pub struct UnmountRequest {
    pub selector: VhdSelector,
    pub mount_point: Option<String>,
    /// Also detach the VHD from the guest after unmounting.
    pub detach: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnmountReport {
    pub path: Option<String>,
    pub uuid: Option<String>,
    pub device_name: Option<String>,
    /// The mount point that was released, if anything was mounted.
    pub unmounted_from: Option<String>,
    pub detach: Option<DetachOutcome>,
    pub warnings: Vec<String>,
}

impl VhdManager<'_> {
    pub fn unmount(&self, request: &UnmountRequest) -> Result<UnmountReport> {
        let mount_point = request
            .mount_point
            .as_deref()
            .map(validate_mount_point)
            .transpose()?;

        let identity = if request.selector.is_empty() {
            let Some(mount_point) = &mount_point else {
                return Err(VhdError::InvalidInput(
                    "supply --mount-point or one of --vhd-path, --uuid, --dev-name".to_string(),
                ));
            };
            match self.devices.uuid_at_mount_point(mount_point)? {
                Some(uuid) => self.resolve(&VhdSelector::by_uuid(uuid), Some(mount_point))?,
                None => {
                    tracing::info!(mount_point = %mount_point, "nothing mounted");
                    return Ok(UnmountReport::default());
                }
            }
        } else {
            self.resolve(&validate_selector(&request.selector)?, mount_point.as_deref())?
        };

        let target = match (&mount_point, &identity.mount_point) {
            (Some(requested), Some(current)) if normalize_mount_point(current) != requested.as_str() => {
                return Err(VhdError::IdentityConflict(format!(
                    "filesystem {} is mounted at {current}, not {requested}",
                    identity.uuid.as_deref().unwrap_or_default()
                )));
            }
            (_, current) => current.clone(),
        };
        if request.detach && identity.path.is_none() {
            return Err(VhdError::UuidUnknown {
                uuid: identity.uuid.clone().unwrap_or_default(),
            });
        }

        let mut warnings = Vec::new();
        if let Some(target) = &target {
            self.devices.unmount(Path::new(target))?;
            tracing::info!(mount_point = %target, "unmounted");
            if let Some(path) = &identity.path {
                self.record("clearing mount point", &mut warnings, || {
                    self.store.clear_mount_point(path)
                });
            }
        } else {
            tracing::info!(?identity, "filesystem is not mounted");
        }

        let detach = match (&identity.path, request.detach) {
            (Some(path), true) => {
                let outcome = self.attacher.detach(path, self.settings.detach_timeout)?;
                if outcome == DetachOutcome::Detached {
                    let entry = detach_entry(
                        path,
                        identity.uuid.as_deref().unwrap_or_default(),
                        identity.device_name.as_deref().unwrap_or_default(),
                    );
                    self.record("saving detach history", &mut warnings, || {
                        self.store.save_detach_history(entry)
                    });
                }
                Some(outcome)
            }
            _ => None,
        };

        Ok(UnmountReport {
            path: identity.path,
            uuid: identity.uuid,
            device_name: identity.device_name,
            unmounted_from: target,
            detach,
            warnings,
        })
    }

    /// Unmount if needed, then detach.
    pub fn detach(&self, selector: &VhdSelector) -> Result<UnmountReport> {
        self.unmount(&UnmountRequest {
            selector: selector.clone(),
            mount_point: None,
            detach: true,
        })
    }
}
