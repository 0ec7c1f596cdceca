use crate::VhdManager;
use serde::Serialize;
use vhdm_core::{Result, VhdError, VhdSelector};
use vhdm_safety::{can_format_device, validate_fs_type, validate_selector, SafetyContext, SafetyDecision};

#[derive(Debug, Clone, Default)]
pub struct FormatRequest {
    pub selector: VhdSelector,
    /// Falls back to the configured default filesystem.
    pub fs_type: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatReport {
    pub path: Option<String>,
    pub device_name: String,
    pub fs_type: String,
    pub uuid: String,
    pub previous_uuid: Option<String>,
    pub warnings: Vec<String>,
}

impl VhdManager<'_> {
    /// Creates a filesystem on an attached (or attachable) VHD and starts a
    /// fresh tracking record for it. This is the only operation allowed to
    /// change the UUID recorded for a path.
    pub fn format(&self, request: &FormatRequest) -> Result<FormatReport> {
        let selector = validate_selector(&request.selector)?;
        let fs_type = validate_fs_type(
            request
                .fs_type
                .as_deref()
                .unwrap_or(&self.settings.default_fs_type),
        )?;
        let identity = self.resolve(&selector, None)?;

        let device_name = match (&identity.device_name, identity.attached) {
            (Some(device_name), true) => device_name.clone(),
            _ => {
                let path = identity.path.as_deref().ok_or_else(|| VhdError::UuidUnknown {
                    uuid: identity.uuid.clone().unwrap_or_default(),
                })?;
                self.attach_vhd(path, identity.uuid.as_deref())?.0
            }
        };
        let device = self
            .devices
            .snapshot()?
            .into_iter()
            .find(|device| device.name == device_name)
            .ok_or_else(|| VhdError::DeviceNotFound(format!("/dev/{device_name} disappeared")))?;

        let ctx = SafetyContext {
            force_mode: request.force,
        };
        match can_format_device(&ctx, &device) {
            SafetyDecision::Allow => {}
            SafetyDecision::Deny(reason) => return Err(VhdError::Refused(reason)),
        }

        self.devices.format_device(&device_name, &fs_type)?;
        let uuid = self.devices.uuid_of(&device_name)?.ok_or_else(|| {
            VhdError::DeviceQuery(format!(
                "/dev/{device_name} reports no UUID after creating {fs_type}"
            ))
        })?;
        tracing::info!(device = %device_name, fs_type = %fs_type, uuid = %uuid, "formatted");

        let mut warnings = Vec::new();
        if let Some(path) = &identity.path {
            self.record("replacing mapping", &mut warnings, || {
                self.store.replace_mapping(path, &uuid, &device_name)
            });
        }
        Ok(FormatReport {
            path: identity.path,
            device_name,
            fs_type,
            uuid,
            previous_uuid: device.uuid,
            warnings,
        })
    }
}
