use crate::VhdManager;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use vhdm_core::{
    is_dynamic_vhd_device, AttachOutcome, FileLock, LockMode, Result, VhdError, VhdSelector,
};

const ATTACH_LOCK: &str = "attach.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachAction {
    Attached,
    AlreadyAttached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachReport {
    pub path: Option<String>,
    pub uuid: Option<String>,
    pub device_name: String,
    pub action: AttachAction,
    pub warnings: Vec<String>,
}

/// Dynamic VHD devices present in `after` but not in `before`.
pub fn new_devices(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<String> {
    after
        .difference(before)
        .filter(|name| is_dynamic_vhd_device(name))
        .cloned()
        .collect()
}

/// The single device that appeared between two snapshots.
pub fn detect_new_device(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Result<String> {
    let mut candidates = new_devices(before, after);
    match candidates.len() {
        0 => Err(VhdError::DeviceNotFound(
            "no new block device appeared after attaching".to_string(),
        )),
        1 => Ok(candidates.remove(0)),
        _ => Err(VhdError::AmbiguousDevice { candidates }),
    }
}

impl VhdManager<'_> {
    /// Attaches `path` and works out which device it became. The whole
    /// snapshot/attach/diff window runs under `attach.lock` so concurrent
    /// attaches never see each other's devices.
    pub(crate) fn attach_vhd(
        &self,
        path: &str,
        expected_uuid: Option<&str>,
    ) -> Result<(String, Option<String>, AttachAction)> {
        let _guard = FileLock::acquire(
            &self.settings.lock_dir.join(ATTACH_LOCK),
            LockMode::Exclusive,
            self.settings.owner,
        )?;
        let before = self.devices.dynamic_vhd_names()?;
        match self.attacher.attach(path)? {
            AttachOutcome::Attached => {
                let device_name = self.wait_for_new_device(&before, expected_uuid)?;
                let uuid = self.devices.uuid_of(&device_name)?;
                tracing::info!(path, device = %device_name, ?uuid, "VHD attached");
                Ok((device_name, uuid, AttachAction::Attached))
            }
            AttachOutcome::AlreadyAttached => {
                let (device_name, uuid) = self.locate_already_attached(path, expected_uuid)?;
                Ok((device_name, uuid, AttachAction::AlreadyAttached))
            }
        }
    }

    /// Polls the dynamic device set until a new name shows up or the settle
    /// timeout runs out.
    fn wait_for_new_device(
        &self,
        before: &BTreeSet<String>,
        expected_uuid: Option<&str>,
    ) -> Result<String> {
        let start = Instant::now();
        loop {
            let after = self.devices.dynamic_vhd_names()?;
            let candidates = new_devices(before, &after);
            match candidates.len() {
                0 => {}
                1 => return detect_new_device(before, &after),
                _ => return self.pick_expected(candidates, expected_uuid),
            }
            if start.elapsed() >= self.settings.settle_timeout {
                return Err(VhdError::DeviceNotFound(format!(
                    "no new block device appeared within {}ms after attaching",
                    self.settings.settle_timeout.as_millis()
                )));
            }
            std::thread::sleep(self.settings.settle_poll);
        }
    }

    fn pick_expected(&self, candidates: Vec<String>, expected_uuid: Option<&str>) -> Result<String> {
        if let Some(expected) = expected_uuid {
            for candidate in &candidates {
                if self.devices.uuid_of(candidate)?.as_deref() == Some(expected) {
                    return Ok(candidate.clone());
                }
            }
        }
        Err(VhdError::AmbiguousDevice { candidates })
    }

    /// The host said the VHD was attached already and gave no device name.
    /// Try the expected UUID, then the only dynamic device if there is
    /// exactly one.
    fn locate_already_attached(
        &self,
        path: &str,
        expected_uuid: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        if let Some(uuid) = expected_uuid {
            if let Some(device_name) = self.devices.device_of(uuid)? {
                return Ok((device_name, Some(uuid.to_string())));
            }
        }
        if self.devices.count_dynamic_vhds()? == 1 {
            let uuid = self.devices.find_single_dynamic_vhd_uuid()?;
            if let Some(device_name) = self.devices.device_of(&uuid)? {
                tracing::info!(path, device = %device_name, "using the only attached VHD");
                return Ok((device_name, Some(uuid)));
            }
        }
        Err(VhdError::AlreadyAttached {
            path: path.to_string(),
        })
    }

    /// Attach without mounting.
    pub fn attach(&self, selector: &VhdSelector) -> Result<AttachReport> {
        let selector = vhdm_safety::validate_selector(selector)?;
        let identity = self.resolve(&selector, None)?;
        if identity.attached {
            if let Some(device_name) = identity.device_name {
                return Ok(AttachReport {
                    path: identity.path,
                    uuid: identity.uuid,
                    device_name,
                    action: AttachAction::AlreadyAttached,
                    warnings: Vec::new(),
                });
            }
        }
        let path = identity.path.clone().ok_or_else(|| VhdError::UuidUnknown {
            uuid: identity.uuid.clone().unwrap_or_default(),
        })?;
        let (device_name, uuid, action) = self.attach_vhd(&path, identity.uuid.as_deref())?;
        let mut warnings = Vec::new();
        self.record("saving mapping", &mut warnings, || {
            self.store
                .save_mapping(&path, uuid.as_deref().unwrap_or_default(), "", &device_name)
        });
        if uuid.is_none() {
            warnings.push(VhdError::not_formatted(&device_name).to_string());
        }
        Ok(AttachReport {
            path: Some(path),
            uuid,
            device_name,
            action,
            warnings,
        })
    }
}
