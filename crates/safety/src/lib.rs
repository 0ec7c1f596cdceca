//! Input validation and guards for destructive operations. Everything here
//! runs before any side effect.

use uuid::Uuid;
use vhdm_core::{
    is_dynamic_vhd_device, strip_dev_prefix, BlockDevice, Result, VhdError, VhdSelector,
};

pub const SUPPORTED_FS_TYPES: &[&str] = &["ext4", "ext3", "ext2", "xfs", "btrfs"];

#[derive(Debug, Clone, Default)]
pub struct SafetyContext {
    pub force_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

/// Formatting is only ever allowed on an unmounted dynamic VHD device, and
/// overwriting an existing filesystem needs force mode.
pub fn can_format_device(ctx: &SafetyContext, device: &BlockDevice) -> SafetyDecision {
    if !is_dynamic_vhd_device(&device.name) {
        return SafetyDecision::Deny(format!(
            "Denied: {} is not an attached VHD device",
            device.name
        ));
    }
    if let Some(mount) = device.first_mount_point() {
        return SafetyDecision::Deny(format!(
            "Denied: {} is mounted at {}",
            device.name, mount
        ));
    }
    if let Some(fs) = &device.fs_type {
        if !ctx.force_mode {
            return SafetyDecision::Deny(format!(
                "Denied: {} already holds a {} filesystem; pass --force to overwrite it",
                device.name, fs
            ));
        }
    }
    SafetyDecision::Allow
}

/// Canonical tracking key for a VHD path: drive paths in `C:/dir/file.vhdx`
/// form, anything else untouched.
pub fn normalize_vhd_path(path: &str) -> String {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix("/mnt/") {
        let mut chars = rest.chars();
        if let Some(letter) = chars.next().filter(|c| c.is_ascii_alphabetic()) {
            let tail = chars.as_str();
            if tail.is_empty() || tail.starts_with('/') {
                return format!(
                    "{}:/{}",
                    letter.to_ascii_uppercase(),
                    tail.trim_start_matches('/')
                );
            }
        }
    }
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            format!("{}{}", letter.to_ascii_uppercase(), &path[1..].replace('\\', "/"))
        }
        _ => path.to_string(),
    }
}

pub fn validate_vhd_path(path: &str) -> Result<String> {
    let normalized = normalize_vhd_path(path);
    if normalized.is_empty() {
        return Err(VhdError::InvalidInput("VHD path is empty".to_string()));
    }
    if normalized.contains('\0') {
        return Err(VhdError::InvalidInput("VHD path contains a NUL byte".to_string()));
    }
    let lower = normalized.to_ascii_lowercase();
    if !(lower.ends_with(".vhdx") || lower.ends_with(".vhd")) {
        return Err(VhdError::InvalidInput(format!(
            "{path} is not a .vhd or .vhdx file"
        )));
    }
    Ok(normalized)
}

pub fn validate_mount_point(path: &str) -> Result<String> {
    let path = path.trim();
    if !path.starts_with('/') {
        return Err(VhdError::InvalidInput(format!(
            "mount point {path:?} must be an absolute path"
        )));
    }
    if path.contains('\0') {
        return Err(VhdError::InvalidInput("mount point contains a NUL byte".to_string()));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(VhdError::InvalidInput(format!(
            "mount point {path} must not contain '..'"
        )));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(VhdError::InvalidInput("refusing to mount over /".to_string()));
    }
    Ok(trimmed.to_string())
}

/// RFC 4122 UUIDs (ext4, xfs, btrfs) plus the short serials FAT
/// (`ABCD-1234`) and NTFS (16 hex digits) report. Returned in the case
/// lsblk prints them: lower for RFC 4122, upper for the serials.
pub fn validate_uuid(uuid: &str) -> Result<String> {
    let uuid = uuid.trim();
    if Uuid::try_parse(uuid).is_ok() && uuid.len() == 36 {
        return Ok(uuid.to_ascii_lowercase());
    }
    let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
    let short_fat = uuid.len() == 9
        && uuid.as_bytes()[4] == b'-'
        && is_hex(&uuid[..4])
        && is_hex(&uuid[5..]);
    let ntfs = uuid.len() == 16 && is_hex(uuid);
    if short_fat || ntfs {
        return Ok(uuid.to_ascii_uppercase());
    }
    Err(VhdError::InvalidInput(format!("{uuid:?} is not a filesystem UUID")))
}

pub fn validate_device_name(name: &str) -> Result<String> {
    let name = strip_dev_prefix(name.trim());
    let valid = name
        .strip_prefix("sd")
        .map(|suffix| {
            (1..=2).contains(&suffix.len()) && suffix.chars().all(|c| c.is_ascii_lowercase())
        })
        .unwrap_or(false);
    if valid {
        Ok(name.to_string())
    } else {
        Err(VhdError::InvalidInput(format!("{name:?} is not a block device name")))
    }
}

pub fn validate_fs_type(fs_type: &str) -> Result<String> {
    let fs_type = fs_type.trim().to_ascii_lowercase();
    if SUPPORTED_FS_TYPES.contains(&fs_type.as_str()) {
        Ok(fs_type)
    } else {
        Err(VhdError::InvalidInput(format!(
            "unsupported filesystem {fs_type:?}, expected one of {}",
            SUPPORTED_FS_TYPES.join(", ")
        )))
    }
}

/// Checks every field that is present and returns the selector in canonical
/// form (drive-letter path, bare device name).
pub fn validate_selector(selector: &VhdSelector) -> Result<VhdSelector> {
    if selector.is_empty() {
        return Err(VhdError::InvalidInput(
            "supply at least one of --vhd-path, --uuid or --dev-name".to_string(),
        ));
    }
    Ok(VhdSelector {
        path: selector.path.as_deref().map(validate_vhd_path).transpose()?,
        uuid: selector.uuid.as_deref().map(validate_uuid).transpose()?,
        device_name: selector
            .device_name
            .as_deref()
            .map(validate_device_name)
            .transpose()?,
    })
}
