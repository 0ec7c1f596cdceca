use serde::Deserialize;
use vhdm_core::{BlockDevice, Result, VhdError};

pub(crate) const COLUMNS: &str = "NAME,UUID,FSTYPE,MOUNTPOINTS,SIZE,FSUSED,FSUSE%";
/// util-linux before 2.37 only knows the singular column.
pub(crate) const LEGACY_COLUMNS: &str = "NAME,UUID,FSTYPE,MOUNTPOINT,SIZE,FSUSED,FSUSE%";

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    size: Option<Numeric>,
    #[serde(default)]
    fsused: Option<Numeric>,
    #[serde(default, rename = "fsuse%")]
    fsuse_percent: Option<String>,
}

/// lsblk prints sizes as JSON numbers on recent releases and as strings on
/// older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(u64),
    Text(String),
}

impl Numeric {
    fn value(&self) -> Option<u64> {
        match self {
            Numeric::Number(value) => Some(*value),
            Numeric::Text(text) => text.trim().parse().ok(),
        }
    }
}

pub(crate) fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let report: LsblkReport = serde_json::from_str(json)
        .map_err(|err| VhdError::DeviceQuery(format!("malformed lsblk output: {err}")))?;
    Ok(report
        .blockdevices
        .into_iter()
        .map(|device| {
            let mut mount_points: Vec<String> = device
                .mountpoints
                .into_iter()
                .flatten()
                .filter(|mount| !mount.is_empty())
                .collect();
            if let Some(mount) = device.mountpoint.filter(|mount| !mount.is_empty()) {
                if !mount_points.contains(&mount) {
                    mount_points.push(mount);
                }
            }
            BlockDevice {
                name: device.name,
                uuid: device.uuid.filter(|uuid| !uuid.is_empty()),
                fs_type: device.fstype.filter(|fs| !fs.is_empty()),
                mount_points,
                size_bytes: device.size.as_ref().and_then(Numeric::value).unwrap_or(0),
                fs_used_bytes: device.fsused.as_ref().and_then(Numeric::value),
                fs_use_percent: device.fsuse_percent,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_current_lsblk_json() {
        let json = r#"{
   "blockdevices": [
      {"name":"sda", "uuid":null, "fstype":null, "mountpoints":[null], "size":402620416, "fsused":null, "fsuse%":null},
      {"name":"sdc", "uuid":"0d5a0b8e-2f6c-4f5e-9a40-6f0d3b1d2c11", "fstype":"ext4", "mountpoints":["/mnt/wslg/distro", "/"], "size":1099511627776, "fsused":21474836480, "fsuse%":"2%"},
      {"name":"sde", "uuid":"", "fstype":null, "mountpoints":[null], "size":104857600, "fsused":null, "fsuse%":null}
   ]
}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices.len(), 3);
        assert!(devices[0].mount_points.is_empty());
        assert_eq!(devices[1].mount_points, vec!["/mnt/wslg/distro", "/"]);
        assert_eq!(devices[1].fs_used_bytes, Some(21474836480));
        assert_eq!(devices[1].fs_use_percent.as_deref(), Some("2%"));
        assert_eq!(devices[2].uuid, None);
        assert_eq!(devices[2].size_bytes, 104857600);
    }

    #[test]
    fn parses_legacy_string_sizes_and_single_mountpoint() {
        let json = r#"{"blockdevices": [
            {"name":"sdd", "uuid":"abcd-1234", "fstype":"vfat", "mountpoint":"/mnt/usb", "size":"2147483648", "fsused":"1024", "fsuse%":"1%"}
        ]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices[0].mount_points, vec!["/mnt/usb"]);
        assert_eq!(devices[0].size_bytes, 2147483648);
        assert_eq!(devices[0].fs_used_bytes, Some(1024));
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(matches!(
            parse_lsblk("lsblk: command not found"),
            Err(VhdError::DeviceQuery(_))
        ));
        assert!(matches!(parse_lsblk(r#"{"devices": []}"#), Err(VhdError::DeviceQuery(_))));
    }
}
