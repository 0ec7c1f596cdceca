use std::collections::HashMap;
use std::path::Path;

/// Mount points per `/dev/*` device name, in mount table order.
pub(crate) fn read_mounts(path: &Path) -> HashMap<String, Vec<String>> {
    let data = std::fs::read_to_string(path).unwrap_or_default();
    parse_mounts(&data)
}

pub(crate) fn parse_mounts(data: &str) -> HashMap<String, Vec<String>> {
    let mut mounts: HashMap<String, Vec<String>> = HashMap::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let device = match parts.next() {
            Some(value) => value,
            None => continue,
        };
        let mount_point = match parts.next() {
            Some(value) => unescape_mount(value),
            None => continue,
        };
        let Some(name) = device.strip_prefix("/dev/") else {
            continue;
        };
        if name.is_empty() || name.contains('/') {
            continue;
        }
        let entry = mounts.entry(name.to_string()).or_default();
        if !entry.contains(&mount_point) {
            entry.push(mount_point);
        }
    }
    mounts
}

/// Undoes the octal escapes (`\040` for space, ...) used in the mount table.
fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut octal = String::new();
        while octal.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    octal.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&octal, 8) {
            Ok(byte) if octal.len() == 3 => output.push(byte as char),
            _ => {
                output.push('\\');
                output.push_str(&octal);
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_dev_mounts_only() {
        let table = "\
/dev/sdc / ext4 rw,relatime 0 0
none /mnt/wsl tmpfs rw 0 0
/dev/sde /mnt/my\\040data ext4 rw 0 0
/dev/sde /srv/data ext4 rw 0 0
/dev/mapper/vg-lv /mnt/lv ext4 rw 0 0
";
        let mounts = parse_mounts(table);
        assert_eq!(mounts.get("sdc").unwrap(), &vec!["/".to_string()]);
        assert_eq!(
            mounts.get("sde").unwrap(),
            &vec!["/mnt/my data".to_string(), "/srv/data".to_string()]
        );
        assert!(!mounts.contains_key("mapper/vg-lv"));
        assert_eq!(mounts.len(), 2);
    }

    #[test]
    fn keeps_invalid_escapes_verbatim() {
        assert_eq!(unescape_mount("/mnt/a\\9b"), "/mnt/a\\9b");
        assert_eq!(unescape_mount("/mnt/tab\\011x"), "/mnt/tab\tx");
    }
}
