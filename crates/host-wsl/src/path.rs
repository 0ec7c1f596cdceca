/// Converts a VHD path as accepted on the Linux side into the form
/// `wsl.exe` expects on the Windows host.
///
/// `/mnt/c/VMs/data.vhdx`, `C:/VMs/data.vhdx` and `C:\VMs\data.vhdx` all
/// become `C:\VMs\data.vhdx`.
pub fn to_windows_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/mnt/") {
        let mut chars = rest.chars();
        if let Some(letter) = chars.next().filter(|c| c.is_ascii_alphabetic()) {
            let tail = chars.as_str();
            if tail.is_empty() || tail.starts_with('/') {
                let tail = tail.trim_start_matches('/').replace('/', "\\");
                return format!("{}:\\{}", letter.to_ascii_uppercase(), tail);
            }
        }
    }
    let converted = path.replace('/', "\\");
    let mut chars = converted.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            format!("{}{}", letter.to_ascii_uppercase(), &converted[1..])
        }
        _ => converted,
    }
}
