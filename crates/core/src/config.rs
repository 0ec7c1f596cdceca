use crate::{Result, VhdError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "vhdm";
const TRACKING_FILE_NAME: &str = "vhd_mapping.json";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking_file: PathBuf,
    pub history_limit: usize,
    pub settle_timeout_secs: u64,
    pub settle_poll_ms: u64,
    pub detach_timeout_secs: u64,
    pub wsl_exe: PathBuf,
    pub default_fs_type: String,
    pub store_locking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracking_file: app_dir(&invoking_user()).join(TRACKING_FILE_NAME),
            history_limit: 50,
            settle_timeout_secs: 10,
            settle_poll_ms: 250,
            detach_timeout_secs: 30,
            wsl_exe: PathBuf::from("/mnt/c/Windows/System32/wsl.exe"),
            default_fs_type: "ext4".to_string(),
            store_locking: true,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file (explicit path or the per-user default),
    /// then `VHDM_*` environment variables.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(VhdError::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                Some(path.to_path_buf())
            }
            None => {
                let default = app_dir(&invoking_user()).join(CONFIG_FILE_NAME);
                default.is_file().then_some(default)
            }
        };

        let mut config = match path {
            Some(path) => {
                let data = std::fs::read_to_string(&path)
                    .map_err(|err| VhdError::Config(format!("read {}: {}", path.display(), err)))?;
                let config = Self::from_toml(&data)
                    .map_err(|err| VhdError::Config(format!("{}: {}", path.display(), err)))?;
                tracing::debug!(config_path = %path.display(), "loaded config file");
                config
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(data: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(data)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("VHDM_TRACKING_FILE") {
            self.tracking_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("VHDM_HISTORY_LIMIT") {
            self.history_limit = parse_env("VHDM_HISTORY_LIMIT", &value)?;
        }
        if let Some(value) = lookup("VHDM_SETTLE_TIMEOUT") {
            self.settle_timeout_secs = parse_env("VHDM_SETTLE_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("VHDM_DETACH_TIMEOUT") {
            self.detach_timeout_secs = parse_env("VHDM_DETACH_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("VHDM_WSL_EXE") {
            self.wsl_exe = PathBuf::from(value);
        }
        if let Some(value) = lookup("VHDM_STORE_LOCKING") {
            self.store_locking = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn settle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms.max(1))
    }

    pub fn detach_timeout(&self) -> Duration {
        Duration::from_secs(self.detach_timeout_secs)
    }

    /// Directory holding the tracking file and the lock files next to it.
    pub fn state_dir(&self) -> PathBuf {
        self.tracking_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| VhdError::Config(format!("{key}={value:?} is not a valid number")))
}

fn app_dir(user: &InvokingUser) -> PathBuf {
    app_dir_with(user, dirs::config_dir())
}

/// `$XDG_CONFIG_HOME/vhdm` for a plain run. Under sudo the environment
/// belongs to root, so the invoking user's `~/.config/vhdm` is used.
fn app_dir_with(user: &InvokingUser, config_dir: Option<PathBuf>) -> PathBuf {
    let base = match (user.owner().is_some(), config_dir) {
        (false, Some(config_dir)) => config_dir,
        _ => user
            .home
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config"),
    };
    base.join(APP_DIR)
}

/// The human user behind this process, looking through `sudo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokingUser {
    pub name: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub home: Option<PathBuf>,
}

impl InvokingUser {
    pub fn owner(&self) -> Option<(u32, u32)> {
        Some((self.uid?, self.gid?))
    }
}

pub fn invoking_user() -> InvokingUser {
    let sudo_user = std::env::var("SUDO_USER")
        .ok()
        .filter(|name| !name.is_empty() && name != "root");
    match sudo_user {
        Some(name) => InvokingUser {
            home: home_of(&name).or_else(dirs::home_dir),
            uid: std::env::var("SUDO_UID").ok().and_then(|v| v.parse().ok()),
            gid: std::env::var("SUDO_GID").ok().and_then(|v| v.parse().ok()),
            name: Some(name),
        },
        None => InvokingUser {
            name: std::env::var("USER").ok(),
            uid: None,
            gid: None,
            home: dirs::home_dir(),
        },
    }
}

#[cfg(unix)]
fn home_of(user: &str) -> Option<PathBuf> {
    use std::ffi::{CStr, CString};

    let name = CString::new(user).ok()?;
    let entry = unsafe { libc::getpwnam(name.as_ptr()) };
    if entry.is_null() {
        return None;
    }
    let dir = unsafe { (*entry).pw_dir };
    if dir.is_null() {
        return None;
    }
    let dir = unsafe { CStr::from_ptr(dir) };
    Some(PathBuf::from(dir.to_string_lossy().into_owned()))
}

#[cfg(not(unix))]
fn home_of(_user: &str) -> Option<PathBuf> {
    None
}
