use thiserror::Error;

pub type Result<T> = std::result::Result<T, VhdError>;

#[derive(Debug, Error)]
pub enum VhdError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("device {device} is attached but has no filesystem; run `{hint}`")]
    NotFormatted { device: String, hint: String },

    #[error("VHD {path} is already attached but its device could not be identified")]
    AlreadyAttached { path: String },

    #[error("filesystem {uuid} is already mounted at {mounted_at}, refusing to mount it at {requested}")]
    AlreadyMounted {
        uuid: String,
        mounted_at: String,
        requested: String,
    },

    #[error("mount point {mount_point} already holds filesystem {found}, not {expected}")]
    MountPointConflict {
        mount_point: String,
        found: String,
        expected: String,
    },

    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    #[error("refused: {0}")]
    Refused(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("ambiguous device, candidates: [{}]", .candidates.join(", "))]
    AmbiguousDevice { candidates: Vec<String> },

    #[error("UUID {uuid} is not tracked and not currently attached")]
    UuidUnknown { uuid: String },

    #[error("{tool} failed ({}): {output}", describe_status(.status))]
    ExternalTool {
        tool: String,
        status: Option<i32>,
        output: String,
    },

    #[error("detaching {path} did not finish within {timeout_secs}s")]
    DetachTimeout { path: String, timeout_secs: u64 },

    #[error("device query failed: {0}")]
    DeviceQuery(String),

    #[error("tracking store: {0}")]
    Tracking(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "no exit status".to_string(),
    }
}

impl VhdError {
    pub fn not_formatted(device: &str) -> Self {
        VhdError::NotFormatted {
            device: device.to_string(),
            hint: format!("vhdm format --dev-name {device} --type ext4"),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            VhdError::InvalidInput(_) => "invalid-input",
            VhdError::NotFormatted { .. } => "not-formatted",
            VhdError::AlreadyAttached { .. } => "already-attached",
            VhdError::AlreadyMounted { .. } => "already-mounted",
            VhdError::MountPointConflict { .. } | VhdError::IdentityConflict(_) => "conflict",
            VhdError::Refused(_) => "refused",
            VhdError::DeviceNotFound(_) => "device-not-found",
            VhdError::AmbiguousDevice { .. } => "ambiguous-device",
            VhdError::UuidUnknown { .. } => "uuid-unknown",
            VhdError::ExternalTool { .. } => "external-tool",
            VhdError::DetachTimeout { .. } => "detach-timeout",
            VhdError::DeviceQuery(_) => "device-query",
            VhdError::Tracking(_) => "tracking",
            VhdError::Config(_) => "config",
            VhdError::Io(_) => "io",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            VhdError::InvalidInput(_) | VhdError::Config(_) => 2,
            VhdError::NotFormatted { .. } => 3,
            VhdError::AlreadyAttached { .. }
            | VhdError::AlreadyMounted { .. }
            | VhdError::MountPointConflict { .. }
            | VhdError::IdentityConflict(_)
            | VhdError::Refused(_) => 4,
            VhdError::DeviceNotFound(_) | VhdError::AmbiguousDevice { .. } => 5,
            VhdError::UuidUnknown { .. } => 6,
            VhdError::ExternalTool { .. } | VhdError::DeviceQuery(_) => 7,
            VhdError::DetachTimeout { .. } => 8,
            VhdError::Tracking(_) | VhdError::Io(_) => 1,
        }
    }

    /// Next command to run, when there is an obvious one.
    pub fn hint(&self) -> Option<String> {
        match self {
            VhdError::NotFormatted { hint, .. } => Some(hint.clone()),
            VhdError::UuidUnknown { uuid } => Some(format!(
                "vhdm mount --vhd-path <path-to-vhd> --uuid {uuid} --mount-point <dir>"
            )),
            VhdError::AlreadyMounted { mounted_at, .. } => {
                Some(format!("vhdm umount --mount-point {mounted_at}"))
            }
            VhdError::AlreadyAttached { path } => Some(format!("vhdm status --vhd-path {path}")),
            VhdError::AmbiguousDevice { .. } => {
                Some("vhdm status, then retry with --dev-name <device>".to_string())
            }
            VhdError::DetachTimeout { path, .. } => {
                Some(format!("vhdm status --vhd-path {path}"))
            }
            _ => None,
        }
    }
}
