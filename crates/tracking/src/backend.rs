use std::io::Write;
use std::path::{Path, PathBuf};
use vhdm_core::{create_dir_all_owned, FileLock, LockMode, Result, TrackingFile, VhdError};

/// Storage for the tracking file. Every call goes to disk; nothing decoded
/// is kept between calls.
pub trait TrackingBackend: Send + Sync {
    fn path(&self) -> &Path;
    fn load(&self) -> Result<TrackingFile>;
    fn update(&self, mutate: &mut dyn FnMut(&mut TrackingFile) -> Result<()>) -> Result<()>;
}

/// Load, mutate, rename over. Readers never see a partial file, but two
/// writers racing can lose one of the updates.
#[derive(Debug, Clone)]
pub struct DirectFile {
    path: PathBuf,
    owner: Option<(u32, u32)>,
}

impl DirectFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: Option<(u32, u32)>) -> Self {
        self.owner = owner;
        self
    }
}

impl TrackingBackend for DirectFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TrackingFile> {
        read_tracking_file(&self.path)
    }

    fn update(&self, mutate: &mut dyn FnMut(&mut TrackingFile) -> Result<()>) -> Result<()> {
        let mut file = read_tracking_file(&self.path)?;
        mutate(&mut file)?;
        write_atomic(&self.path, &file, self.owner)
    }
}

/// Same on-disk contract as [`DirectFile`], with the read-modify-write cycle
/// held under an exclusive `flock` on `<file>.lock`.
#[derive(Debug, Clone)]
pub struct LockedFile {
    inner: DirectFile,
    lock_path: PathBuf,
}

impl LockedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let inner = DirectFile::new(path);
        let mut lock_name = inner
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "tracking".into());
        lock_name.push(".lock");
        let lock_path = inner.path.with_file_name(lock_name);
        Self { inner, lock_path }
    }

    pub fn with_owner(mut self, owner: Option<(u32, u32)>) -> Self {
        self.inner = self.inner.with_owner(owner);
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl TrackingBackend for LockedFile {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn load(&self) -> Result<TrackingFile> {
        let _guard = FileLock::acquire(&self.lock_path, LockMode::Shared, self.inner.owner)?;
        self.inner.load()
    }

    fn update(&self, mutate: &mut dyn FnMut(&mut TrackingFile) -> Result<()>) -> Result<()> {
        let _guard = FileLock::acquire(&self.lock_path, LockMode::Exclusive, self.inner.owner)?;
        self.inner.update(mutate)
    }
}

/// A missing or empty file reads as an empty structure.
pub fn read_tracking_file(path: &Path) -> Result<TrackingFile> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TrackingFile::default());
        }
        Err(err) => {
            return Err(VhdError::Tracking(format!("read {}: {}", path.display(), err)));
        }
    };
    if data.trim().is_empty() {
        return Ok(TrackingFile::default());
    }
    serde_json::from_str(&data)
        .map_err(|err| VhdError::Tracking(format!("decode {}: {}", path.display(), err)))
}

/// Writes the whole file to a temporary sibling and renames it into place.
pub fn write_atomic(path: &Path, file: &TrackingFile, owner: Option<(u32, u32)>) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    create_dir_all_owned(&dir, owner)
        .map_err(|err| VhdError::Tracking(format!("create {}: {}", dir.display(), err)))?;

    let data = serde_json::to_vec_pretty(file)
        .map_err(|err| VhdError::Tracking(format!("encode tracking file: {err}")))?;
    let mut temp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|err| VhdError::Tracking(format!("temp file in {}: {}", dir.display(), err)))?;
    write_contents(&mut temp, &data)
        .map_err(|err| VhdError::Tracking(format!("write temp file: {err}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = temp
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644));
        if let Some((uid, gid)) = owner {
            if let Err(err) = std::os::unix::fs::fchown(temp.as_file(), Some(uid), Some(gid)) {
                tracing::warn!(error = %err, "could not hand tracking file to invoking user");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = owner;

    temp.persist(path)
        .map_err(|err| VhdError::Tracking(format!("replace {}: {}", path.display(), err.error)))?;
    tracing::trace!(path = %path.display(), "tracking file written");
    Ok(())
}

fn write_contents(temp: &mut tempfile::NamedTempFile, data: &[u8]) -> std::io::Result<()> {
    temp.write_all(data)?;
    temp.write_all(b"\n")?;
    temp.as_file().sync_all()
}
