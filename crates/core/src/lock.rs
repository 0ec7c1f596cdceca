//! Advisory inter-process file locks.
//!
//! Used to serialize the tracking file's read-modify-write cycle and the
//! attach/diff window between independent `vhdm` processes.

use crate::{Result, VhdError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Holds a `flock(2)` lock until dropped. Blocks while another process holds
/// a conflicting lock.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file (and missing parent directories) when needed,
    /// handing anything it creates to `owner`. An existing lock file is
    /// opened read-only; `flock` does not need write access.
    pub fn acquire(path: &Path, mode: LockMode, owner: Option<(u32, u32)>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            create_dir_all_owned(parent, owner).map_err(|err| {
                VhdError::Tracking(format!("create lock dir {}: {}", parent.display(), err))
            })?;
        }
        let file = open_lock_file(path, owner)
            .map_err(|err| VhdError::Tracking(format!("open lock {}: {}", path.display(), err)))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let operation = match mode {
                LockMode::Shared => libc::LOCK_SH,
                LockMode::Exclusive => libc::LOCK_EX,
            };
            loop {
                let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
                if result == 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(VhdError::Tracking(format!(
                    "lock {}: {}",
                    path.display(),
                    err
                )));
            }
        }

        #[cfg(not(unix))]
        {
            let _ = mode;
            tracing::warn!(lock_path = %path.display(), "advisory locking unsupported on this platform");
        }

        tracing::trace!(lock_path = %path.display(), ?mode, "acquired lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path, owner: Option<(u32, u32)>) -> std::io::Result<File> {
    match File::open(path) {
        Ok(file) => return Ok(file),
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err),
        Err(_) => {}
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    hand_over(path, owner);
    Ok(file)
}

/// `create_dir_all`, with every directory it had to create chowned to
/// `owner`.
pub fn create_dir_all_owned(dir: &Path, owner: Option<(u32, u32)>) -> std::io::Result<()> {
    let missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|ancestor| !ancestor.as_os_str().is_empty() && !ancestor.exists())
        .map(Path::to_path_buf)
        .collect();
    std::fs::create_dir_all(dir)?;
    for created in missing.iter().rev() {
        hand_over(created, owner);
    }
    Ok(())
}

/// Best effort: a failed chown leaves a root-owned file behind, which still
/// works for root.
fn hand_over(path: &Path, owner: Option<(u32, u32)>) {
    #[cfg(unix)]
    {
        if let Some((uid, gid)) = owner {
            if let Err(err) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
                tracing::warn!(path = %path.display(), error = %err, "could not hand over to invoking user");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, owner);
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        tracing::trace!(lock_path = %self.path.display(), "released lock");
    }
}
