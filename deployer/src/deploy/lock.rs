//! Orchestrator-layer advisory file lock
//!
//! One lock file per container name under the lock directory. The lock is
//! an `flock`-style exclusive lock held for the lifetime of [`DeployLock`],
//! so it also protects deploys started by hand outside the watcher.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::errors::DeployError;

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct DeployLock {
    file: File,
    path: PathBuf,
}

impl DeployLock {
    /// Take the lock for `key` without waiting. `Ok(None)` means another
    /// process or attempt holds it.
    pub fn try_acquire(dir: &Path, key: &str) -> Result<Option<Self>, DeployError> {
        loop {
            let (file, path) = open_lock_file(dir, key)?;
            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if is_contended(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            if is_current(&file, &path)? {
                debug!("Acquired deploy lock {}", path.display());
                return Ok(Some(Self { file, path }));
            }
            debug!("Lock file {} was removed, reopening", path.display());
        }
    }

    /// Take the lock for `key`, waiting on the blocking pool until it is free.
    pub async fn acquire(dir: &Path, key: &str) -> Result<Self, DeployError> {
        loop {
            let (file, path) = open_lock_file(dir, key)?;
            let file = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|_| file))
                .await
                .map_err(|e| DeployError::Internal(format!("lock task failed: {}", e)))??;
            if is_current(&file, &path)? {
                debug!("Acquired deploy lock {}", path.display());
                return Ok(Self { file, path });
            }
            debug!("Lock file {} was removed, reopening", path.display());
        }
    }

    /// Delete the lock file, then release the lock. Anyone blocked on the
    /// deleted file reopens a fresh one.
    pub fn remove(self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed deploy lock {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove deploy lock {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release deploy lock {}: {}", self.path.display(), e);
        }
    }
}

/// Whether `file` is still the lock file at `path`.
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn is_current(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

fn open_lock_file(dir: &Path, key: &str) -> Result<(File, PathBuf), DeployError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.lock", key));
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    Ok((file, path))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
