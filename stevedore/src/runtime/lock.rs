//! Store lock preventing concurrent builds against one home directory.
//!
//! Uses `flock` so the lock disappears with the process, even on crash.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use stevedore_shared::{BuildError, StevedoreError, StevedoreResult};

/// Exclusive lock on a stevedore home directory, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    #[allow(dead_code)] // Held for lifetime, not directly accessed
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock without blocking.
    ///
    /// Fails with [`BuildError::Locked`] when another holder exists.
    pub fn acquire(home_dir: &Path) -> StevedoreResult<Self> {
        std::fs::create_dir_all(home_dir)
            .map_err(|e| StevedoreError::Storage(format!("failed to create home dir: {e}")))?;

        let lock_path = home_dir.join(".lock");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StevedoreError::Storage(format!("failed to open lock file: {e}")))?;

        {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(BuildError::Locked(home_dir.display().to_string()).into());
                }
                return Err(StevedoreError::Storage(format!(
                    "failed to acquire lock: {err}"
                )));
            }
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired store lock");

        Ok(StoreLock {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = self.file.as_raw_fd();
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }

        tracing::debug!(lock_path = %self.path.display(), "Released store lock");
    }
}
