//! Advisory file locks serialising check-then-act sequences.
//!
//! `start` holds the application lock across "lookup, build, create" and the
//! disk lock across "exists?, create, chmod". Two concurrent invocations for
//! the same application therefore never build twice or submit a duplicate
//! domain. Locks are released when the guard is dropped (or the process exits).

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{AppvmError, Result};

/// Exclusive lock held for the lifetime of the value.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block (on the blocking pool) until the lock at `path` is ours.
    pub async fn acquire(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|e| AppvmError::io("lock task", std::io::Error::other(e)))?
    }

    fn acquire_blocking(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppvmError::io(format!("create {}", parent.display()), e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| AppvmError::io(format!("open lock {}", path.display()), e))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                info!(lock = %path.display(), "another appvm holds the lock, waiting");
                file.lock()
                    .map_err(|e| AppvmError::io(format!("lock {}", path.display()), e))?;
            }
            Err(TryLockError::Error(e)) => {
                return Err(AppvmError::io(format!("lock {}", path.display()), e));
            }
        }

        debug!(lock = %path.display(), "lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(lock = %self.path.display(), "lock released");
    }
}
