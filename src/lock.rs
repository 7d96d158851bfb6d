//! Cross-process named locks
//!
//! A lock named `n` is an exclusive advisory lock (`flock`) on
//! `<base_dir>/.n.lock`. The lock is held for the lifetime of the
//! [`LockGuard`] and released on drop, whichever way the holder exits.
//! Lock files are left in place after release; deleting them would let two
//! processes lock different inodes under the same name.

use crate::error::{SpaceError, SpaceResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default bound on lock acquisition
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between acquisition attempts
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file path for `name` under `base_dir`
pub fn lock_path_for(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!(".{}.lock", name))
}

/// A held lock, released on drop
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    name: String,
}

impl LockGuard {
    /// Acquire the lock `name`, waiting at most `timeout`
    ///
    /// Fails with [`SpaceError::Cancelled`] if `cancel` fires before the lock
    /// is obtained, and with [`SpaceError::LockTimeout`] once the bound
    /// elapses. Nothing is modified in either case.
    pub async fn acquire(
        name: &str,
        timeout: Duration,
        base_dir: &Path,
        cancel: &CancellationToken,
    ) -> SpaceResult<Self> {
        if cancel.is_cancelled() {
            return Err(SpaceError::Cancelled);
        }

        let deadline = Instant::now() + timeout;
        let file = open_lock_file(base_dir, name)?;

        loop {
            if try_lock(&file, name)? {
                return Ok(Self::held(file, base_dir, name));
            }

            if Instant::now() >= deadline {
                return Err(SpaceError::LockTimeout {
                    name: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SpaceError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Take the lock only if it is free right now
    pub fn try_acquire(name: &str, base_dir: &Path) -> SpaceResult<Option<Self>> {
        let file = open_lock_file(base_dir, name)?;
        if try_lock(&file, name)? {
            Ok(Some(Self::held(file, base_dir, name)))
        } else {
            Ok(None)
        }
    }

    fn held(mut file: File, base_dir: &Path, name: &str) -> Self {
        // Holder pid for diagnostics only.
        let _ = file.set_len(0);
        let _ = write!(file, "{}", std::process::id());

        let path = lock_path_for(base_dir, name);
        debug!("Acquired lock {}", path.display());
        Self {
            file,
            path,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released lock {}", self.path.display());
    }
}

fn open_lock_file(base_dir: &Path, name: &str) -> SpaceResult<File> {
    fs::create_dir_all(base_dir)
        .map_err(|e| SpaceError::io(format!("creating directory {}", base_dir.display()), e))?;

    let path = lock_path_for(base_dir, name);
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| SpaceError::io(format!("opening lock file {}", path.display()), e))
}

/// `Ok(false)` when another holder has the lock
fn try_lock(file: &File, name: &str) -> SpaceResult<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
        Err(e) => Err(SpaceError::io(format!("locking {}", name), e)),
    }
}
