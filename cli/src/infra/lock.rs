//! Advisory file locks (`fs2`) implementing the `PathLocker` and `MountGate`
//! ports.
//!
//! Locks live under `<state_dir>/locks/`. A lock is released when its guard
//! (the open file) is dropped, including when the process dies.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::application::ports::{MountGate, PathLocker};
use crate::domain::error::PackError;
use crate::domain::layout::ledger_key;

const MOUNT_LOCK: &str = "mount.lock";

/// Held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lock manager rooted at `<state_dir>/locks`.
#[derive(Debug, Clone)]
pub struct FileLocker {
    root: PathBuf,
}

impl FileLocker {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("locks"),
        }
    }

    fn open(&self, name: &str) -> Result<(File, PathBuf)> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating lock directory {}", self.root.display()))?;
        let path = self.root.join(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        Ok((file, path))
    }
}

impl PathLocker for FileLocker {
    type Guard = LockGuard;

    fn try_lock(&self, logical: &Path) -> Result<LockGuard> {
        let (file, path) = self.open(&format!("{}.lock", ledger_key(logical)))?;
        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %logical.display(), lock = %path.display(), "path lock acquired");
                Ok(LockGuard { _file: file, path })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(PackError::Busy {
                path: logical.to_path_buf(),
            }
            .into()),
            Err(e) => Err(e).with_context(|| format!("locking {}", path.display())),
        }
    }
}

impl MountGate for FileLocker {
    type Guard = LockGuard;

    async fn enter(&self) -> Result<LockGuard> {
        let (file, path) = self.open(MOUNT_LOCK)?;
        tokio::task::spawn_blocking(move || {
            fs2::FileExt::lock_exclusive(&file)
                .with_context(|| format!("locking {}", path.display()))?;
            Ok(LockGuard { _file: file, path })
        })
        .await
        .context("mount lock task panicked")?
    }
}
