//! Application service: attach/detach serialization and mount ownership.
//!
//! Attach and detach run inside two critical sections: an in-process mutex
//! (concurrent paths in one invocation) and the host-wide [`MountGate`]
//! (other afpack processes). Copy and compression never hold either.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;

use crate::application::ports::{ImageBackend, MountGate, MountHandle, PathKind, TreeOps};
use crate::domain::error::PackError;

pub struct MountManager<I, G> {
    backend: I,
    gate: G,
    serial: tokio::sync::Mutex<()>,
    owned: Mutex<HashMap<PathBuf, MountHandle>>,
}

impl<I: ImageBackend, G: MountGate> MountManager<I, G> {
    pub fn new(backend: I, gate: G) -> Self {
        Self {
            backend,
            gate,
            serial: tokio::sync::Mutex::new(()),
            owned: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying image backend, for create/delete (which need no
    /// serialization).
    pub fn backend(&self) -> &I {
        &self.backend
    }

    fn owned_handle(&self, mount_point: &Path) -> Option<MountHandle> {
        self.owned
            .lock()
            .ok()
            .and_then(|table| table.get(mount_point).cloned())
    }

    fn remember(&self, handle: &MountHandle) {
        if let Ok(mut table) = self.owned.lock() {
            table.insert(handle.mount_point.clone(), handle.clone());
        }
    }

    fn forget(&self, mount_point: &Path) {
        if let Ok(mut table) = self.owned.lock() {
            table.remove(mount_point);
        }
    }

    /// Attach `image` at `mount_point`.
    ///
    /// Idempotent: when `image` is already mounted there this returns the
    /// existing handle without touching the OS.
    ///
    /// # Errors
    ///
    /// Fails with `MountConflict` when another volume occupies
    /// `mount_point`, or with the backend's attach error.
    pub async fn attach(&self, image: &Path, mount_point: &Path) -> Result<MountHandle> {
        let _serial = self.serial.lock().await;
        let _gate = self.gate.enter().await?;

        let conflict = |detail: String| PackError::MountConflict {
            mount_point: mount_point.to_path_buf(),
            detail,
        };

        if let Some(handle) = self.owned_handle(mount_point) {
            if self.backend.mounted_at(mount_point).await?.is_some() {
                if handle.image == image {
                    tracing::debug!(mount_point = %mount_point.display(), "already attached");
                    return Ok(handle);
                }
                return Err(conflict(format!("occupied by {}", handle.image.display())).into());
            }
            self.forget(mount_point);
        }

        if let Some(volume) = self.backend.mounted_at(mount_point).await? {
            return match volume.image {
                Some(existing) if existing == image => {
                    let handle = MountHandle {
                        image: image.to_path_buf(),
                        mount_point: mount_point.to_path_buf(),
                        device: volume.device,
                    };
                    tracing::debug!(mount_point = %mount_point.display(), "adopting existing mount");
                    self.remember(&handle);
                    Ok(handle)
                }
                Some(existing) => {
                    Err(conflict(format!("occupied by {}", existing.display())).into())
                }
                None => Err(conflict(format!("occupied by {}", volume.device)).into()),
            };
        }

        let handle = self.backend.attach(image, mount_point).await?;
        tracing::info!(
            image = %image.display(),
            mount_point = %mount_point.display(),
            device = %handle.device,
            "attached"
        );
        self.remember(&handle);
        Ok(handle)
    }

    /// Detach `handle`; a no-op when nothing is mounted there anymore.
    pub async fn detach(&self, handle: &MountHandle) -> Result<()> {
        let _serial = self.serial.lock().await;
        let _gate = self.gate.enter().await?;

        if self.backend.mounted_at(&handle.mount_point).await?.is_none() {
            self.forget(&handle.mount_point);
            return Ok(());
        }
        self.backend.detach(handle).await?;
        tracing::info!(mount_point = %handle.mount_point.display(), "detached");
        self.forget(&handle.mount_point);
        Ok(())
    }

    /// Detach whatever volume is mounted at `mount_point`.
    pub async fn detach_at(&self, mount_point: &Path) -> Result<()> {
        let handle = match self.owned_handle(mount_point) {
            Some(handle) => handle,
            None => match self.backend.mounted_at(mount_point).await? {
                Some(volume) => MountHandle {
                    image: volume.image.unwrap_or_default(),
                    mount_point: mount_point.to_path_buf(),
                    device: volume.device,
                },
                None => return Ok(()),
            },
        };
        self.detach(&handle).await
    }

    pub async fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        Ok(self.backend.mounted_at(mount_point).await?.is_some())
    }

    /// Attach `image` at `mount_point` unless it is already mounted there,
    /// refusing to shadow a non-empty plain directory.
    ///
    /// # Errors
    ///
    /// Fails with `MountConflict` when `mount_point` holds files of its own.
    pub async fn ensure_attached(
        &self,
        image: &Path,
        mount_point: &Path,
        tree: &impl TreeOps,
    ) -> Result<MountHandle> {
        if !self.is_mounted(mount_point).await?
            && tree.kind(mount_point).await? == PathKind::Directory
            && !tree.scan(mount_point).await?.is_empty()
        {
            return Err(PackError::MountConflict {
                mount_point: mount_point.to_path_buf(),
                detail: "a non-empty directory is in the way".to_string(),
            }
            .into());
        }
        self.attach(image, mount_point).await
    }
}
