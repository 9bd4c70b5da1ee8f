//! Application service: crash-safe content migration and path swap.
//!
//! Pack moves a plain directory into a freshly created image; unpack is the
//! structural inverse. Every step is checkpointed in the ledger before its
//! side effect starts, and every step is safe to run twice, so an interrupted
//! operation resumes from its last checkpoint.
//!
//! The logical path is never left empty: failures inside the swap window are
//! repaired before the error is returned, and a crash inside it is repaired
//! when the operation resumes.

use std::path::{Path, PathBuf};

use afpack_common::{ManagedPath, OperationPhase, PathState, PendingOperation};
use anyhow::{Context, Result};

use crate::application::ports::{
    CancelFlag, ImageBackend, MountGate, PathKind, ProgressReporter, StateLedger, TreeEntry,
    TreeOps,
};
use crate::application::services::journal;
use crate::application::services::mount::MountManager;
use crate::domain::config::Settings;
use crate::domain::error::{Cancelled, PackError, classify};
use crate::domain::layout::PathLayout;
use crate::domain::lifecycle::{PackStep, Step, UnpackStep};
use crate::domain::size::format_size;

/// Drives pack and unpack for one managed path. The caller holds the
/// per-path lock for the migrator's whole lifetime.
pub struct AtomicMigrator<'a, I, G, L, T, R> {
    pub mounts: &'a MountManager<I, G>,
    pub ledger: &'a L,
    pub tree: &'a T,
    pub settings: &'a Settings,
    pub cancel: &'a CancelFlag,
    pub reporter: &'a R,
}

fn pending_mut(entry: &mut ManagedPath) -> Result<&mut PendingOperation> {
    let path = entry.logical_path.clone();
    entry
        .pending_operation
        .as_mut()
        .ok_or_else(|| {
            PackError::CorruptLedger {
                path,
                detail: "in-flight entry has no pending operation".to_string(),
            }
            .into()
        })
}

fn backing_image(entry: &ManagedPath, layout: &PathLayout) -> PathBuf {
    entry
        .backing_image_path
        .clone()
        .unwrap_or_else(|| layout.image.clone())
}

fn entry_count(entries: &[TreeEntry]) -> u64 {
    u64::try_from(entries.len()).unwrap_or(u64::MAX)
}

impl<I, G, L, T, R> AtomicMigrator<'_, I, G, L, T, R>
where
    I: ImageBackend,
    G: MountGate,
    L: StateLedger,
    T: TreeOps,
    R: ProgressReporter,
{
    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.tree.kind(path).await? != PathKind::Missing)
    }

    /// Copy `src` into `dst` in checkpointed batches, skipping batches a
    /// previous run already finished, then apply directory metadata.
    async fn copy_batches(
        &self,
        entry: &mut ManagedPath,
        step: &str,
        src: &Path,
        dst: &Path,
    ) -> Result<Option<String>> {
        let entries = self.tree.scan(src).await?;
        let batch = self.settings.copy_batch.max(1);
        let total = entry_count(&entries).div_ceil(batch as u64);
        let done = pending_mut(entry)?.batches_done;
        let skip = usize::try_from(done).unwrap_or(usize::MAX);
        if done > 0 {
            tracing::info!(path = %src.display(), done, total, "skipping copied batches");
        }

        for (index, chunk) in entries.chunks(batch).enumerate().skip(skip) {
            self.check_cancel()?;
            self.tree.copy_entries(src, dst, chunk).await?;
            let finished = index as u64 + 1;
            pending_mut(entry)?.batches_done = finished;
            journal::save(self.ledger, entry).await?;
            journal::record(
                self.ledger,
                entry,
                step,
                OperationPhase::Done,
                Some(format!("batch {finished}/{total}")),
            )
            .await?;
            self.reporter.advance(finished, total);
        }

        self.tree.finalize_dirs(src, dst, &entries).await?;
        Ok(Some(format!("{} entries in {total} batches", entries.len())))
    }

    /// Fingerprint `original` and `copy`; they must match.
    async fn verify_copy(
        &self,
        entry: &mut ManagedPath,
        original: &Path,
        copy: &Path,
    ) -> Result<Option<String>> {
        let expected = self.tree.fingerprint(original, self.cancel).await?;
        let actual = self.tree.fingerprint(copy, self.cancel).await?;
        if expected != actual {
            return Err(PackError::VerificationFailed {
                path: entry.logical_path.clone(),
                expected: expected.short().to_string(),
                actual: actual.short().to_string(),
            }
            .into());
        }
        let detail = format!(
            "fingerprint {} ({} files, {})",
            expected.short(),
            expected.files,
            format_size(expected.bytes)
        );
        let pending = pending_mut(entry)?;
        pending.source_bytes = expected.bytes;
        pending.source_fingerprint = Some(expected);
        journal::save(self.ledger, entry).await?;
        Ok(Some(detail))
    }

    // ── Pack ────────────────────────────────────────────────────────────────

    /// Run pack from `from` to completion, leaving `entry` Packed.
    ///
    /// # Errors
    ///
    /// On failure `entry` is persisted as `Failed` with the step a retry
    /// resumes from, and the returned error carries a `PackError`.
    pub async fn pack(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        from: PackStep,
    ) -> Result<()> {
        let mut step = from;
        match self.run_pack(entry, layout, &mut step).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.pack_failed(entry, layout, step, err).await),
        }
    }

    async fn run_pack(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        step: &mut PackStep,
    ) -> Result<()> {
        *step = self.prepare_pack_resume(entry, layout, *step).await?;
        loop {
            self.check_cancel()?;
            journal::begin_step(self.ledger, entry, step.index(), step.name()).await?;
            self.reporter
                .step(&format!("{}: {}", layout.logical.display(), pack_message(*step)));
            tracing::info!(path = %layout.logical.display(), step = step.name(), "pack step");
            let detail = self.pack_step(entry, layout, *step).await?;
            journal::finish_step(self.ledger, entry, step.name(), detail).await?;
            match step.next() {
                Some(next) => *step = next,
                None => break,
            }
        }
        self.complete_pack(entry, layout).await
    }

    /// Bring the on-disk state in line with a resumed checkpoint.
    async fn prepare_pack_resume(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        step: PackStep,
    ) -> Result<PackStep> {
        if step.in_swap_window() {
            self.restore_original(layout).await?;
            return self.check_source_drift(entry, layout).await;
        }
        Ok(match step {
            // The staging mount does not survive the process.
            PackStep::CopyContent | PackStep::Verify => PackStep::AttachStaging,
            other => other,
        })
    }

    /// Compare the source against the fingerprint recorded at verification;
    /// a drift means the image is stale and is rebuilt.
    async fn check_source_drift(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
    ) -> Result<PackStep> {
        let Some(recorded) = pending_mut(entry)?.source_fingerprint.clone() else {
            return Ok(PackStep::MoveAside);
        };
        if self.tree.kind(&layout.logical).await? != PathKind::Directory {
            return Ok(PackStep::MoveAside);
        }
        let current = self.tree.fingerprint(&layout.logical, self.cancel).await?;
        if current == recorded {
            return Ok(PackStep::MoveAside);
        }

        tracing::warn!(
            path = %layout.logical.display(),
            recorded = recorded.short(),
            current = current.short(),
            "source changed since verification, rebuilding image"
        );
        self.reporter.warn(&format!(
            "{} changed since it was verified; rebuilding the image",
            layout.logical.display()
        ));
        self.discard_staging(layout).await?;
        self.mounts.backend().delete(&layout.image).await?;
        let pending = pending_mut(entry)?;
        pending.batches_done = 0;
        pending.source_bytes = current.bytes;
        pending.source_fingerprint = None;
        Ok(PackStep::CreateImage)
    }

    async fn pack_step(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        step: PackStep,
    ) -> Result<Option<String>> {
        let logical = &layout.logical;
        match step {
            PackStep::Preflight => {
                if self.tree.kind(logical).await? != PathKind::Directory {
                    return Err(PackError::NotADirectory {
                        path: logical.clone(),
                    }
                    .into());
                }
                self.discard_staging(layout).await?;
                let entries = self.tree.scan(logical).await?;
                let bytes: u64 = entries.iter().map(|e| e.size).sum();
                let pending = pending_mut(entry)?;
                pending.source_bytes = bytes;
                pending.batches_done = 0;
                pending.source_fingerprint = None;
                journal::save(self.ledger, entry).await?;
                Ok(Some(format!(
                    "{} entries, {}",
                    entries.len(),
                    format_size(bytes)
                )))
            }
            PackStep::CreateImage => {
                self.discard_staging(layout).await?;
                let capacity = self
                    .settings
                    .sizing
                    .capacity(pending_mut(entry)?.source_bytes);
                self.mounts
                    .backend()
                    .create(&layout.temp_image, capacity)
                    .await?;
                entry.image_capacity = capacity;
                journal::save(self.ledger, entry).await?;
                Ok(Some(format!("capacity {}", format_size(capacity))))
            }
            PackStep::AttachStaging => {
                self.tree.create_dir_all(&layout.staging_mount).await?;
                self.mounts
                    .attach(&layout.temp_image, &layout.staging_mount)
                    .await?;
                Ok(None)
            }
            PackStep::CopyContent => {
                self.copy_batches(entry, step.name(), logical, &layout.staging_mount)
                    .await
            }
            PackStep::Verify => self.verify_copy(entry, logical, &layout.staging_mount).await,
            PackStep::DetachStaging => {
                self.mounts.detach_at(&layout.staging_mount).await?;
                self.tree.remove_dir(&layout.staging_mount).await?;
                Ok(None)
            }
            PackStep::FinalizeImage => {
                if self.exists(&layout.temp_image).await? {
                    self.tree.rename(&layout.temp_image, &layout.image).await?;
                } else if !self.exists(&layout.image).await? {
                    anyhow::bail!(
                        "neither {} nor {} exists",
                        layout.temp_image.display(),
                        layout.image.display()
                    );
                }
                entry.backing_image_path = Some(layout.image.clone());
                journal::save(self.ledger, entry).await?;
                Ok(None)
            }
            PackStep::MoveAside => {
                if !self.exists(&layout.trash).await? {
                    self.tree.rename(logical, &layout.trash).await?;
                }
                Ok(None)
            }
            PackStep::AttachLogical => {
                self.mounts.attach(&layout.image, logical).await?;
                Ok(None)
            }
            PackStep::ConfirmAttach => self.confirm_attach(entry, layout).await,
            PackStep::DeleteTrash => {
                self.tree.remove_tree(&layout.trash).await?;
                Ok(None)
            }
        }
    }

    async fn confirm_attach(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
    ) -> Result<Option<String>> {
        if !self.mounts.is_mounted(&layout.logical).await? {
            anyhow::bail!("{} is not mounted after attach", layout.logical.display());
        }
        let found = entry_count(&self.tree.scan(&layout.logical).await?);
        if let Some(fp) = pending_mut(entry)?.source_fingerprint.as_ref() {
            let expected = fp.files + fp.dirs + fp.symlinks;
            if found != expected {
                anyhow::bail!(
                    "attached volume at {} holds {found} entries, expected {expected}",
                    layout.logical.display()
                );
            }
        }
        Ok(Some(format!("{found} entries visible")))
    }

    async fn complete_pack(&self, entry: &mut ManagedPath, layout: &PathLayout) -> Result<()> {
        journal::record(self.ledger, entry, "complete", OperationPhase::Done, None).await?;
        let pending = entry.pending_operation.take();
        entry.state = PathState::Packed;
        entry.backing_image_path = Some(layout.image.clone());
        entry.compressed = false;
        entry.algorithm = None;
        if let Some(pending) = pending {
            entry.size_bytes = pending.source_bytes;
            entry.content_fingerprint = pending.source_fingerprint;
        }
        journal::save(self.ledger, entry).await?;
        tracing::info!(path = %layout.logical.display(), "packed");
        Ok(())
    }

    async fn pack_failed(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        step: PackStep,
        err: anyhow::Error,
    ) -> anyhow::Error {
        let resume = if matches!(classify(&err), Some(PackError::VerificationFailed { .. })) {
            if let Err(e) = self.discard_staging(layout).await {
                tracing::warn!(error = %format!("{e:#}"), "could not discard unverified image");
            }
            None
        } else if step.in_swap_window() {
            match self.restore_original(layout).await {
                Ok(()) => Some(PackStep::MoveAside.index()),
                Err(e) => {
                    tracing::error!(
                        path = %layout.logical.display(),
                        error = %format!("{e:#}"),
                        "could not restore the original directory; the next run retries"
                    );
                    Some(step.index())
                }
            }
        } else {
            Some(step.index())
        };
        journal::fail(self.ledger, entry, step.name(), resume, err).await
    }

    /// Put the moved-aside original back at the logical path. No-op when
    /// nothing was moved aside.
    pub async fn restore_original(&self, layout: &PathLayout) -> Result<()> {
        if !self.exists(&layout.trash).await? {
            return Ok(());
        }
        if self.mounts.is_mounted(&layout.logical).await? {
            self.mounts.detach_at(&layout.logical).await?;
        }
        self.tree
            .remove_dir(&layout.logical)
            .await
            .with_context(|| format!("clearing mount point {}", layout.logical.display()))?;
        self.tree.rename(&layout.trash, &layout.logical).await?;
        tracing::info!(path = %layout.logical.display(), "original directory restored");
        Ok(())
    }

    /// Detach and delete the temporary image and its staging mount.
    async fn discard_staging(&self, layout: &PathLayout) -> Result<()> {
        self.mounts.detach_at(&layout.staging_mount).await?;
        self.tree.remove_dir(&layout.staging_mount).await?;
        self.mounts.backend().delete(&layout.temp_image).await
    }

    /// Undo an interrupted pack: the original directory returns to the
    /// logical path and every artifact is removed. Rolls forward instead
    /// when only the trash deletion was left.
    ///
    /// Returns whether the path ended up Packed.
    pub async fn recover_pack(&self, entry: &mut ManagedPath, layout: &PathLayout) -> Result<bool> {
        let step = entry
            .pending_operation
            .as_ref()
            .and_then(|p| PackStep::from_index(p.step))
            .unwrap_or(PackStep::Preflight);

        if step == PackStep::DeleteTrash {
            self.pack(entry, layout, PackStep::DeleteTrash).await?;
            return Ok(true);
        }

        self.restore_original(layout).await?;
        if step.past_move_aside() && self.tree.kind(&layout.logical).await? != PathKind::Directory {
            return Err(PackError::PartialMigration {
                path: layout.logical.clone(),
                step: step.name().to_string(),
                detail: "original directory not found at the logical path or in the trash"
                    .to_string(),
            }
            .into());
        }
        self.discard_staging(layout).await?;
        if step.index() > PackStep::FinalizeImage.index()
            || (step == PackStep::FinalizeImage && !self.exists(&layout.temp_image).await?)
        {
            self.mounts.backend().delete(&layout.image).await?;
        }
        self.ledger.remove(&layout.logical).await?;
        tracing::info!(path = %layout.logical.display(), step = step.name(), "pack rolled back");
        Ok(false)
    }

    // ── Unpack ──────────────────────────────────────────────────────────────

    /// Run unpack from `from` to completion. On success the ledger entry is
    /// removed and the logical path is a plain directory again.
    ///
    /// # Errors
    ///
    /// On failure `entry` is persisted as `Failed`; the image is still
    /// mounted at the logical path unless the swap had already completed.
    pub async fn unpack(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        from: UnpackStep,
    ) -> Result<()> {
        let mut step = from;
        match self.run_unpack(entry, layout, &mut step).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.unpack_failed(entry, layout, step, err).await),
        }
    }

    async fn run_unpack(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        step: &mut UnpackStep,
    ) -> Result<()> {
        let image = backing_image(entry, layout);
        *step = if step.in_swap_window() {
            self.repair_unpack_window(layout, &image).await?
        } else {
            if *step != UnpackStep::Preflight && step.index() < UnpackStep::DetachLogical.index() {
                self.mounts
                    .ensure_attached(&image, &layout.logical, self.tree)
                    .await?;
            }
            *step
        };

        loop {
            self.check_cancel()?;
            journal::begin_step(self.ledger, entry, step.index(), step.name()).await?;
            self.reporter
                .step(&format!("{}: {}", layout.logical.display(), unpack_message(*step)));
            tracing::info!(path = %layout.logical.display(), step = step.name(), "unpack step");
            let detail = self.unpack_step(entry, layout, &image, *step).await?;
            journal::finish_step(self.ledger, entry, step.name(), detail).await?;
            match step.next() {
                Some(next) => *step = next,
                None => break,
            }
        }

        journal::record(self.ledger, entry, "complete", OperationPhase::Done, None).await?;
        self.ledger.remove(&layout.logical).await?;
        tracing::info!(path = %layout.logical.display(), "unpacked");
        Ok(())
    }

    async fn unpack_step(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        image: &Path,
        step: UnpackStep,
    ) -> Result<Option<String>> {
        let logical = &layout.logical;
        match step {
            UnpackStep::Preflight => {
                self.mounts.ensure_attached(image, logical, self.tree).await?;
                let size = entry.size_bytes;
                let pending = pending_mut(entry)?;
                pending.restore_path = Some(layout.restore.clone());
                pending.source_bytes = size;
                pending.batches_done = 0;
                journal::save(self.ledger, entry).await?;
                Ok(None)
            }
            UnpackStep::PrepareRestore => {
                self.tree.remove_tree(&layout.restore).await?;
                self.tree.create_dir_all(&layout.restore).await?;
                Ok(None)
            }
            UnpackStep::CopyOut => {
                self.copy_batches(entry, step.name(), logical, &layout.restore)
                    .await
            }
            UnpackStep::Verify => self.verify_copy(entry, logical, &layout.restore).await,
            UnpackStep::DetachLogical => {
                self.mounts.detach_at(logical).await?;
                Ok(None)
            }
            UnpackStep::Swap => {
                self.tree.remove_dir(logical).await?;
                self.tree.rename(&layout.restore, logical).await?;
                Ok(None)
            }
            UnpackStep::DeleteImage => {
                self.confirm_restored(entry, layout).await?;
                self.mounts.backend().delete(image).await?;
                Ok(None)
            }
        }
    }

    /// The logical path must hold the plain directory verified before the
    /// swap. Until it does, the image is the only intact copy and stays.
    async fn confirm_restored(&self, entry: &mut ManagedPath, layout: &PathLayout) -> Result<()> {
        let logical = &layout.logical;
        let kept = |detail: String| PackError::PartialMigration {
            path: logical.clone(),
            step: UnpackStep::DeleteImage.name().to_string(),
            detail: format!("{detail}; the image was kept"),
        };
        if self.mounts.is_mounted(logical).await?
            || self.tree.kind(logical).await? != PathKind::Directory
        {
            return Err(kept(format!("{} is not the restored directory", logical.display())).into());
        }
        let Some(expected) = pending_mut(entry)?.source_fingerprint.clone() else {
            return Ok(());
        };
        let actual = self.tree.fingerprint(logical, self.cancel).await?;
        if actual != expected {
            return Err(kept(format!(
                "restored tree {} does not match the verified copy {}",
                actual.short(),
                expected.short()
            ))
            .into());
        }
        Ok(())
    }

    /// Re-establish either side of the unpack swap. Returns the step to
    /// continue from: `DeleteImage` when the restored directory is already
    /// in place, `DetachLogical` once the image is mounted again.
    async fn repair_unpack_window(&self, layout: &PathLayout, image: &Path) -> Result<UnpackStep> {
        if !self.exists(&layout.restore).await? {
            return Ok(UnpackStep::DeleteImage);
        }
        if !self.mounts.is_mounted(&layout.logical).await? {
            self.tree.create_dir_all(&layout.logical).await?;
            self.mounts.attach(image, &layout.logical).await?;
        }
        Ok(UnpackStep::DetachLogical)
    }

    async fn unpack_failed(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        step: UnpackStep,
        err: anyhow::Error,
    ) -> anyhow::Error {
        let resume = if matches!(classify(&err), Some(PackError::VerificationFailed { .. })) {
            if let Err(e) = self.tree.remove_tree(&layout.restore).await {
                tracing::warn!(error = %format!("{e:#}"), "could not discard restore directory");
            }
            None
        } else if step.in_swap_window() {
            let image = backing_image(entry, layout);
            match self.repair_unpack_window(layout, &image).await {
                Ok(next) => Some(next.index()),
                Err(e) => {
                    tracing::error!(
                        path = %layout.logical.display(),
                        error = %format!("{e:#}"),
                        "could not re-attach the image; the next run retries"
                    );
                    Some(step.index())
                }
            }
        } else {
            Some(step.index())
        };
        journal::fail(self.ledger, entry, step.name(), resume, err).await
    }

    /// Undo an interrupted unpack, leaving the path Packed and mounted.
    /// Rolls forward when the restored directory is already in place.
    ///
    /// Returns whether the path ended up Packed.
    pub async fn recover_unpack(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
    ) -> Result<bool> {
        let step = entry
            .pending_operation
            .as_ref()
            .and_then(|p| UnpackStep::from_index(p.step))
            .unwrap_or(UnpackStep::Preflight);
        let swap_done = step.in_swap_window() && !self.exists(&layout.restore).await?;
        if step == UnpackStep::DeleteImage || swap_done {
            self.unpack(entry, layout, UnpackStep::DeleteImage).await?;
            return Ok(false);
        }

        let image = backing_image(entry, layout);
        if !self.mounts.is_mounted(&layout.logical).await? {
            self.tree.create_dir_all(&layout.logical).await?;
            self.mounts
                .ensure_attached(&image, &layout.logical, self.tree)
                .await?;
        }
        self.tree.remove_tree(&layout.restore).await?;
        journal::record(
            self.ledger,
            entry,
            step.name(),
            OperationPhase::RolledBack,
            None,
        )
        .await?;
        entry.pending_operation = None;
        entry.state = PathState::Packed;
        journal::save(self.ledger, entry).await?;
        tracing::info!(path = %layout.logical.display(), step = step.name(), "unpack rolled back");
        Ok(true)
    }
}

fn pack_message(step: PackStep) -> &'static str {
    match step {
        PackStep::Preflight => "measuring source tree...",
        PackStep::CreateImage => "creating image...",
        PackStep::AttachStaging => "attaching staging volume...",
        PackStep::CopyContent => "copying content...",
        PackStep::Verify => "verifying copy...",
        PackStep::DetachStaging => "detaching staging volume...",
        PackStep::FinalizeImage => "finalizing image...",
        PackStep::MoveAside => "moving original aside...",
        PackStep::AttachLogical => "mounting image in place...",
        PackStep::ConfirmAttach => "confirming mount...",
        PackStep::DeleteTrash => "removing original...",
    }
}

fn unpack_message(step: UnpackStep) -> &'static str {
    match step {
        UnpackStep::Preflight => "checking mount...",
        UnpackStep::PrepareRestore => "preparing restore directory...",
        UnpackStep::CopyOut => "copying content out...",
        UnpackStep::Verify => "verifying restored copy...",
        UnpackStep::DetachLogical => "detaching image...",
        UnpackStep::Swap => "swapping directories...",
        UnpackStep::DeleteImage => "deleting image...",
    }
}
