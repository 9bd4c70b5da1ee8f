//! Application service: the public entry point for every afpack command.
//!
//! Each state-changing call takes the per-path lock, reads the ledger entry,
//! asks the lifecycle table how to proceed and hands the work to the
//! migrator or compression controller. Read-only calls (`status`, `list`,
//! `log`) never take a lock.

use std::path::{Path, PathBuf};

use afpack_common::{
    CompressionAlgorithm, ManagedPath, OperationKind, OperationRecord, PathState,
    PendingOperation, PendingSummary, StatusOutput,
};
use anyhow::Result;
use futures_util::future::join_all;
use uuid::Uuid;

use crate::application::ports::{
    CancelFlag, CompressionBackend, ImageBackend, MountGate, PathKind, PathLocker, PlatformProbe,
    ProgressReporter, StateLedger, TreeOps,
};
use crate::application::services::compression::CompressionController;
use crate::application::services::journal;
use crate::application::services::migrator::AtomicMigrator;
use crate::application::services::mount::MountManager;
use crate::domain::config::Settings;
use crate::domain::error::{FailureReport, PackError, classify};
use crate::domain::layout::{PathLayout, normalize};
use crate::domain::lifecycle::{
    Admission, CompressStep, PackStep, Step, UnpackStep, admit, in_flight_state, step_name,
};

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Concrete collaborators injected into the orchestrator.
pub struct Backends<I, C, P, L, K, G, T> {
    pub image: I,
    pub compression: C,
    pub probe: P,
    pub ledger: L,
    pub locker: K,
    pub gate: G,
    pub tree: T,
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Chain a compression pass with this algorithm.
    pub compress: Option<CompressionAlgorithm>,
    /// Report the plan without touching disk.
    pub dry_run: bool,
}

/// What `pack` would do, computed without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackPlan {
    pub path: PathBuf,
    pub image: PathBuf,
    pub entries: u64,
    pub source_bytes: u64,
    pub capacity: u64,
    pub required_space: u64,
    pub available_space: u64,
}

impl PackPlan {
    #[must_use]
    pub fn fits(&self) -> bool {
        self.available_space >= self.required_space
    }
}

#[derive(Debug)]
pub enum PackOutcome {
    Packed {
        path: PathBuf,
        size_bytes: u64,
        fingerprint: Option<String>,
        compressed: bool,
        resumed: bool,
    },
    AlreadyPacked {
        path: PathBuf,
        compressed: bool,
    },
    /// Dry run of a fresh pack.
    Planned(PackPlan),
    /// Dry run of an interrupted pack.
    WouldResume {
        path: PathBuf,
        step: &'static str,
    },
}

#[derive(Debug)]
pub struct UnpackOutcome {
    pub path: PathBuf,
    pub resumed: bool,
}

#[derive(Debug)]
pub enum CompressOutcome {
    Done {
        path: PathBuf,
        kind: OperationKind,
        resumed: bool,
    },
    AlreadyDone {
        path: PathBuf,
        kind: OperationKind,
    },
}

#[derive(Debug)]
pub enum MountOutcome {
    Mounted { path: PathBuf, device: String },
    AlreadyMounted { path: PathBuf },
}

#[derive(Debug)]
pub enum RecoverOutcome {
    RolledBack { path: PathBuf, state: PathState },
    RolledForward { path: PathBuf, state: PathState },
    NothingToDo { path: PathBuf, state: PathState },
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Orchestrator<I, C, P, L, K, G, T> {
    mounts: MountManager<I, G>,
    compression: C,
    probe: P,
    ledger: L,
    locker: K,
    tree: T,
    settings: Settings,
    cancel: CancelFlag,
}

impl<I, C, P, L, K, G, T> Orchestrator<I, C, P, L, K, G, T>
where
    I: ImageBackend,
    C: CompressionBackend,
    P: PlatformProbe,
    L: StateLedger,
    K: PathLocker,
    G: MountGate,
    T: TreeOps,
{
    pub fn new(backends: Backends<I, C, P, L, K, G, T>, settings: Settings, cancel: CancelFlag) -> Self {
        Self {
            mounts: MountManager::new(backends.image, backends.gate),
            compression: backends.compression,
            probe: backends.probe,
            ledger: backends.ledger,
            locker: backends.locker,
            tree: backends.tree,
            settings,
            cancel,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    #[must_use]
    pub fn mounts(&self) -> &MountManager<I, G> {
        &self.mounts
    }

    fn layout(&self, path: &Path) -> PathLayout {
        PathLayout::new(path, &self.settings.state_dir)
    }

    fn migrator<'a, R: ProgressReporter>(
        &'a self,
        reporter: &'a R,
    ) -> AtomicMigrator<'a, I, G, L, T, R> {
        AtomicMigrator {
            mounts: &self.mounts,
            ledger: &self.ledger,
            tree: &self.tree,
            settings: &self.settings,
            cancel: &self.cancel,
            reporter,
        }
    }

    fn controller<'a, R: ProgressReporter>(
        &'a self,
        reporter: &'a R,
    ) -> CompressionController<'a, I, G, C, L, T, R> {
        CompressionController {
            mounts: &self.mounts,
            backend: &self.compression,
            ledger: &self.ledger,
            tree: &self.tree,
            settings: &self.settings,
            cancel: &self.cancel,
            reporter,
        }
    }

    /// Attach the path, the state it is in now and retry safety to a failure.
    async fn report<O>(&self, path: &Path, result: Result<O>) -> Result<O> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.downcast_ref::<FailureReport>().is_some() {
            return Err(err);
        }
        let state = match self.ledger.get(path).await {
            Ok(entry) => entry.map_or(PathState::Unpacked, |e| e.state),
            Err(_) => PathState::Failed {
                reason: "ledger unreadable".to_string(),
                resume_step: None,
            },
        };
        let retry_safe = classify(&err).is_none_or(PackError::retry_safe);
        Err(err.context(FailureReport {
            path: path.to_path_buf(),
            state,
            retry_safe,
        }))
    }

    // ── pack ────────────────────────────────────────────────────────────────

    /// Move the directory at `path` into a new image mounted in its place,
    /// resuming an interrupted pack where it stopped. A relative `path` is
    /// taken from the working directory.
    ///
    /// # Errors
    ///
    /// `Unsupported`, `Busy`, `NotADirectory`, `InsufficientSpace` before any
    /// change; `VerificationFailed`, `PartialMigration` and backend errors
    /// after the entry was written (see the attached `FailureReport`).
    pub async fn pack(
        &self,
        path: &Path,
        opts: &PackOptions,
        reporter: &impl ProgressReporter,
    ) -> Result<PackOutcome> {
        let path = self.tree.absolute(path).await?;
        let result = self.pack_locked(&path, opts, reporter).await;
        self.report(&path, result).await
    }

    /// Pack several paths concurrently. Results keep the input order.
    pub async fn pack_many(
        &self,
        paths: &[PathBuf],
        opts: &PackOptions,
        reporter: &impl ProgressReporter,
    ) -> Vec<(PathBuf, Result<PackOutcome>)> {
        let runs = paths.iter().map(|path| async move {
            let resolved = self.tree.absolute(path).await.unwrap_or_else(|_| normalize(path));
            let outcome = self.pack(&resolved, opts, reporter).await;
            (resolved, outcome)
        });
        join_all(runs).await
    }

    async fn pack_locked(
        &self,
        path: &Path,
        opts: &PackOptions,
        reporter: &impl ProgressReporter,
    ) -> Result<PackOutcome> {
        if !self.probe.supports_image_creation().await? {
            return Err(PackError::Unsupported(
                "creating ASIF disk images requires macOS 26 or later".to_string(),
            )
            .into());
        }
        let _guard = self.locker.try_lock(path)?;
        let layout = self.layout(path);
        let existing = self.ledger.get(path).await?;

        let (mut entry, from, resumed) = match (admit(OperationKind::Pack, path, existing.as_ref())?, existing) {
            (Admission::AlreadyDone, Some(mut entry)) => {
                if let Some(algorithm) = opts.compress.filter(|_| !entry.compressed && !opts.dry_run) {
                    self.start_compression(&mut entry, &layout, OperationKind::Compress, Some(algorithm), reporter)
                        .await?;
                }
                return Ok(PackOutcome::AlreadyPacked {
                    path: path.to_path_buf(),
                    compressed: entry.compressed,
                });
            }
            (Admission::Resume { step }, Some(mut entry)) => {
                let from = PackStep::from_index(step).unwrap_or(PackStep::Preflight);
                if opts.dry_run {
                    return Ok(PackOutcome::WouldResume {
                        path: path.to_path_buf(),
                        step: from.name(),
                    });
                }
                tracing::info!(path = %path.display(), step = from.name(), "resuming pack");
                reporter.step(&format!("{}: resuming at {}", path.display(), from.name()));
                entry.state = PathState::Packing;
                journal::save(&self.ledger, &mut entry).await?;
                (entry, from, true)
            }
            (_, existing) => {
                let plan = self.plan_pack(&layout).await?;
                if opts.dry_run {
                    return Ok(PackOutcome::Planned(plan));
                }
                if !plan.fits() {
                    return Err(PackError::InsufficientSpace {
                        required: plan.required_space,
                        available: plan.available_space,
                    }
                    .into());
                }
                let mut entry = existing.unwrap_or_else(|| ManagedPath::new(path.to_path_buf()));
                entry.state = PathState::Packing;
                entry.backing_image_path = None;
                entry.compressed = false;
                entry.algorithm = None;
                entry.content_fingerprint = None;
                entry.size_bytes = 0;
                entry.image_capacity = 0;
                let mut pending =
                    PendingOperation::new(Uuid::new_v4().to_string(), OperationKind::Pack);
                pending.temp_image_path = Some(layout.temp_image.clone());
                pending.staging_mount = Some(layout.staging_mount.clone());
                pending.trash_path = Some(layout.trash.clone());
                pending.source_bytes = plan.source_bytes;
                entry.pending_operation = Some(pending);
                journal::save(&self.ledger, &mut entry).await?;
                (entry, PackStep::Preflight, false)
            }
        };

        self.migrator(reporter).pack(&mut entry, &layout, from).await?;
        reporter.success(&format!("{} packed", path.display()));

        if let Some(algorithm) = opts.compress {
            self.start_compression(&mut entry, &layout, OperationKind::Compress, Some(algorithm), reporter)
                .await?;
        }
        Ok(PackOutcome::Packed {
            path: path.to_path_buf(),
            size_bytes: entry.size_bytes,
            fingerprint: entry.content_fingerprint.as_ref().map(|f| f.short().to_string()),
            compressed: entry.compressed,
            resumed,
        })
    }

    /// Side-effect-free preflight: the path is a plain directory with no
    /// leftovers next to it, and the host volume has room for the copy.
    async fn plan_pack(&self, layout: &PathLayout) -> Result<PackPlan> {
        let path = &layout.logical;
        if self.tree.kind(path).await? != PathKind::Directory {
            return Err(PackError::NotADirectory { path: path.clone() }.into());
        }
        if self.mounts.is_mounted(path).await? {
            return Err(PackError::MountConflict {
                mount_point: path.clone(),
                detail: "a volume is already mounted there".to_string(),
            }
            .into());
        }
        for leftover in [&layout.image, &layout.trash, &layout.restore] {
            if self.tree.kind(leftover).await? != PathKind::Missing {
                return Err(PackError::InvalidState {
                    path: path.clone(),
                    state: format!("next to an existing {}", leftover.display()),
                    operation: "pack".to_string(),
                }
                .into());
            }
        }

        let entries = self.tree.scan(path).await?;
        let source_bytes: u64 = entries.iter().map(|e| e.size).sum();
        let parent = path.parent().unwrap_or(Path::new("/"));
        let available_space = self.tree.available_space(parent).await?;
        let plan = PackPlan {
            path: path.clone(),
            image: layout.image.clone(),
            entries: u64::try_from(entries.len()).unwrap_or(u64::MAX),
            source_bytes,
            capacity: self.settings.sizing.capacity(source_bytes),
            required_space: self.settings.sizing.required_space(source_bytes),
            available_space,
        };
        tracing::debug!(?plan, "pack plan");
        Ok(plan)
    }

    // ── unpack ──────────────────────────────────────────────────────────────

    /// Copy the image content back into a plain directory at `path` and
    /// delete the image; the ledger entry is removed on success.
    ///
    /// # Errors
    ///
    /// `NotManaged`, `InvalidState`, `Busy`, `VerificationFailed`,
    /// `PartialMigration` and backend errors.
    pub async fn unpack(&self, path: &Path, reporter: &impl ProgressReporter) -> Result<UnpackOutcome> {
        let path = self.tree.absolute(path).await?;
        let result = self.unpack_locked(&path, reporter).await;
        self.report(&path, result).await
    }

    async fn unpack_locked(&self, path: &Path, reporter: &impl ProgressReporter) -> Result<UnpackOutcome> {
        let _guard = self.locker.try_lock(path)?;
        let layout = self.layout(path);
        let existing = self.ledger.get(path).await?;

        let (mut entry, from, resumed) = match (admit(OperationKind::Unpack, path, existing.as_ref())?, existing) {
            (Admission::Resume { step }, Some(mut entry)) => {
                let from = UnpackStep::from_index(step).unwrap_or(UnpackStep::Preflight);
                tracing::info!(path = %path.display(), step = from.name(), "resuming unpack");
                reporter.step(&format!("{}: resuming at {}", path.display(), from.name()));
                entry.state = PathState::Unpacking;
                journal::save(&self.ledger, &mut entry).await?;
                (entry, from, true)
            }
            (Admission::Start, Some(mut entry)) => {
                entry.state = PathState::Unpacking;
                let mut pending =
                    PendingOperation::new(Uuid::new_v4().to_string(), OperationKind::Unpack);
                pending.restore_path = Some(layout.restore.clone());
                pending.source_bytes = entry.size_bytes;
                entry.pending_operation = Some(pending);
                journal::save(&self.ledger, &mut entry).await?;
                (entry, UnpackStep::Preflight, false)
            }
            _ => {
                return Err(PackError::NotManaged {
                    path: path.to_path_buf(),
                }
                .into());
            }
        };

        self.migrator(reporter).unpack(&mut entry, &layout, from).await?;
        reporter.success(&format!("{} unpacked", path.display()));
        Ok(UnpackOutcome {
            path: path.to_path_buf(),
            resumed,
        })
    }

    // ── compress / decompress ───────────────────────────────────────────────

    /// Apply transparent compression to every file in the mounted image.
    ///
    /// # Errors
    ///
    /// `Unsupported`, `NotManaged`, `InvalidState`, `Busy`,
    /// `CompressionFailure` and `VerificationFailed`.
    pub async fn compress(
        &self,
        path: &Path,
        algorithm: Option<CompressionAlgorithm>,
        reporter: &impl ProgressReporter,
    ) -> Result<CompressOutcome> {
        let path = self.tree.absolute(path).await?;
        let result = self
            .compression_locked(&path, OperationKind::Compress, algorithm, reporter)
            .await;
        self.report(&path, result).await
    }

    /// Remove transparent compression from every file in the mounted image.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::compress`].
    pub async fn decompress(&self, path: &Path, reporter: &impl ProgressReporter) -> Result<CompressOutcome> {
        let path = self.tree.absolute(path).await?;
        let result = self
            .compression_locked(&path, OperationKind::Decompress, None, reporter)
            .await;
        self.report(&path, result).await
    }

    async fn compression_locked(
        &self,
        path: &Path,
        kind: OperationKind,
        algorithm: Option<CompressionAlgorithm>,
        reporter: &impl ProgressReporter,
    ) -> Result<CompressOutcome> {
        if !self.probe.supports_compressed_read().await? {
            return Err(PackError::Unsupported(
                "transparent compression requires macOS".to_string(),
            )
            .into());
        }
        let _guard = self.locker.try_lock(path)?;
        let layout = self.layout(path);
        let existing = self.ledger.get(path).await?;

        match (admit(kind, path, existing.as_ref())?, existing) {
            (Admission::AlreadyDone, _) => Ok(CompressOutcome::AlreadyDone {
                path: path.to_path_buf(),
                kind,
            }),
            (Admission::Resume { step }, Some(mut entry)) => {
                let from = CompressStep::from_index(step).unwrap_or(CompressStep::Scan);
                tracing::info!(path = %path.display(), step = from.name(), %kind, "resuming compression pass");
                reporter.step(&format!("{}: resuming {kind} at {}", path.display(), from.name()));
                entry.state = in_flight_state(kind);
                journal::save(&self.ledger, &mut entry).await?;
                self.controller(reporter).run(&mut entry, &layout, from).await?;
                reporter.success(&format!("{} {kind}ed", path.display()));
                Ok(CompressOutcome::Done {
                    path: path.to_path_buf(),
                    kind,
                    resumed: true,
                })
            }
            (Admission::Start, Some(mut entry)) => {
                self.start_compression(&mut entry, &layout, kind, algorithm, reporter)
                    .await?;
                Ok(CompressOutcome::Done {
                    path: path.to_path_buf(),
                    kind,
                    resumed: false,
                })
            }
            _ => Err(PackError::NotManaged {
                path: path.to_path_buf(),
            }
            .into()),
        }
    }

    /// Begin a fresh compression pass on a Packed entry. Caller holds the lock.
    async fn start_compression(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        kind: OperationKind,
        algorithm: Option<CompressionAlgorithm>,
        reporter: &impl ProgressReporter,
    ) -> Result<()> {
        entry.state = in_flight_state(kind);
        let mut pending = PendingOperation::new(Uuid::new_v4().to_string(), kind);
        if kind == OperationKind::Compress {
            pending.algorithm = Some(algorithm.unwrap_or(self.settings.algorithm));
        }
        entry.pending_operation = Some(pending);
        journal::save(&self.ledger, entry).await?;
        self.controller(reporter)
            .run(entry, layout, CompressStep::Scan)
            .await?;
        reporter.success(&format!("{} {kind}ed", layout.logical.display()));
        Ok(())
    }

    // ── mount ───────────────────────────────────────────────────────────────

    /// Re-attach the backing image of a Packed path (e.g. after a reboot).
    ///
    /// # Errors
    ///
    /// `NotManaged`, `InvalidState` unless Packed, `Busy`, `MountConflict`.
    pub async fn mount(&self, path: &Path) -> Result<MountOutcome> {
        let path = self.tree.absolute(path).await?;
        let result = self.mount_locked(&path).await;
        self.report(&path, result).await
    }

    async fn mount_locked(&self, path: &Path) -> Result<MountOutcome> {
        let _guard = self.locker.try_lock(path)?;
        let entry = self.ledger.get(path).await?.ok_or_else(|| PackError::NotManaged {
            path: path.to_path_buf(),
        })?;
        if entry.state != PathState::Packed {
            return Err(PackError::InvalidState {
                path: path.to_path_buf(),
                state: entry.state.to_string(),
                operation: "mount".to_string(),
            }
            .into());
        }
        if self.mounts.is_mounted(path).await? {
            return Ok(MountOutcome::AlreadyMounted {
                path: path.to_path_buf(),
            });
        }
        let image = entry
            .backing_image_path
            .clone()
            .unwrap_or_else(|| self.layout(path).image);
        let handle = self.mounts.ensure_attached(&image, path, &self.tree).await?;
        Ok(MountOutcome::Mounted {
            path: path.to_path_buf(),
            device: handle.device,
        })
    }

    // ── recover ─────────────────────────────────────────────────────────────

    /// Resolve an interrupted or failed operation without retrying it:
    /// roll back to the pre-operation state, or forward when the swap had
    /// already completed.
    ///
    /// # Errors
    ///
    /// `NotManaged`, `Busy`, and any failure of the rollback itself.
    pub async fn recover(&self, path: &Path, reporter: &impl ProgressReporter) -> Result<RecoverOutcome> {
        let path = self.tree.absolute(path).await?;
        let result = self.recover_locked(&path, reporter).await;
        self.report(&path, result).await
    }

    async fn recover_locked(&self, path: &Path, reporter: &impl ProgressReporter) -> Result<RecoverOutcome> {
        let _guard = self.locker.try_lock(path)?;
        let layout = self.layout(path);
        let mut entry = self.ledger.get(path).await?.ok_or_else(|| PackError::NotManaged {
            path: path.to_path_buf(),
        })?;
        let Some(kind) = entry.pending_kind() else {
            return Ok(RecoverOutcome::NothingToDo {
                path: path.to_path_buf(),
                state: entry.state,
            });
        };
        tracing::info!(path = %path.display(), %kind, state = %entry.state, "recovering");
        reporter.step(&format!("{}: recovering interrupted {kind}", path.display()));

        let migrator = self.migrator(reporter);
        let outcome = match kind {
            OperationKind::Pack => {
                if migrator.recover_pack(&mut entry, &layout).await? {
                    RecoverOutcome::RolledForward {
                        path: path.to_path_buf(),
                        state: PathState::Packed,
                    }
                } else {
                    RecoverOutcome::RolledBack {
                        path: path.to_path_buf(),
                        state: PathState::Unpacked,
                    }
                }
            }
            OperationKind::Unpack => {
                if migrator.recover_unpack(&mut entry, &layout).await? {
                    RecoverOutcome::RolledBack {
                        path: path.to_path_buf(),
                        state: PathState::Packed,
                    }
                } else {
                    RecoverOutcome::RolledForward {
                        path: path.to_path_buf(),
                        state: PathState::Unpacked,
                    }
                }
            }
            OperationKind::Compress | OperationKind::Decompress => {
                self.controller(reporter).recover(&mut entry).await?;
                RecoverOutcome::RolledBack {
                    path: path.to_path_buf(),
                    state: PathState::Packed,
                }
            }
        };
        reporter.success(&format!("{} recovered", path.display()));
        Ok(outcome)
    }

    // ── read-only views ─────────────────────────────────────────────────────

    /// Snapshot of one managed path. Never locks, never mutates.
    ///
    /// # Errors
    ///
    /// `NotManaged` for unknown paths, `CorruptLedger` for unreadable entries.
    pub async fn status(&self, path: &Path) -> Result<StatusOutput> {
        let path = self.tree.absolute(path).await?;
        let entry = self
            .ledger
            .get(&path)
            .await?
            .ok_or_else(|| PackError::NotManaged { path: path.clone() })?;
        let mounted = match self.mounts.is_mounted(&path).await {
            Ok(mounted) => mounted,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "mount state unknown");
                false
            }
        };
        Ok(status_of(entry, mounted))
    }

    /// Every managed path, sorted by logical path.
    pub async fn list(&self) -> Result<Vec<ManagedPath>> {
        self.ledger.list_all().await
    }

    /// The operation log of one managed path.
    ///
    /// # Errors
    ///
    /// `NotManaged` when the path has no ledger entry.
    pub async fn log(&self, path: &Path) -> Result<Vec<OperationRecord>> {
        let path = self.tree.absolute(path).await?;
        if self.ledger.get(&path).await?.is_none() {
            return Err(PackError::NotManaged { path }.into());
        }
        self.ledger.operations(&path).await
    }
}

/// Build the `status` payload for an entry.
#[must_use]
pub fn status_of(entry: ManagedPath, mounted: bool) -> StatusOutput {
    let pending = entry.pending_operation.as_ref().map(|p| PendingSummary {
        kind: p.kind,
        step: step_name(p.kind, p.step).to_string(),
        started_at: p.started_at,
    });
    StatusOutput {
        fingerprint: entry.content_fingerprint.as_ref().map(|f| f.short().to_string()),
        path: entry.logical_path,
        state: entry.state,
        compressed: entry.compressed,
        size_bytes: entry.size_bytes,
        backing_image: entry.backing_image_path,
        mounted,
        pending,
    }
}
