//! Application service: resumable compression passes over a mounted image.
//!
//! Files are handed to the backend in sorted batches. After each batch the
//! last processed path is checkpointed as a cursor; a retry skips everything
//! up to it. A half-finished pass is a consistent state since compression is
//! content-transparent.

use std::path::PathBuf;

use afpack_common::{CompressionAlgorithm, ManagedPath, OperationKind, OperationPhase, PathState};
use anyhow::Result;

use crate::application::ports::{
    CancelFlag, CompressionBackend, EntryKind, ImageBackend, MountGate, ProgressReporter,
    StateLedger, TreeOps,
};
use crate::application::services::journal;
use crate::application::services::mount::MountManager;
use crate::domain::config::Settings;
use crate::domain::error::{Cancelled, PackError, classify};
use crate::domain::layout::PathLayout;
use crate::domain::lifecycle::{CompressStep, Step};

pub struct CompressionController<'a, I, G, C, L, T, R> {
    pub mounts: &'a MountManager<I, G>,
    pub backend: &'a C,
    pub ledger: &'a L,
    pub tree: &'a T,
    pub settings: &'a Settings,
    pub cancel: &'a CancelFlag,
    pub reporter: &'a R,
}

impl<I, G, C, L, T, R> CompressionController<'_, I, G, C, L, T, R>
where
    I: ImageBackend,
    G: MountGate,
    C: CompressionBackend,
    L: StateLedger,
    T: TreeOps,
    R: ProgressReporter,
{
    /// Run the compress or decompress pass recorded in `entry`'s pending
    /// operation, starting at `from`, and return the path to Packed.
    ///
    /// The image is attached at the logical path first if it is not.
    ///
    /// # Errors
    ///
    /// On failure `entry` is persisted as `Failed`; a backend failure
    /// surfaces as `CompressionFailure` and keeps the cursor.
    pub async fn run(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        from: CompressStep,
    ) -> Result<()> {
        let mut step = from;
        match self.run_steps(entry, layout, &mut step).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let resume = if matches!(
                    classify(&err),
                    Some(PackError::VerificationFailed { .. })
                ) {
                    None
                } else {
                    Some(step.index())
                };
                Err(journal::fail(self.ledger, entry, step.name(), resume, err).await)
            }
        }
    }

    async fn run_steps(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        step: &mut CompressStep,
    ) -> Result<()> {
        let image = entry
            .backing_image_path
            .clone()
            .unwrap_or_else(|| layout.image.clone());
        self.mounts
            .ensure_attached(&image, &layout.logical, self.tree)
            .await?;

        let kind = entry
            .pending_kind()
            .unwrap_or(OperationKind::Compress);
        let algorithm = entry
            .pending_operation
            .as_ref()
            .and_then(|p| p.algorithm)
            .unwrap_or(self.settings.algorithm);

        loop {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            journal::begin_step(self.ledger, entry, step.index(), step.name()).await?;
            tracing::info!(path = %layout.logical.display(), step = step.name(), %kind, "compression step");
            let detail = match *step {
                CompressStep::Scan => self.scan(entry, layout).await?,
                CompressStep::Apply => self.apply(entry, layout, kind, algorithm).await?,
                CompressStep::Verify => self.verify(entry, layout).await?,
            };
            journal::finish_step(self.ledger, entry, step.name(), detail).await?;
            match step.next() {
                Some(next) => *step = next,
                None => break,
            }
        }

        journal::record(self.ledger, entry, "complete", OperationPhase::Done, None).await?;
        entry.pending_operation = None;
        entry.state = PathState::Packed;
        entry.compressed = kind == OperationKind::Compress;
        entry.algorithm = entry.compressed.then_some(algorithm);
        journal::save(self.ledger, entry).await?;
        tracing::info!(path = %layout.logical.display(), %kind, "compression pass complete");
        Ok(())
    }

    async fn scan(&self, entry: &mut ManagedPath, layout: &PathLayout) -> Result<Option<String>> {
        self.reporter
            .step(&format!("{}: scanning...", layout.logical.display()));
        if !self.settings.verify_compression {
            return Ok(None);
        }
        let fp = self.tree.fingerprint(&layout.logical, self.cancel).await?;
        let detail = format!("fingerprint {}", fp.short());
        if let Some(pending) = entry.pending_operation.as_mut() {
            pending.source_fingerprint = Some(fp);
        }
        journal::save(self.ledger, entry).await?;
        Ok(Some(detail))
    }

    async fn apply(
        &self,
        entry: &mut ManagedPath,
        layout: &PathLayout,
        kind: OperationKind,
        algorithm: CompressionAlgorithm,
    ) -> Result<Option<String>> {
        let verb = if kind == OperationKind::Compress {
            "compressing"
        } else {
            "decompressing"
        };
        self.reporter
            .step(&format!("{}: {verb} files...", layout.logical.display()));

        let cursor = entry
            .pending_operation
            .as_ref()
            .and_then(|p| p.cursor.as_ref())
            .map(PathBuf::from);
        let files: Vec<PathBuf> = self
            .tree
            .scan(&layout.logical)
            .await?
            .into_iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.relative)
            .filter(|rel| cursor.as_ref().is_none_or(|c| rel > c))
            .collect();
        if cursor.is_some() {
            tracing::info!(path = %layout.logical.display(), remaining = files.len(), "resuming after cursor");
        }

        let batch = self.settings.compress_batch.max(1);
        let total = (files.len() as u64).div_ceil(batch as u64);
        for (index, chunk) in files.chunks(batch).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            let absolute: Vec<PathBuf> = chunk.iter().map(|rel| layout.logical.join(rel)).collect();
            let result = if kind == OperationKind::Compress {
                self.backend.compress(&absolute, algorithm).await
            } else {
                self.backend.decompress(&absolute).await
            };
            result.map_err(|e| {
                if classify(&e).is_some() {
                    e
                } else {
                    let detail = format!("{e:#}");
                    e.context(PackError::CompressionFailure {
                        path: layout.logical.clone(),
                        detail,
                    })
                }
            })?;

            if let (Some(pending), Some(last)) = (entry.pending_operation.as_mut(), chunk.last()) {
                pending.cursor = Some(last.to_string_lossy().into_owned());
            }
            journal::save(self.ledger, entry).await?;
            let finished = index as u64 + 1;
            journal::record(
                self.ledger,
                entry,
                CompressStep::Apply.name(),
                OperationPhase::Done,
                Some(format!("batch {finished}/{total}")),
            )
            .await?;
            self.reporter.advance(finished, total);
        }
        Ok(Some(format!("{} files", files.len())))
    }

    async fn verify(&self, entry: &mut ManagedPath, layout: &PathLayout) -> Result<Option<String>> {
        if !self.settings.verify_compression {
            return Ok(None);
        }
        self.reporter
            .step(&format!("{}: verifying content...", layout.logical.display()));
        let actual = self.tree.fingerprint(&layout.logical, self.cancel).await?;
        let expected = entry
            .pending_operation
            .as_ref()
            .and_then(|p| p.source_fingerprint.clone());
        if let Some(expected) = expected.filter(|e| *e != actual) {
            return Err(PackError::VerificationFailed {
                path: layout.logical.clone(),
                expected: expected.short().to_string(),
                actual: actual.short().to_string(),
            }
            .into());
        }
        let detail = format!("fingerprint {}", actual.short());
        entry.content_fingerprint = Some(actual);
        Ok(Some(detail))
    }

    /// Abandon an interrupted pass. Already-processed files stay as they
    /// are; the `compressed` flag keeps its previous value.
    pub async fn recover(&self, entry: &mut ManagedPath) -> Result<()> {
        let step = entry
            .pending_operation
            .as_ref()
            .map_or("scan", |p| CompressStep::name_of(p.step));
        journal::record(self.ledger, entry, step, OperationPhase::RolledBack, None).await?;
        entry.pending_operation = None;
        entry.state = PathState::Packed;
        journal::save(self.ledger, entry).await
    }
}
