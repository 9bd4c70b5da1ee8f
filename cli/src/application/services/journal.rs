//! Write-ahead bookkeeping shared by the migrator and compression controller.
//!
//! Every step is persisted as the pending step *before* its side effect
//! starts, then an `Intent` record is appended; a `Done` record follows once
//! the side effect completed.

use afpack_common::{ManagedPath, OperationPhase, OperationRecord, PathState};
use anyhow::Result;
use chrono::Utc;

use crate::application::ports::StateLedger;
use crate::domain::error::{Cancelled, PackError, classify};

/// Persist `entry`, bumping `updated_at`.
pub async fn save(ledger: &impl StateLedger, entry: &mut ManagedPath) -> Result<()> {
    entry.updated_at = Utc::now();
    ledger.put(entry).await
}

/// Append a record for the pending operation of `entry`. No-op without one.
pub async fn record(
    ledger: &impl StateLedger,
    entry: &ManagedPath,
    step: &str,
    phase: OperationPhase,
    detail: Option<String>,
) -> Result<()> {
    let Some(pending) = entry.pending_operation.as_ref() else {
        return Ok(());
    };
    ledger
        .append_operation(
            &entry.logical_path,
            OperationRecord {
                seq: 0,
                at: Utc::now(),
                operation_id: pending.id.clone(),
                kind: pending.kind,
                step: step.to_string(),
                phase,
                detail,
            },
        )
        .await?;
    Ok(())
}

/// Checkpoint `step` as the one about to run, then log the intent.
pub async fn begin_step(
    ledger: &impl StateLedger,
    entry: &mut ManagedPath,
    index: u32,
    name: &str,
) -> Result<()> {
    if let Some(pending) = entry.pending_operation.as_mut() {
        pending.step = index;
    }
    save(ledger, entry).await?;
    record(ledger, entry, name, OperationPhase::Intent, None).await
}

pub async fn finish_step(
    ledger: &impl StateLedger,
    entry: &ManagedPath,
    name: &str,
    detail: Option<String>,
) -> Result<()> {
    record(ledger, entry, name, OperationPhase::Done, detail).await
}

/// Short reason stored in `Failed { reason }`.
#[must_use]
pub fn failure_reason(err: &anyhow::Error) -> String {
    if err.downcast_ref::<Cancelled>().is_some() {
        return "cancelled".to_string();
    }
    match classify(err) {
        Some(PackError::VerificationFailed { .. }) => "verification failed".to_string(),
        Some(PackError::CompressionFailure { .. }) => "compression failed".to_string(),
        Some(PackError::DeviceBusy(_)) => "device busy".to_string(),
        Some(PackError::MountConflict { .. }) => "mount conflict".to_string(),
        Some(PackError::InsufficientSpace { .. }) => "insufficient space".to_string(),
        Some(PackError::CorruptImage(_)) => "corrupt image".to_string(),
        _ => err.root_cause().to_string(),
    }
}

/// Mark `entry` failed at `step`, persist it and classify the error.
///
/// Errors that already carry a `PackError` keep it; anything else becomes a
/// resumable `PartialMigration`.
pub async fn fail(
    ledger: &impl StateLedger,
    entry: &mut ManagedPath,
    step: &str,
    resume_step: Option<u32>,
    err: anyhow::Error,
) -> anyhow::Error {
    let reason = failure_reason(&err);
    tracing::warn!(
        path = %entry.logical_path.display(),
        step,
        reason = %reason,
        error = %format!("{err:#}"),
        "operation failed"
    );
    entry.state = PathState::Failed {
        reason: reason.clone(),
        resume_step,
    };
    if let Err(save_err) = save(ledger, entry).await {
        tracing::error!(error = %save_err, "could not record failure in the ledger");
        return err.context(save_err);
    }
    if let Err(log_err) = record(
        ledger,
        entry,
        step,
        OperationPhase::Failed,
        Some(format!("{err:#}")),
    )
    .await
    {
        tracing::warn!(error = %log_err, "could not append failure record");
    }

    if classify(&err).is_some() {
        return err;
    }
    let path = entry.logical_path.clone();
    err.context(PackError::PartialMigration {
        path,
        step: step.to_string(),
        detail: reason,
    })
}
