//! JSON output helpers.
//!
//! Every `--json` code path prints exactly one pretty-printed JSON document
//! on stdout: the command's payload on success, an error object on failure.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::application::services::orchestrator::PackOutcome;
use crate::domain::error::{FailureReport, PackError, classify, exit_code_for};

/// Writes command payloads as JSON documents.
pub struct JsonRenderer;

impl JsonRenderer {
    /// Print `value` as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render<T: Serialize + ?Sized>(value: &T) -> Result<()> {
        let out = serde_json::to_string_pretty(value).context("JSON serialization failed")?;
        println!("{out}");
        Ok(())
    }
}

/// Stable machine-readable name of an error class.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    match classify(err) {
        Some(PackError::InsufficientSpace { .. }) => "insufficient_space",
        Some(PackError::Busy { .. }) => "busy",
        Some(PackError::MountConflict { .. }) => "mount_conflict",
        Some(PackError::VerificationFailed { .. }) => "verification_failed",
        Some(PackError::CorruptLedger { .. }) => "corrupt_ledger",
        Some(PackError::PartialMigration { .. }) => "partial_migration",
        Some(PackError::Unsupported(_)) => "unsupported",
        Some(PackError::CompressionFailure { .. }) => "compression_failure",
        Some(PackError::DeviceBusy(_)) => "device_busy",
        Some(PackError::CorruptImage(_)) => "corrupt_image",
        Some(PackError::NotManaged { .. }) => "not_managed",
        Some(PackError::InvalidState { .. }) => "invalid_state",
        Some(PackError::NotADirectory { .. }) => "not_a_directory",
        None => "error",
    }
}

/// Format a JSON error object:
///
/// ```json
/// {
///   "error": true,
///   "message": "...",
///   "code": "busy",
///   "exit_code": 3,
///   "path": "/w/node_modules",
///   "state": "failed",
///   "retry_safe": true
/// }
/// ```
///
/// `path`, `state` and `retry_safe` are present when the failure came from
/// a state-changing command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn format_error(err: &anyhow::Error) -> Result<String> {
    serde_json::to_string_pretty(&error_value(err)).context("JSON serialization failed")
}

/// The error object of [`format_error`] as a JSON value.
#[must_use]
pub fn error_value(err: &anyhow::Error) -> serde_json::Value {
    let mut obj = serde_json::json!({
        "error": true,
        "message": format!("{err:#}"),
        "code": error_code(err),
        "exit_code": exit_code_for(err),
    });
    if let Some(report) = err.downcast_ref::<FailureReport>() {
        obj["path"] = serde_json::json!(report.path);
        obj["state"] = serde_json::json!(report.state.label());
        obj["retry_safe"] = serde_json::json!(report.retry_safe);
        if let afpack_common::PathState::Failed { reason, .. } = &report.state {
            obj["reason"] = serde_json::json!(reason);
        }
    }
    obj
}

/// JSON document for the result of packing one path.
#[must_use]
pub fn pack_value(outcome: &PackOutcome) -> serde_json::Value {
    match outcome {
        PackOutcome::Packed {
            path,
            size_bytes,
            fingerprint,
            compressed,
            resumed,
        } => serde_json::json!({
            "path": path,
            "result": "packed",
            "size_bytes": size_bytes,
            "fingerprint": fingerprint,
            "compressed": compressed,
            "resumed": resumed,
        }),
        PackOutcome::AlreadyPacked { path, compressed } => serde_json::json!({
            "path": path,
            "result": "already_packed",
            "compressed": compressed,
        }),
        PackOutcome::Planned(plan) => serde_json::json!({
            "path": plan.path,
            "result": "dry_run",
            "image": plan.image,
            "entries": plan.entries,
            "source_bytes": plan.source_bytes,
            "capacity": plan.capacity,
            "required_space": plan.required_space,
            "available_space": plan.available_space,
            "fits": plan.fits(),
        }),
        PackOutcome::WouldResume { path, step } => serde_json::json!({
            "path": path,
            "result": "dry_run",
            "resume_step": step,
        }),
    }
}
