//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use std::fmt;
use std::path::PathBuf;

use afpack_common::PathState;
use thiserror::Error;

// ── Exit codes ────────────────────────────────────────────────────────────────

pub const EXIT_UNCLASSIFIED: u8 = 1;
pub const EXIT_BUSY: u8 = 3;
pub const EXIT_INSUFFICIENT_SPACE: u8 = 4;
pub const EXIT_VERIFICATION_FAILED: u8 = 5;
pub const EXIT_UNSUPPORTED: u8 = 6;
pub const EXIT_MOUNT_CONFLICT: u8 = 7;
pub const EXIT_CORRUPT_LEDGER: u8 = 8;
pub const EXIT_PARTIAL_MIGRATION: u8 = 9;
pub const EXIT_COMPRESSION_FAILURE: u8 = 10;
pub const EXIT_NOT_MANAGED: u8 = 11;
pub const EXIT_INVALID_STATE: u8 = 12;
pub const EXIT_DEVICE: u8 = 13;

// ── Lifecycle errors ──────────────────────────────────────────────────────────

/// Failure taxonomy for managed-path operations.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("insufficient space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("'{}' is busy: another afpack operation holds its lock", path.display())]
    Busy { path: PathBuf },

    #[error("mount conflict at '{}': {detail}", mount_point.display())]
    MountConflict { mount_point: PathBuf, detail: String },

    #[error("verification failed for '{}': expected fingerprint {expected}, got {actual}", path.display())]
    VerificationFailed {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("ledger entry for '{}' is unreadable or inconsistent: {detail}. Manual intervention required", path.display())]
    CorruptLedger { path: PathBuf, detail: String },

    #[error("operation on '{}' interrupted at step {step}: {detail}", path.display())]
    PartialMigration {
        path: PathBuf,
        step: String,
        detail: String,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("compression of '{}' incomplete: {detail}", path.display())]
    CompressionFailure { path: PathBuf, detail: String },

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("image is corrupt or unreadable: {0}")]
    CorruptImage(String),

    #[error("'{}' is not managed by afpack", path.display())]
    NotManaged { path: PathBuf },

    #[error("cannot {operation} '{}' while it is {state}", path.display())]
    InvalidState {
        path: PathBuf,
        state: String,
        operation: String,
    },

    #[error("'{}' does not exist or is not a plain directory", path.display())]
    NotADirectory { path: PathBuf },
}

impl PackError {
    /// Process exit code reported by the CLI.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InsufficientSpace { .. } => EXIT_INSUFFICIENT_SPACE,
            Self::Busy { .. } => EXIT_BUSY,
            Self::MountConflict { .. } => EXIT_MOUNT_CONFLICT,
            Self::VerificationFailed { .. } => EXIT_VERIFICATION_FAILED,
            Self::CorruptLedger { .. } => EXIT_CORRUPT_LEDGER,
            Self::PartialMigration { .. } => EXIT_PARTIAL_MIGRATION,
            Self::Unsupported(_) => EXIT_UNSUPPORTED,
            Self::CompressionFailure { .. } => EXIT_COMPRESSION_FAILURE,
            Self::NotManaged { .. } => EXIT_NOT_MANAGED,
            Self::InvalidState { .. } | Self::NotADirectory { .. } => EXIT_INVALID_STATE,
            Self::DeviceBusy(_) | Self::CorruptImage(_) => EXIT_DEVICE,
        }
    }

    /// Whether re-running the same command is safe.
    ///
    /// Integrity failures are never retried without a human looking at them.
    #[must_use]
    pub fn retry_safe(&self) -> bool {
        match self {
            Self::VerificationFailed { .. }
            | Self::CorruptLedger { .. }
            | Self::CorruptImage(_)
            | Self::Unsupported(_)
            | Self::NotManaged { .. }
            | Self::NotADirectory { .. }
            | Self::InvalidState { .. } => false,
            Self::InsufficientSpace { .. }
            | Self::Busy { .. }
            | Self::MountConflict { .. }
            | Self::PartialMigration { .. }
            | Self::CompressionFailure { .. }
            | Self::DeviceBusy(_) => true,
        }
    }

    /// Whether this failure threatens data integrity.
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::VerificationFailed { .. } | Self::CorruptLedger { .. }
        )
    }
}

/// Find the outermost `PackError` in an error chain, whether it is the root
/// cause or was attached as context.
#[must_use]
pub fn classify(err: &anyhow::Error) -> Option<&PackError> {
    err.downcast_ref::<PackError>()
        .or_else(|| err.chain().find_map(|e| e.downcast_ref::<PackError>()))
}

/// Exit code for an arbitrary error chain.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    classify(err).map_or(EXIT_UNCLASSIFIED, PackError::exit_code)
}

/// A long-running loop stopped because the cancellation flag was set.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

// ── Configuration errors ──────────────────────────────────────────────────────

/// Errors from `afpack config set` validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown setting: {key}\n\nValid settings: {valid}")]
    UnknownKey { key: String, valid: String },

    #[error("Invalid value for {key}: {value}\n\nExpected: {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },
}

/// Errors from size-string parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("invalid size '{0}': expected a number with an optional b/k/m/g/t suffix")]
    Malformed(String),

    #[error("size '{0}' does not fit in 64 bits")]
    Overflow(String),
}

// ── Failure report ────────────────────────────────────────────────────────────

/// Context attached to every failed state-changing command: which path, the
/// state it was left in, and whether the same command may be re-run.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub path: PathBuf,
    pub state: PathState,
    pub retry_safe: bool,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hint = if self.retry_safe {
            "re-run the same command to resume"
        } else {
            "do not retry before inspecting it (see `afpack log`)"
        };
        write!(
            f,
            "'{}' left in state {}; {hint}",
            self.path.display(),
            self.state
        )
    }
}
