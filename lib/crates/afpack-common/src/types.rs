use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger schema version written into every snapshot.
pub const LEDGER_SCHEMA: u32 = 1;

/// Transparent compression algorithm applied to files inside a mounted image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Lzfse,
    Lzvn,
    Zlib,
}

impl CompressionAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lzfse => "lzfse",
            Self::Lzvn => "lzvn",
            Self::Zlib => "zlib",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lzfse" => Ok(Self::Lzfse),
            "lzvn" => Ok(Self::Lzvn),
            "zlib" => Ok(Self::Zlib),
            other => Err(format!("unknown compression algorithm '{other}'")),
        }
    }
}

/// Kind of state-changing operation recorded in the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Pack,
    Unpack,
    Compress,
    Decompress,
}

impl OperationKind {
    /// The CLI verb that resumes an operation of this kind.
    #[must_use]
    pub fn verb(self) -> &'static str {
        match self {
            Self::Pack => "pack",
            Self::Unpack => "unpack",
            Self::Compress => "compress",
            Self::Decompress => "decompress",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Lifecycle state of a managed path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PathState {
    Unpacked,
    Packing,
    Packed,
    Compressing,
    Decompressing,
    Unpacking,
    /// A step failed. `resume_step` is the step a retry starts from; `None`
    /// means the operation was rolled back and a retry starts over.
    Failed {
        reason: String,
        resume_step: Option<u32>,
    },
}

impl PathState {
    /// States that only exist while an operation is running (or was running
    /// when its process died).
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Packing | Self::Unpacking | Self::Compressing | Self::Decompressing
        )
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unpacked => "unpacked",
            Self::Packing => "packing",
            Self::Packed => "packed",
            Self::Compressing => "compressing",
            Self::Decompressing => "decompressing",
            Self::Unpacking => "unpacking",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason, .. } => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Content summary of a directory tree.
///
/// `digest` is a hex SHA-256 over the sorted manifest of relative paths,
/// entry kinds, permission bits, sizes, file contents and symlink targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fingerprint {
    pub digest: String,
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

impl Fingerprint {
    /// Abbreviated digest for display.
    #[must_use]
    pub fn short(&self) -> &str {
        self.digest.get(..12).unwrap_or(&self.digest)
    }
}

/// In-flight operation checkpoint used for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingOperation {
    /// Unique id shared by every operation record of this run.
    pub id: String,
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
    /// Index of the step that is about to run (or was running).
    pub step: u32,
    /// Copy batches fully written to the destination.
    #[serde(default)]
    pub batches_done: u64,
    /// Last relative path processed by a compression pass (sorted order).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_image_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_mount: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trash_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_path: Option<PathBuf>,
    /// Fingerprint of the source tree taken at verification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub source_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<CompressionAlgorithm>,
}

impl PendingOperation {
    #[must_use]
    pub fn new(id: String, kind: OperationKind) -> Self {
        Self {
            id,
            kind,
            started_at: Utc::now(),
            step: 0,
            batches_done: 0,
            cursor: None,
            temp_image_path: None,
            staging_mount: None,
            trash_path: None,
            restore_path: None,
            source_fingerprint: None,
            source_bytes: 0,
            algorithm: None,
        }
    }
}

/// Durable snapshot of one managed path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedPath {
    pub schema: u32,
    /// Incremented by every successful ledger `put`.
    pub version: u64,
    pub logical_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_image_path: Option<PathBuf>,
    #[serde(flatten)]
    pub state: PathState,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<CompressionAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub image_capacity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_operation: Option<PendingOperation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedPath {
    /// A fresh, never-persisted entry for `logical_path`.
    #[must_use]
    pub fn new(logical_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            schema: LEDGER_SCHEMA,
            version: 0,
            logical_path,
            backing_image_path: None,
            state: PathState::Unpacked,
            compressed: false,
            algorithm: None,
            content_fingerprint: None,
            size_bytes: 0,
            image_capacity: 0,
            pending_operation: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Kind of the operation that is in flight or failed, if any.
    #[must_use]
    pub fn pending_kind(&self) -> Option<OperationKind> {
        self.pending_operation.as_ref().map(|p| p.kind)
    }
}

/// Phase of an operation record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    /// Written before the side effect starts.
    Intent,
    /// Written after the side effect completed.
    Done,
    Failed,
    RolledBack,
}

/// Append-only log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub operation_id: String,
    pub kind: OperationKind,
    pub step: String,
    pub phase: OperationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Summary of an in-flight or failed operation for status output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingSummary {
    pub kind: OperationKind,
    pub step: String,
    pub started_at: DateTime<Utc>,
}

/// `afpack status` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutput {
    pub path: PathBuf,
    #[serde(flatten)]
    pub state: PathState,
    pub compressed: bool,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_image: Option<PathBuf>,
    pub mounted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingSummary>,
}
