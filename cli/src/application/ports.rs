//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and `afpack_common`, never
//! from `crate::infra`, `crate::commands`, or `crate::output`.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use afpack_common::{CompressionAlgorithm, Fingerprint, ManagedPath, OperationRecord};
use anyhow::Result;

use crate::domain::config::AfpackConfig;

// ── Value Types ───────────────────────────────────────────────────────────────

/// An attached image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub image: PathBuf,
    pub mount_point: PathBuf,
    /// Device node backing the volume, e.g. `/dev/disk5s1`.
    pub device: String,
}

/// A volume currently mounted at some path, as seen by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    pub device: String,
    /// Backing image, when the backend can tell.
    pub image: Option<PathBuf>,
}

/// What a filesystem path currently is (symlinks are not followed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    Directory,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One entry of a scanned tree, relative to the scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub relative: PathBuf,
    pub kind: EntryKind,
    /// File length in bytes; zero for directories and symlinks.
    pub size: u64,
}

/// Shared cancellation flag, set by the signal handler and polled by
/// long-running loops between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Collaborator Ports ────────────────────────────────────────────────────────

/// Sparse disk-image lifecycle.
#[allow(async_fn_in_trait)]
pub trait ImageBackend {
    /// Create an empty image of `size_bytes` capacity at `image`.
    ///
    /// Fails with `InsufficientSpace` or `Unsupported`.
    async fn create(&self, image: &Path, size_bytes: u64) -> Result<()>;
    /// Attach `image` with its volume mounted at `mount_point`.
    ///
    /// Fails with `MountConflict` or `CorruptImage`.
    async fn attach(&self, image: &Path, mount_point: &Path) -> Result<MountHandle>;
    /// Unmount and detach. Fails with `DeviceBusy`.
    async fn detach(&self, handle: &MountHandle) -> Result<()>;
    /// Remove the image file.
    async fn delete(&self, image: &Path) -> Result<()>;
    /// Inspect the volume mounted at `mount_point`, if any. No side effects.
    async fn mounted_at(&self, mount_point: &Path) -> Result<Option<MountedVolume>>;
}

/// Transparent filesystem compression. Content-transparent: files read back
/// byte-identical whichever way they are stored.
#[allow(async_fn_in_trait)]
pub trait CompressionBackend {
    async fn compress(&self, files: &[PathBuf], algorithm: CompressionAlgorithm) -> Result<()>;
    async fn decompress(&self, files: &[PathBuf]) -> Result<()>;
}

/// Platform capability checks.
#[allow(async_fn_in_trait)]
pub trait PlatformProbe {
    /// Whether new images can be created (gates `pack`).
    async fn supports_image_creation(&self) -> Result<bool>;
    /// Whether transparently compressed files can be read (gates compression).
    async fn supports_compressed_read(&self) -> Result<bool>;
}

// ── Ledger Port ───────────────────────────────────────────────────────────────

/// Durable store of managed-path snapshots and their operation logs.
///
/// Every write is durable when the future resolves.
#[allow(async_fn_in_trait)]
pub trait StateLedger {
    /// Snapshot for `path`, `None` if unmanaged.
    ///
    /// # Errors
    ///
    /// Fails with `CorruptLedger` when the stored entry cannot be trusted.
    async fn get(&self, path: &Path) -> Result<Option<ManagedPath>>;
    /// Compare-and-swap on `entry.version`; bumps the version on success.
    async fn put(&self, entry: &mut ManagedPath) -> Result<()>;
    /// Append to the operation log; returns the assigned sequence number.
    async fn append_operation(&self, path: &Path, record: OperationRecord) -> Result<u64>;
    /// Drop the snapshot and its operation log.
    async fn remove(&self, path: &Path) -> Result<()>;
    /// Every snapshot, sorted by logical path.
    async fn list_all(&self) -> Result<Vec<ManagedPath>>;
    async fn operations(&self, path: &Path) -> Result<Vec<OperationRecord>>;
}

// ── Locking Ports ─────────────────────────────────────────────────────────────

/// Per-path advisory locks held for the whole of a state-changing operation.
pub trait PathLocker {
    type Guard: Send;
    /// Take the lock for `path` without waiting.
    ///
    /// # Errors
    ///
    /// Fails with `Busy` when another operation holds it.
    fn try_lock(&self, path: &Path) -> Result<Self::Guard>;
}

/// Host-wide critical section around attach/detach.
#[allow(async_fn_in_trait)]
pub trait MountGate {
    type Guard: Send;
    /// Wait for and enter the critical section.
    async fn enter(&self) -> Result<Self::Guard>;
}

// ── Filesystem Port ───────────────────────────────────────────────────────────

/// Tree-level filesystem operations used by the migrator.
#[allow(async_fn_in_trait)]
pub trait TreeOps {
    /// `path` made absolute against the working directory, with symlinks in
    /// its parent resolved. The final component is kept as given since it
    /// may be missing or a mount point.
    async fn absolute(&self, path: &Path) -> Result<PathBuf>;
    async fn kind(&self, path: &Path) -> Result<PathKind>;
    /// Every entry under `root` (excluding `root`) in sorted order, leaving out
    /// volume metadata directories at the root.
    async fn scan(&self, root: &Path) -> Result<Vec<TreeEntry>>;
    /// Copy `entries` from `src` to `dst`, preserving permissions, ownership
    /// where permitted, timestamps and symlinks. Re-copying an entry
    /// overwrites it.
    async fn copy_entries(&self, src: &Path, dst: &Path, entries: &[TreeEntry]) -> Result<()>;
    /// Apply directory permissions and timestamps once all entries are in
    /// place, deepest first, `dst` itself last.
    async fn finalize_dirs(&self, src: &Path, dst: &Path, entries: &[TreeEntry]) -> Result<()>;
    /// Content fingerprint of the tree under `root`.
    async fn fingerprint(&self, root: &Path, cancel: &CancelFlag) -> Result<Fingerprint>;
    /// Free bytes on the volume holding `path`.
    async fn available_space(&self, path: &Path) -> Result<u64>;
    async fn create_dir_all(&self, path: &Path) -> Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Remove an empty directory; a missing path is not an error.
    async fn remove_dir(&self, path: &Path) -> Result<()>;
    /// Remove a tree recursively; a missing path is not an error.
    async fn remove_tree(&self, path: &Path) -> Result<()>;
}

// ── Config Port ───────────────────────────────────────────────────────────────

/// Abstracts configuration persistence.
pub trait ConfigStore {
    /// Load the configuration, returning defaults if no file exists.
    fn load(&self) -> Result<AfpackConfig>;
    /// Persist the configuration.
    fn save(&self, config: &AfpackConfig) -> Result<()>;
    /// Path to the configuration file.
    fn path(&self) -> Result<PathBuf>;
}

// ── Command Runner Port ───────────────────────────────────────────────────────

/// Abstracts process execution so infrastructure can be swapped or mocked.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run a program and capture its output.
    ///
    /// Implementations should delegate to `run_with_timeout` using the
    /// instance's configured default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;
    /// Run a program with a custom timeout override.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// On timeout, the child process must be killed (not left orphaned).
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: std::time::Duration,
    ) -> Result<Output>;
}

// ── Progress Reporting Port ───────────────────────────────────────────────────

/// Abstracts progress reporting so services can emit events without
/// depending on the Presentation layer. Sync trait; no async needed.
pub trait ProgressReporter {
    /// Emit an in-progress step message.
    fn step(&self, message: &str);
    /// Emit a success message.
    fn success(&self, message: &str);
    /// Emit a warning message.
    fn warn(&self, message: &str);
    /// Report batch progress within the current step.
    fn advance(&self, _done: u64, _total: u64) {}
}
