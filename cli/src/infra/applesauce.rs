//! `applesauce`-backed implementation of the `CompressionBackend` port.
//!
//! APFS transparent compression is applied file by file; a partially
//! processed batch is harmless since reads are identical either way. The
//! library is synchronous, so each batch runs on
//! `tokio::task::spawn_blocking`. Off macOS every call is `Unsupported`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use afpack_common::CompressionAlgorithm;
use anyhow::Result;

use crate::application::ports::CompressionBackend;

/// Compression level passed to the library.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const LEVEL: u32 = 2;
/// Minimum compression ratio passed to the library.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const MIN_RATIO: f64 = 1.0;

/// Failures the library reports through its progress callbacks.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
#[derive(Clone, Default)]
struct FailureLog(Arc<Mutex<Vec<String>>>);

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
impl FailureLog {
    fn push(&self, failure: String) {
        if let Ok(mut failures) = self.0.lock() {
            failures.push(failure);
        }
    }

    /// `Ok` when the batch went through cleanly.
    fn into_result(self, verb: &str, files: usize) -> Result<()> {
        let failures = self.0.lock().map(|f| f.clone()).unwrap_or_default();
        match failures.as_slice() {
            [] => {
                tracing::debug!(verb, files, "batch processed");
                Ok(())
            }
            [only] => anyhow::bail!("{verb} failed: {only}"),
            [first, rest @ ..] => anyhow::bail!(
                "{verb} failed for {} of {files} files, first: {first}",
                rest.len() + 1
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplesauceBackend;

impl ApplesauceBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::path::{Path, PathBuf};

    use afpack_common::CompressionAlgorithm;
    use anyhow::{Context, Result};
    use applesauce::FileCompressor;
    use applesauce::compressor::Kind;
    use applesauce::progress::{Progress, Task};

    use super::FailureLog;

    pub struct FileTask {
        path: PathBuf,
        log: FailureLog,
    }

    impl Task for FileTask {
        fn increment(&self, _amt: u64) {}

        fn error(&self, message: &str) {
            self.log.push(format!("{}: {message}", self.path.display()));
        }
    }

    impl Progress for FailureLog {
        type Task = FileTask;

        fn error(&self, path: &Path, message: &str) {
            self.push(format!("{}: {message}", path.display()));
        }

        fn file_task(&self, path: &Path, _size: u64) -> FileTask {
            FileTask {
                path: path.to_path_buf(),
                log: self.clone(),
            }
        }
    }

    pub fn kind(algorithm: CompressionAlgorithm) -> Kind {
        match algorithm {
            CompressionAlgorithm::Lzfse => Kind::Lzfse,
            CompressionAlgorithm::Lzvn => Kind::Lzvn,
            CompressionAlgorithm::Zlib => Kind::Zlib,
        }
    }

    /// Run `op` on a fresh compressor off the async runtime.
    pub async fn batch<F>(verb: &'static str, files: &[PathBuf], op: F) -> Result<()>
    where
        F: FnOnce(&mut FileCompressor, &[&Path], &FailureLog) + Send + 'static,
    {
        let files = files.to_vec();
        let count = files.len();
        let log = FailureLog::default();
        let worker_log = log.clone();
        tokio::task::spawn_blocking(move || {
            let paths: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
            op(&mut FileCompressor::new(), &paths, &worker_log);
        })
        .await
        .with_context(|| format!("{verb} task panicked"))?;
        log.into_result(verb, count)
    }
}

#[cfg(target_os = "macos")]
impl CompressionBackend for ApplesauceBackend {
    async fn compress(&self, files: &[PathBuf], algorithm: CompressionAlgorithm) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let kind = macos::kind(algorithm);
        macos::batch("compress", files, move |compressor, paths, log| {
            let _ = compressor.recursive_compress(paths.iter().copied(), kind, MIN_RATIO, LEVEL, log, true);
        })
        .await
    }

    async fn decompress(&self, files: &[PathBuf]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        macos::batch("decompress", files, |compressor, paths, log| {
            let _ = compressor.recursive_decompress(paths.iter().copied(), false, log, true);
        })
        .await
    }
}

#[cfg(not(target_os = "macos"))]
impl CompressionBackend for ApplesauceBackend {
    async fn compress(&self, files: &[PathBuf], _algorithm: CompressionAlgorithm) -> Result<()> {
        unsupported(files)
    }

    async fn decompress(&self, files: &[PathBuf]) -> Result<()> {
        unsupported(files)
    }
}

#[cfg(not(target_os = "macos"))]
fn unsupported(files: &[PathBuf]) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    Err(crate::domain::error::PackError::Unsupported(
        "transparent compression requires macOS".to_string(),
    )
    .into())
}
