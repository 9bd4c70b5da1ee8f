//! Compress and decompress passes over a packed path.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use afpack_cli::application::ports::StateLedger;
use afpack_cli::application::services::orchestrator::{
    CompressOutcome, PackOptions, RecoverOutcome,
};
use afpack_cli::domain::error::{FailureReport, PackError, classify, exit_code_for};
use afpack_cli::domain::lifecycle::{CompressStep, Step};
use afpack_common::{CompressionAlgorithm, OperationKind, PathState};

use crate::fakes::{FixedProbe, Harness, RecordingReporter};

async fn packed(h: &Harness) -> PathBuf {
    let path = h.artifact_dir("node_modules");
    h.orchestrator()
        .pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect("pack");
    path
}

async fn compress(h: &Harness, path: &Path) -> anyhow::Result<CompressOutcome> {
    h.orchestrator()
        .compress(path, None, &RecordingReporter::default())
        .await
}

fn relative(root: &Path, files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|f| f.strip_prefix(root).unwrap().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn compress_hands_every_file_over_once_in_sorted_order() {
    let h = Harness::new();
    let path = packed(&h).await;
    let before = h.fingerprint(&path).await;

    let outcome = compress(&h, &path).await.expect("compress");

    assert!(matches!(
        outcome,
        CompressOutcome::Done {
            kind: OperationKind::Compress,
            resumed: false,
            ..
        }
    ));
    assert_eq!(
        relative(&path, &h.compression.compressed()),
        ["README.md", "a.js", "empty/.keep", "lib/b.js", "lib/deep/c.json"]
    );
    assert!(
        h.compression
            .algorithms
            .lock()
            .unwrap()
            .iter()
            .all(|a| *a == CompressionAlgorithm::Lzfse)
    );
    assert_eq!(h.fingerprint(&path).await, before);

    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert_eq!(entry.state, PathState::Packed);
    assert!(entry.compressed);
    assert_eq!(entry.algorithm, Some(CompressionAlgorithm::Lzfse));
    assert!(entry.pending_operation.is_none());
}

#[tokio::test]
async fn compress_twice_is_a_no_op() {
    let h = Harness::new();
    let path = packed(&h).await;
    compress(&h, &path).await.expect("compress");
    let handed_over = h.compression.compressed().len();

    let outcome = compress(&h, &path).await.expect("again");

    assert!(matches!(outcome, CompressOutcome::AlreadyDone { .. }));
    assert_eq!(h.compression.compressed().len(), handed_over);
}

#[tokio::test]
async fn decompress_clears_the_flag() {
    let h = Harness::new();
    let path = packed(&h).await;
    let orch = h.orchestrator();

    let untouched = orch
        .decompress(&path, &RecordingReporter::default())
        .await
        .expect("decompress uncompressed");
    assert!(matches!(untouched, CompressOutcome::AlreadyDone { .. }));

    orch.compress(&path, Some(CompressionAlgorithm::Lzvn), &RecordingReporter::default())
        .await
        .expect("compress");
    orch.decompress(&path, &RecordingReporter::default())
        .await
        .expect("decompress");

    assert_eq!(h.compression.decompressed().len(), 5);
    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert!(!entry.compressed);
    assert_eq!(entry.algorithm, None);
    assert_eq!(entry.state, PathState::Packed);
}

#[tokio::test]
async fn backend_failure_keeps_the_cursor_and_resumes_after_it() {
    let h = Harness::new();
    let path = packed(&h).await;
    // Batches of two: [README.md, a.js] [empty/.keep, lib/b.js] [lib/deep/c.json]
    h.compression.fail_at_batch(2);

    let err = compress(&h, &path).await.expect_err("injected failure");

    assert!(matches!(classify(&err), Some(PackError::CompressionFailure { .. })));
    assert_eq!(exit_code_for(&err), 10);
    assert!(err.downcast_ref::<FailureReport>().expect("report").retry_safe);
    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert!(matches!(
        entry.state,
        PathState::Failed { resume_step: Some(s), .. } if s == CompressStep::Apply.index()
    ));
    assert_eq!(
        entry.pending_operation.as_ref().unwrap().cursor.as_deref(),
        Some("a.js")
    );
    assert!(!entry.compressed);

    let outcome = compress(&h, &path).await.expect("resume");

    assert!(matches!(outcome, CompressOutcome::Done { resumed: true, .. }));
    let files = relative(&path, &h.compression.compressed());
    assert_eq!(files.len(), 5);
    assert_eq!(files.iter().collect::<HashSet<_>>().len(), 5, "no file twice");
    assert!(h.ledger().get(&path).await.unwrap().expect("entry").compressed);
}

#[tokio::test]
async fn recover_abandons_an_interrupted_pass() {
    let h = Harness::new();
    let path = packed(&h).await;
    h.compression.fail_at_batch(1);
    compress(&h, &path).await.expect_err("injected failure");

    let outcome = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect("recover");

    assert!(matches!(
        outcome,
        RecoverOutcome::RolledBack {
            state: PathState::Packed,
            ..
        }
    ));
    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert_eq!(entry.state, PathState::Packed);
    assert!(!entry.compressed);
    assert!(entry.pending_operation.is_none());
}

#[tokio::test]
async fn unpack_is_refused_during_a_failed_pass() {
    let h = Harness::new();
    let path = packed(&h).await;
    h.compression.fail_at_batch(1);
    compress(&h, &path).await.expect_err("injected failure");

    let err = h
        .orchestrator()
        .unpack(&path, &RecordingReporter::default())
        .await
        .expect_err("compress pending");
    assert!(matches!(classify(&err), Some(PackError::InvalidState { .. })));
}

#[tokio::test]
async fn compress_is_unsupported_without_compressed_reads() {
    let mut h = Harness::new();
    let path = packed(&h).await;
    h.probe = FixedProbe {
        creation: true,
        compressed_read: false,
    };

    let err = compress(&h, &path).await.expect_err("unsupported");
    assert_eq!(exit_code_for(&err), 6);
    assert!(h.compression.compressed().is_empty());
}

#[tokio::test]
async fn compress_of_unmanaged_path_is_not_managed() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let err = compress(&h, &path).await.expect_err("not managed");
    assert_eq!(exit_code_for(&err), 11);
}

#[tokio::test]
async fn compress_reattaches_an_unmounted_image() {
    use afpack_cli::application::ports::{ImageBackend, MountHandle};

    let h = Harness::new();
    let path = packed(&h).await;
    h.image
        .detach(&MountHandle {
            image: h.layout(&path).image,
            mount_point: path.clone(),
            device: String::new(),
        })
        .await
        .unwrap();

    compress(&h, &path).await.expect("compress");

    assert!(h.image.mounted_image(&path).is_some());
    assert_eq!(h.compression.compressed().len(), 5);
}
