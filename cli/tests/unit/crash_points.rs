//! A kill right after every pack and unpack checkpoint. The next run and
//! `recover` must each settle on the state before or after the operation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;

use afpack_cli::application::ports::StateLedger;
use afpack_cli::application::services::orchestrator::{PackOptions, PackOutcome, RecoverOutcome};
use afpack_cli::domain::lifecycle::{PackStep, Step, UnpackStep};
use afpack_common::{Fingerprint, OperationKind, PathState};

use crate::fakes::{Harness, KillAtStep, RecordingReporter};

/// Drive `op` until it parks on the armed kill switch, then drop it.
async fn kill<F: Future>(h: &Harness, op: F) {
    tokio::select! {
        biased;
        () = h.freeze.parked() => {}
        _ = op => panic!("operation finished before the kill point"),
    }
    h.freeze.thaw();
}

fn nth(index: u32) -> usize {
    usize::try_from(index).unwrap() + 1
}

async fn assert_checkpoint(h: &Harness, path: &Path, state: PathState, kind: OperationKind, index: u32) {
    let entry = h.ledger().get(path).await.unwrap().expect("entry");
    assert_eq!(entry.state, state);
    let pending = entry.pending_operation.expect("pending operation");
    assert_eq!(pending.kind, kind);
    assert_eq!(pending.step, index);
}

async fn killed_pack(h: &Harness, path: &Path, step: PackStep) {
    let orch = h.orchestrator();
    let reporter = KillAtStep::new(&h.freeze, nth(step.index()));
    kill(h, orch.pack(path, &PackOptions::default(), &reporter)).await;
    assert_checkpoint(h, path, PathState::Packing, OperationKind::Pack, step.index()).await;
}

async fn killed_unpack(h: &Harness, path: &Path, step: UnpackStep) {
    h.orchestrator()
        .pack(path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect("pack");
    let orch = h.orchestrator();
    let reporter = KillAtStep::new(&h.freeze, nth(step.index()));
    kill(h, orch.unpack(path, &reporter)).await;
    assert_checkpoint(h, path, PathState::Unpacking, OperationKind::Unpack, step.index()).await;
}

/// Either a plain directory with no entry and no image, or a Packed entry
/// whose image is mounted at the path. The content is `before` both ways.
async fn assert_settled(h: &Harness, path: &Path, before: &Fingerprint, step: &str) {
    assert!(
        std::fs::read_dir(path).unwrap().next().is_some(),
        "{step}: logical path is empty"
    );
    assert_eq!(&h.fingerprint(path).await, before, "{step}: content changed");
    let layout = h.layout(path);
    assert!(!layout.trash.exists(), "{step}: trash left behind");
    assert!(!layout.restore.exists(), "{step}: restore dir left behind");
    assert!(!layout.temp_image.exists(), "{step}: temp image left behind");
    assert!(h.image.mounted_image(&layout.staging_mount).is_none());
    match h.ledger().get(path).await.unwrap() {
        None => {
            assert!(h.image.mounted_image(path).is_none(), "{step}: still mounted");
            assert!(!layout.image.exists(), "{step}: image left behind");
        }
        Some(entry) => {
            assert_eq!(entry.state, PathState::Packed, "{step}");
            assert!(entry.pending_operation.is_none(), "{step}");
            assert_eq!(h.image.mounted_image(path), Some(layout.image), "{step}");
        }
    }
}

// ── pack ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pack_killed_after_any_checkpoint_resumes_to_packed() {
    for &step in PackStep::ALL {
        let h = Harness::new();
        let path = h.artifact_dir("node_modules");
        let before = h.fingerprint(&path).await;
        killed_pack(&h, &path, step).await;

        let outcome = h
            .orchestrator()
            .pack(&path, &PackOptions::default(), &RecordingReporter::default())
            .await
            .unwrap_or_else(|e| panic!("{}: {e:#}", step.name()));

        assert!(
            matches!(outcome, PackOutcome::Packed { resumed: true, .. }),
            "{}",
            step.name()
        );
        assert_settled(&h, &path, &before, step.name()).await;
        assert!(h.ledger().get(&path).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn pack_killed_after_any_checkpoint_recovers() {
    for &step in PackStep::ALL {
        let h = Harness::new();
        let path = h.artifact_dir("node_modules");
        let before = h.fingerprint(&path).await;
        killed_pack(&h, &path, step).await;

        let outcome = h
            .orchestrator()
            .recover(&path, &RecordingReporter::default())
            .await
            .unwrap_or_else(|e| panic!("{}: {e:#}", step.name()));

        let forward = matches!(outcome, RecoverOutcome::RolledForward { .. });
        assert_eq!(forward, step == PackStep::DeleteTrash, "{}", step.name());
        assert_settled(&h, &path, &before, step.name()).await;
        assert_eq!(h.ledger().get(&path).await.unwrap().is_some(), forward);
    }
}

// ── unpack ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unpack_killed_after_any_checkpoint_resumes_to_unpacked() {
    for &step in UnpackStep::ALL {
        let h = Harness::new();
        let path = h.artifact_dir("node_modules");
        let before = h.fingerprint(&path).await;
        killed_unpack(&h, &path, step).await;

        let outcome = h
            .orchestrator()
            .unpack(&path, &RecordingReporter::default())
            .await
            .unwrap_or_else(|e| panic!("{}: {e:#}", step.name()));

        assert!(outcome.resumed, "{}", step.name());
        assert_settled(&h, &path, &before, step.name()).await;
        assert!(h.ledger().get(&path).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn unpack_killed_after_any_checkpoint_recovers() {
    for &step in UnpackStep::ALL {
        let h = Harness::new();
        let path = h.artifact_dir("node_modules");
        let before = h.fingerprint(&path).await;
        killed_unpack(&h, &path, step).await;

        let outcome = h
            .orchestrator()
            .recover(&path, &RecordingReporter::default())
            .await
            .unwrap_or_else(|e| panic!("{}: {e:#}", step.name()));

        let forward = matches!(outcome, RecoverOutcome::RolledForward { .. });
        assert_eq!(forward, step == UnpackStep::DeleteImage, "{}", step.name());
        assert_settled(&h, &path, &before, step.name()).await;
        assert_eq!(h.ledger().get(&path).await.unwrap().is_some(), !forward);
    }
}
