//! Failures and crashes at every interesting point of pack and unpack:
//! in-process repair, resume on retry, and `recover`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;

use afpack_cli::application::ports::{CancelFlag, ImageBackend, MountHandle, StateLedger};
use afpack_cli::application::services::orchestrator::{PackOptions, PackOutcome, RecoverOutcome};
use afpack_cli::domain::error::{FailureReport, PackError, classify, exit_code_for};
use afpack_cli::domain::lifecycle::{PackStep, Step, UnpackStep};
use afpack_common::{OperationKind, OperationPhase, PathState, PendingOperation};

use crate::fakes::{Harness, RecordingReporter};

async fn pack(h: &Harness, path: &Path) -> anyhow::Result<PackOutcome> {
    h.orchestrator()
        .pack(path, &PackOptions::default(), &RecordingReporter::default())
        .await
}

async fn state_of(h: &Harness, path: &Path) -> PathState {
    h.ledger().get(path).await.unwrap().expect("entry").state
}

fn failed_at(step: u32) -> impl Fn(&PathState) -> bool {
    move |state| matches!(state, PathState::Failed { resume_step: Some(s), .. } if *s == step)
}

// ── pack ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn copy_failure_resumes_after_the_last_finished_batch() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    h.tree.fail_copy_batch(2);

    let err = pack(&h, &path).await.expect_err("injected copy failure");

    assert!(matches!(classify(&err), Some(PackError::PartialMigration { .. })));
    assert_eq!(exit_code_for(&err), 9);
    let report = err.downcast_ref::<FailureReport>().expect("report");
    assert!(report.retry_safe);
    assert!(failed_at(PackStep::CopyContent.index())(&report.state));

    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert_eq!(entry.pending_operation.as_ref().unwrap().batches_done, 1);
    assert!(h.image.mounted_image(&path).is_none());
    assert_eq!(h.fingerprint(&path).await, before);

    let outcome = pack(&h, &path).await.expect("resume");

    assert!(matches!(outcome, PackOutcome::Packed { resumed: true, .. }));
    // 4 batches: one before the failure, the failed one, then the last three.
    assert_eq!(h.tree.copy_calls(), 5);
    assert_eq!(h.fingerprint(&path).await, before);
    assert_eq!(state_of(&h, &path).await, PathState::Packed);
}

#[tokio::test]
async fn verification_failure_discards_the_image_and_starts_over() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    h.tree.corrupt_next_copy();

    let err = pack(&h, &path).await.expect_err("verification");

    assert!(matches!(classify(&err), Some(PackError::VerificationFailed { .. })));
    assert_eq!(exit_code_for(&err), 5);
    assert!(!err.downcast_ref::<FailureReport>().expect("report").retry_safe);
    let layout = h.layout(&path);
    assert!(!layout.temp_image.exists());
    assert!(!layout.image.exists());
    assert!(h.image.mounted_image(&layout.staging_mount).is_none());
    assert!(matches!(
        state_of(&h, &path).await,
        PathState::Failed { resume_step: None, .. }
    ));
    assert_eq!(h.fingerprint(&path).await, before);

    let outcome = pack(&h, &path).await.expect("fresh pack");
    assert!(matches!(outcome, PackOutcome::Packed { resumed: false, .. }));
    assert_eq!(h.fingerprint(&path).await, before);
}

#[tokio::test]
async fn attach_failure_in_swap_window_restores_the_original() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    // First attach is the staging volume, second the logical path.
    h.image.fail_at("attach", 2);

    let err = pack(&h, &path).await.expect_err("injected attach failure");

    assert_eq!(exit_code_for(&err), 9);
    let layout = h.layout(&path);
    assert!(path.is_dir());
    assert!(!layout.trash.exists());
    assert!(h.image.mounted_image(&path).is_none());
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(failed_at(PackStep::MoveAside.index())(&state_of(&h, &path).await));

    let creates = h.image.calls("create");
    let outcome = pack(&h, &path).await.expect("resume");

    assert!(matches!(outcome, PackOutcome::Packed { resumed: true, .. }));
    assert_eq!(h.image.calls("create"), creates, "verified image is reused");
    assert_eq!(h.image.mounted_image(&path), Some(layout.image));
    assert_eq!(h.fingerprint(&path).await, before);
}

#[tokio::test]
async fn source_changed_after_verification_rebuilds_the_image() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    h.image.fail_at("attach", 2);
    pack(&h, &path).await.expect_err("injected attach failure");

    std::fs::write(path.join("a.js"), "console.log('edited');\n").unwrap();
    let edited = h.fingerprint(&path).await;
    let reporter = RecordingReporter::default();

    h.orchestrator()
        .pack(&path, &PackOptions::default(), &reporter)
        .await
        .expect("rebuild");

    assert_eq!(h.image.calls("create"), 2);
    assert_eq!(h.fingerprint(&path).await, edited);
    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert_eq!(entry.content_fingerprint, Some(edited));
    assert!(
        reporter
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("warn:") && e.contains("changed since it was verified"))
    );
}

/// Leave the ledger and disk as a process killed right after `MoveAside`
/// would: original in the trash, nothing at the logical path.
async fn crash_after_move_aside(h: &Harness, path: &Path) {
    h.image.fail_at("attach", 2);
    pack(h, path).await.expect_err("injected attach failure");

    let layout = h.layout(path);
    std::fs::rename(path, &layout.trash).unwrap();
    let mut entry = h.ledger().get(path).await.unwrap().expect("entry");
    entry.state = PathState::Packing;
    entry.pending_operation.as_mut().unwrap().step = PackStep::AttachLogical.index();
    h.ledger().put(&mut entry).await.unwrap();
}

#[tokio::test]
async fn crash_inside_swap_window_resumes_on_next_pack() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    crash_after_move_aside(&h, &path).await;
    assert!(!path.exists());

    let status = h.orchestrator().status(&path).await.expect("status");
    assert_eq!(status.state, PathState::Packing);
    assert_eq!(status.pending.as_ref().unwrap().step, "attach_logical");

    let outcome = pack(&h, &path).await.expect("resume");

    assert!(matches!(outcome, PackOutcome::Packed { resumed: true, .. }));
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(!h.layout(&path).trash.exists());
}

#[tokio::test]
async fn recover_rolls_back_a_pack_inside_the_swap_window() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    crash_after_move_aside(&h, &path).await;

    let outcome = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect("recover");

    assert!(matches!(
        outcome,
        RecoverOutcome::RolledBack {
            state: PathState::Unpacked,
            ..
        }
    ));
    let layout = h.layout(&path);
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(!layout.trash.exists());
    assert!(!layout.image.exists());
    assert!(!layout.temp_image.exists());
    assert!(h.ledger().get(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn recover_rolls_back_an_early_pack_failure() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    h.tree.fail_copy_batch(3);
    pack(&h, &path).await.expect_err("injected copy failure");

    let outcome = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect("recover");

    assert!(matches!(outcome, RecoverOutcome::RolledBack { .. }));
    let layout = h.layout(&path);
    assert!(!layout.temp_image.exists());
    assert!(h.image.mounted_image(&layout.staging_mount).is_none());
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(h.ledger().get(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn recover_rolls_forward_when_only_trash_deletion_was_left() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    pack(&h, &path).await.expect("pack");

    let layout = h.layout(&path);
    std::fs::create_dir(&layout.trash).unwrap();
    std::fs::write(layout.trash.join("leftover.js"), "x").unwrap();
    let mut entry = h.ledger().get(&path).await.unwrap().expect("entry");
    let mut pending = PendingOperation::new("op-crashed".to_string(), OperationKind::Pack);
    pending.step = PackStep::DeleteTrash.index();
    pending.source_bytes = entry.size_bytes;
    pending.source_fingerprint = entry.content_fingerprint.clone();
    entry.pending_operation = Some(pending);
    entry.state = PathState::Packing;
    h.ledger().put(&mut entry).await.unwrap();

    let outcome = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect("recover");

    assert!(matches!(
        outcome,
        RecoverOutcome::RolledForward {
            state: PathState::Packed,
            ..
        }
    ));
    assert!(!layout.trash.exists());
    assert_eq!(h.fingerprint(&path).await, before);
    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert_eq!(entry.state, PathState::Packed);
    assert_eq!(entry.content_fingerprint, Some(before));
}

#[tokio::test]
async fn recover_without_pending_operation_does_nothing() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    pack(&h, &path).await.expect("pack");

    let outcome = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect("recover");

    assert!(matches!(
        outcome,
        RecoverOutcome::NothingToDo {
            state: PathState::Packed,
            ..
        }
    ));
}

#[tokio::test]
async fn cancellation_stops_at_a_step_boundary_and_resumes() {
    let mut h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    h.cancel.cancel();

    let err = pack(&h, &path).await.expect_err("cancelled");

    assert_eq!(exit_code_for(&err), 9);
    assert!(matches!(
        state_of(&h, &path).await,
        PathState::Failed { ref reason, resume_step: Some(0) } if reason == "cancelled"
    ));
    assert_eq!(h.fingerprint(&path).await, before);

    h.cancel = CancelFlag::new();
    let outcome = pack(&h, &path).await.expect("resume");
    assert!(matches!(outcome, PackOutcome::Packed { .. }));
}

#[tokio::test]
async fn failure_is_logged_with_its_step() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    h.tree.fail_copy_batch(1);
    pack(&h, &path).await.expect_err("injected copy failure");

    let log = h.orchestrator().log(&path).await.expect("log");
    let last = log.last().unwrap();
    assert_eq!(last.step, "copy_content");
    assert_eq!(last.phase, OperationPhase::Failed);
    assert!(last.detail.as_deref().unwrap().contains("injected copy failure"));
}

// ── unpack ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn detach_failure_keeps_the_image_mounted_and_resumes() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    pack(&h, &path).await.expect("pack");
    h.image.fail_at("detach", 1);

    let err = h
        .orchestrator()
        .unpack(&path, &RecordingReporter::default())
        .await
        .expect_err("injected detach failure");

    assert!(err.downcast_ref::<FailureReport>().expect("report").retry_safe);
    assert!(h.image.mounted_image(&path).is_some());
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(failed_at(UnpackStep::DetachLogical.index())(&state_of(&h, &path).await));

    let outcome = h
        .orchestrator()
        .unpack(&path, &RecordingReporter::default())
        .await
        .expect("resume");

    assert!(outcome.resumed);
    assert!(h.image.mounted_image(&path).is_none());
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(h.ledger().get(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn recover_rolls_back_a_failed_unpack_to_packed() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    pack(&h, &path).await.expect("pack");
    h.image.fail_at("detach", 1);
    h.orchestrator()
        .unpack(&path, &RecordingReporter::default())
        .await
        .expect_err("injected detach failure");

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
    assert!(!h.layout(&path).restore.exists());
    let status = h.orchestrator().status(&path).await.expect("status");
    assert_eq!(status.state, PathState::Packed);
    assert!(status.mounted);
    assert!(status.pending.is_none());
    assert_eq!(h.fingerprint(&path).await, before);
}

#[tokio::test]
async fn recover_rolls_an_unpack_forward_once_the_swap_happened() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    pack(&h, &path).await.expect("pack");
    h.image.fail_at("detach", 1);
    h.orchestrator()
        .unpack(&path, &RecordingReporter::default())
        .await
        .expect_err("injected detach failure");

    // Finish detach and swap by hand, then "crash" before DeleteImage.
    let layout = h.layout(&path);
    h.image
        .detach(&MountHandle {
            image: layout.image.clone(),
            mount_point: path.clone(),
            device: String::new(),
        })
        .await
        .unwrap();
    std::fs::remove_dir(&path).unwrap();
    std::fs::rename(&layout.restore, &path).unwrap();
    let mut entry = h.ledger().get(&path).await.unwrap().expect("entry");
    entry.state = PathState::Unpacking;
    entry.pending_operation.as_mut().unwrap().step = UnpackStep::Swap.index();
    h.ledger().put(&mut entry).await.unwrap();

    let outcome = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect("recover");

    assert!(matches!(
        outcome,
        RecoverOutcome::RolledForward {
            state: PathState::Unpacked,
            ..
        }
    ));
    assert!(!layout.image.exists());
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(h.ledger().get(&path).await.unwrap().is_none());
}

/// Pack, then fail an unpack at `DetachLogical` so the restore copy is
/// verified and the image is still mounted.
async fn unpack_stopped_before_detach(h: &Harness, path: &Path) {
    pack(h, path).await.expect("pack");
    h.image.fail_at("detach", 1);
    h.orchestrator()
        .unpack(path, &RecordingReporter::default())
        .await
        .expect_err("injected detach failure");
}

async fn mark_unpacking_at(h: &Harness, path: &Path, step: UnpackStep) {
    let mut entry = h.ledger().get(path).await.unwrap().expect("entry");
    entry.state = PathState::Unpacking;
    entry.pending_operation.as_mut().unwrap().step = step.index();
    h.ledger().put(&mut entry).await.unwrap();
}

#[tokio::test]
async fn image_is_kept_when_restore_dir_vanished_before_the_swap() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    unpack_stopped_before_detach(&h, &path).await;
    let layout = h.layout(&path);
    std::fs::remove_dir_all(&layout.restore).unwrap();
    mark_unpacking_at(&h, &path, UnpackStep::Swap).await;

    let err = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect_err("nothing restored at the logical path");

    assert!(matches!(classify(&err), Some(PackError::PartialMigration { .. })));
    assert_eq!(exit_code_for(&err), 9);
    assert_eq!(h.image.mounted_image(&path), Some(layout.image));
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(failed_at(UnpackStep::DeleteImage.index())(&state_of(&h, &path).await));
}

#[tokio::test]
async fn image_is_kept_when_the_restored_tree_differs() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    unpack_stopped_before_detach(&h, &path).await;
    let layout = h.layout(&path);
    h.image
        .detach(&MountHandle {
            image: layout.image.clone(),
            mount_point: path.clone(),
            device: String::new(),
        })
        .await
        .unwrap();
    std::fs::remove_dir(&path).unwrap();
    std::fs::rename(&layout.restore, &path).unwrap();
    std::fs::remove_file(path.join("lib/deep/c.json")).unwrap();
    mark_unpacking_at(&h, &path, UnpackStep::Swap).await;

    let err = h
        .orchestrator()
        .unpack(&path, &RecordingReporter::default())
        .await
        .expect_err("restored tree is incomplete");

    assert_eq!(exit_code_for(&err), 9);
    assert!(format!("{err:#}").contains("image was kept"));
    assert!(layout.image.join("lib/deep/c.json").is_file());
    assert!(h.ledger().get(&path).await.unwrap().is_some());
}

#[tokio::test]
async fn recover_of_unmanaged_path_is_not_managed() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let err = h
        .orchestrator()
        .recover(&path, &RecordingReporter::default())
        .await
        .expect_err("not managed");
    assert_eq!(exit_code_for(&err), 11);
}
