//! Pack through the orchestrator: happy path, preflight refusals, dry run
//! and the read-only views.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use afpack_cli::application::ports::{PathLocker, StateLedger};
use afpack_cli::application::services::orchestrator::{PackOptions, PackOutcome};
use afpack_cli::domain::error::{FailureReport, PackError, classify, exit_code_for};
use afpack_common::{CompressionAlgorithm, OperationPhase, PathState};

use crate::fakes::{FixedProbe, Harness, RecordingReporter, TestTree};

#[tokio::test]
async fn pack_mounts_image_with_identical_content() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;
    let reporter = RecordingReporter::default();

    let outcome = h
        .orchestrator()
        .pack(&path, &PackOptions::default(), &reporter)
        .await
        .expect("pack");

    let PackOutcome::Packed {
        size_bytes,
        compressed,
        resumed,
        fingerprint,
        ..
    } = outcome
    else {
        panic!("expected Packed, got {outcome:?}");
    };
    assert_eq!(size_bytes, before.bytes);
    assert!(!compressed);
    assert!(!resumed);
    assert_eq!(fingerprint.as_deref(), Some(before.short()));

    let layout = h.layout(&path);
    assert_eq!(h.image.mounted_image(&path), Some(layout.image.clone()));
    assert_eq!(h.fingerprint(&path).await, before);
    assert!(!layout.trash.exists(), "original must be deleted");
    assert!(!layout.temp_image.exists());
    assert!(!layout.staging_mount.exists());

    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert_eq!(entry.state, PathState::Packed);
    assert!(entry.pending_operation.is_none());
    assert_eq!(entry.backing_image_path, Some(layout.image));
    assert_eq!(entry.content_fingerprint, Some(before));
    assert!(entry.image_capacity > entry.size_bytes);

    let events = reporter.events.lock().unwrap();
    assert!(events.iter().any(|e| e.starts_with("batch ")));
    assert!(events.iter().any(|e| e.ends_with("packed")));
}

#[tokio::test]
async fn pack_logs_intent_before_every_done() {
    let h = Harness::new();
    let path = h.artifact_dir("target");
    let orch = h.orchestrator();
    orch.pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect("pack");

    let log = orch.log(&path).await.expect("log");
    let seqs: Vec<u64> = log.iter().map(|r| r.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);

    let id = &log[0].operation_id;
    assert!(log.iter().all(|r| &r.operation_id == id));

    for step in ["preflight", "create_image", "copy_content", "move_aside", "delete_trash"] {
        let intent = log
            .iter()
            .position(|r| r.step == step && r.phase == OperationPhase::Intent)
            .unwrap_or_else(|| panic!("no intent for {step}"));
        let done = log
            .iter()
            .rposition(|r| r.step == step && r.phase == OperationPhase::Done)
            .unwrap_or_else(|| panic!("no done for {step}"));
        assert!(intent < done, "{step}: intent must precede done");
    }
    let last = log.last().unwrap();
    assert_eq!(last.step, "complete");
    assert_eq!(last.phase, OperationPhase::Done);
}

#[tokio::test]
async fn second_pack_is_a_no_op() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let reporter = RecordingReporter::default();
    h.orchestrator()
        .pack(&path, &PackOptions::default(), &reporter)
        .await
        .expect("first pack");
    let creates = h.image.calls("create");
    let attaches = h.image.calls("attach");

    let outcome = h
        .orchestrator()
        .pack(&path, &PackOptions::default(), &reporter)
        .await
        .expect("second pack");

    assert!(matches!(outcome, PackOutcome::AlreadyPacked { compressed: false, .. }));
    assert_eq!(h.image.calls("create"), creates);
    assert_eq!(h.image.calls("attach"), attaches);
}

#[tokio::test]
async fn pack_refuses_missing_path_and_regular_file() {
    let h = Harness::new();
    let missing = h.work.path().join("nope");
    let file = h.work.path().join("file.txt");
    std::fs::write(&file, "x").unwrap();

    for path in [missing, file] {
        let err = h
            .orchestrator()
            .pack(&path, &PackOptions::default(), &RecordingReporter::default())
            .await
            .expect_err("not a directory");
        assert!(matches!(classify(&err), Some(PackError::NotADirectory { .. })));
        assert!(h.ledger().get(&path).await.unwrap().is_none());
    }
    assert_eq!(h.image.calls("create"), 0);
}

#[tokio::test]
async fn pack_refuses_when_host_volume_is_short_on_space() {
    let mut h = Harness::new();
    h.tree = TestTree::with_available(1024);
    let path = h.artifact_dir("node_modules");
    let before = h.fingerprint(&path).await;

    let err = h
        .orchestrator()
        .pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect_err("insufficient space");

    assert!(matches!(
        classify(&err),
        Some(PackError::InsufficientSpace { available: 1024, .. })
    ));
    assert_eq!(exit_code_for(&err), 4);
    let report = err.downcast_ref::<FailureReport>().expect("report");
    assert_eq!(report.state, PathState::Unpacked);
    assert!(report.retry_safe);
    assert!(h.ledger().get(&path).await.unwrap().is_none());
    assert_eq!(h.image.calls("create"), 0);
    assert_eq!(h.fingerprint(&path).await, before);
}

#[tokio::test]
async fn dry_run_plans_without_side_effects() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let opts = PackOptions {
        dry_run: true,
        ..PackOptions::default()
    };

    let outcome = h
        .orchestrator()
        .pack(&path, &opts, &RecordingReporter::default())
        .await
        .expect("dry run");

    let PackOutcome::Planned(plan) = outcome else {
        panic!("expected a plan, got {outcome:?}");
    };
    assert_eq!(plan.entries, 8);
    assert_eq!(plan.image, h.layout(&path).image);
    assert!(plan.capacity > plan.source_bytes);
    assert!(plan.required_space > plan.source_bytes);
    assert_eq!(plan.available_space, 1 << 40);
    assert!(plan.fits());
    assert!(h.ledger().get(&path).await.unwrap().is_none());
    assert_eq!(h.image.calls("create"), 0);
    assert!(h.image.mounted_image(&path).is_none());
}

#[tokio::test]
async fn pack_is_busy_while_another_operation_holds_the_lock() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let _held = h.locker().try_lock(&path).expect("lock");

    let err = h
        .orchestrator()
        .pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect_err("busy");

    assert!(matches!(classify(&err), Some(PackError::Busy { .. })));
    assert_eq!(exit_code_for(&err), 3);
    assert!(err.downcast_ref::<FailureReport>().expect("report").retry_safe);
    assert!(h.ledger().get(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn pack_is_unsupported_without_image_creation() {
    let mut h = Harness::new();
    h.probe = FixedProbe {
        creation: false,
        compressed_read: false,
    };
    let path = h.artifact_dir("node_modules");

    let err = h
        .orchestrator()
        .pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect_err("unsupported");

    assert!(matches!(classify(&err), Some(PackError::Unsupported(_))));
    assert_eq!(exit_code_for(&err), 6);
    assert!(h.ledger().get(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn pack_refuses_next_to_a_leftover_image() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    std::fs::create_dir(h.layout(&path).image).unwrap();

    let err = h
        .orchestrator()
        .pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect_err("leftover image");

    assert!(matches!(classify(&err), Some(PackError::InvalidState { .. })));
    assert!(h.ledger().get(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn pack_with_compress_chains_a_compression_pass() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let opts = PackOptions {
        compress: Some(CompressionAlgorithm::Zlib),
        dry_run: false,
    };

    let outcome = h
        .orchestrator()
        .pack(&path, &opts, &RecordingReporter::default())
        .await
        .expect("pack");

    assert!(matches!(outcome, PackOutcome::Packed { compressed: true, .. }));
    assert_eq!(h.compression.compressed().len(), 5);
    assert!(
        h.compression
            .algorithms
            .lock()
            .unwrap()
            .iter()
            .all(|a| *a == CompressionAlgorithm::Zlib)
    );
    let entry = h.ledger().get(&path).await.unwrap().expect("entry");
    assert!(entry.compressed);
    assert_eq!(entry.algorithm, Some(CompressionAlgorithm::Zlib));
    assert_eq!(entry.state, PathState::Packed);
}

#[tokio::test]
async fn pack_many_packs_every_path_in_order() {
    let h = Harness::new();
    let a = h.artifact_dir("node_modules");
    let b = h.artifact_dir("target");
    let missing = h.work.path().join(".build");
    let paths = vec![a.clone(), missing.clone(), b.clone()];

    let results = h
        .orchestrator()
        .pack_many(&paths, &PackOptions::default(), &RecordingReporter::default())
        .await;

    assert_eq!(
        results.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
        paths
    );
    assert!(matches!(results[0].1, Ok(PackOutcome::Packed { .. })));
    assert!(results[1].1.is_err());
    assert!(matches!(results[2].1, Ok(PackOutcome::Packed { .. })));
    assert!(h.image.mounted_image(&a).is_some());
    assert!(h.image.mounted_image(&b).is_some());

    let listed = h.orchestrator().list().await.expect("list");
    let logical: Vec<_> = listed.iter().map(|e| e.logical_path.clone()).collect();
    assert_eq!(logical.len(), 2);
    assert!(logical.contains(&a) && logical.contains(&b));
}

#[tokio::test]
async fn status_reports_packed_and_mounted() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let orch = h.orchestrator();
    orch.pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect("pack");

    let status = orch.status(&path).await.expect("status");
    assert_eq!(status.state, PathState::Packed);
    assert!(status.mounted);
    assert!(!status.compressed);
    assert!(status.pending.is_none());
    assert_eq!(status.backing_image, Some(h.layout(&path).image));
    assert_eq!(status.fingerprint.as_deref().map(str::len), Some(12));

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "packed");
    assert_eq!(json["mounted"], true);
}

#[tokio::test]
async fn status_and_log_of_unknown_path_are_not_managed() {
    let h = Harness::new();
    let path = h.work.path().join("elsewhere");
    let orch = h.orchestrator();

    let err = orch.status(&path).await.expect_err("status");
    assert_eq!(exit_code_for(&err), 11);
    let err = orch.log(&path).await.expect_err("log");
    assert!(matches!(classify(&err), Some(PackError::NotManaged { .. })));
}

#[tokio::test]
async fn relative_spellings_resolve_to_the_same_entry() {
    let h = Harness::new();
    let path = h.artifact_dir("node_modules");
    let orch = h.orchestrator();
    orch.pack(&path, &PackOptions::default(), &RecordingReporter::default())
        .await
        .expect("pack");

    let spelled = h.work.path().join("./lib/../node_modules/");
    let status = orch.status(&spelled).await.expect("status");
    assert_eq!(status.path, path);
}

/// Restores the working directory when dropped.
struct CwdGuard(std::path::PathBuf);

impl CwdGuard {
    fn enter(dir: &std::path::Path) -> Self {
        let previous = std::env::current_dir().expect("cwd");
        std::env::set_current_dir(dir).expect("chdir");
        Self(previous)
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.0);
    }
}

#[tokio::test]
#[serial_test::serial(cwd)]
async fn same_relative_path_in_two_projects_packs_both() {
    let h = Harness::new();
    let proj_a = h.work.path().join("projA");
    let proj_b = h.work.path().join("projB");
    let modules_a = h.artifact_dir("projA/node_modules");
    let modules_b = h.artifact_dir("projB/node_modules");
    let before_b = h.fingerprint(&modules_b).await;
    let orch = h.orchestrator();
    let reporter = RecordingReporter::default();
    let relative = std::path::Path::new("./node_modules");

    let outcome_a = {
        let _cwd = CwdGuard::enter(&proj_a);
        orch.pack(relative, &PackOptions::default(), &reporter).await
    };
    let outcome_b = {
        let _cwd = CwdGuard::enter(&proj_b);
        orch.pack(relative, &PackOptions::default(), &reporter).await
    };

    assert!(
        matches!(outcome_a.expect("pack A"), PackOutcome::Packed { ref path, .. } if *path == modules_a)
    );
    assert!(
        matches!(outcome_b.expect("pack B"), PackOutcome::Packed { ref path, .. } if *path == modules_b)
    );
    let entries = orch.list().await.expect("list");
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.state == PathState::Packed));
    assert_eq!(
        h.image.mounted_image(&modules_b),
        Some(proj_b.join("node_modules.asif"))
    );
    assert!(h.image.mounted_image(&modules_a).is_some());
    assert_eq!(h.fingerprint(&modules_b).await, before_b);
}

#[tokio::test]
#[serial_test::serial(cwd)]
async fn parent_relative_path_resolves_to_sibling_project() {
    let h = Harness::new();
    let proj_a = h.work.path().join("projA");
    std::fs::create_dir_all(&proj_a).expect("projA");
    let modules_b = h.artifact_dir("projB/node_modules");
    let orch = h.orchestrator();

    let outcome = {
        let _cwd = CwdGuard::enter(&proj_a);
        orch.pack(
            std::path::Path::new("../projB/node_modules"),
            &PackOptions::default(),
            &RecordingReporter::default(),
        )
        .await
    };

    assert!(matches!(outcome.expect("pack"), PackOutcome::Packed { ref path, .. } if *path == modules_b));
    let status = orch.status(&modules_b).await.expect("status");
    assert!(status.mounted);
}
