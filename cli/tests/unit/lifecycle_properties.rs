//! Property-based tests for the pack/unpack round trip and the admission
//! table.
//!
//! Uses `proptest` to verify invariants across random trees and states.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use proptest::prelude::*;

use afpack_cli::application::services::orchestrator::PackOptions;
use afpack_cli::domain::lifecycle::{Admission, admit};
use afpack_cli::domain::size::{ImageSizing, parse_size};
use afpack_common::{Fingerprint, ManagedPath, OperationKind, PathState, PendingOperation};

use crate::fakes::{Harness, RecordingReporter};

// ============================================================================
// Strategies
// ============================================================================

/// Up to a dozen files spread over a few nested directories.
fn tree() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(
        (
            prop::sample::select(vec!["", "a/", "a/b/", "c/"]),
            "[a-z]{1,8}",
        )
            .prop_map(|(dir, name)| format!("{dir}f_{name}")),
        prop::collection::vec(any::<u8>(), 0..256),
        0..12,
    )
}

fn write_files(root: &Path, files: &BTreeMap<String, Vec<u8>>) {
    std::fs::create_dir_all(root).unwrap();
    for (rel, content) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

fn kind() -> impl Strategy<Value = OperationKind> {
    prop::sample::select(vec![
        OperationKind::Pack,
        OperationKind::Unpack,
        OperationKind::Compress,
        OperationKind::Decompress,
    ])
}

fn state() -> impl Strategy<Value = PathState> {
    prop_oneof![
        Just(PathState::Unpacked),
        Just(PathState::Packing),
        Just(PathState::Packed),
        Just(PathState::Compressing),
        Just(PathState::Decompressing),
        Just(PathState::Unpacking),
        (proptest::option::of(0u32..11)).prop_map(|resume_step| PathState::Failed {
            reason: "injected".to_string(),
            resume_step,
        }),
    ]
}

// ============================================================================
// Round trip
// ============================================================================

struct RoundTrip {
    before: Fingerprint,
    while_packed: Fingerprint,
    after: Fingerprint,
    image_left: bool,
}

fn round_trip(files: &BTreeMap<String, Vec<u8>>, fail_batch: Option<u32>) -> RoundTrip {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    rt.block_on(async {
        let h = Harness::new();
        let path = h.work.path().join("node_modules");
        write_files(&path, files);
        let before = h.fingerprint(&path).await;
        let reporter = RecordingReporter::default();

        if let Some(nth) = fail_batch {
            h.tree.fail_copy_batch(nth);
        }
        if h
            .orchestrator()
            .pack(&path, &PackOptions::default(), &reporter)
            .await
            .is_err()
        {
            h.orchestrator()
                .pack(&path, &PackOptions::default(), &reporter)
                .await
                .expect("retry after injected failure");
        }
        h.tree.clear_copy_failure();
        let while_packed = h.fingerprint(&path).await;

        h.orchestrator()
            .unpack(&path, &reporter)
            .await
            .expect("unpack");
        RoundTrip {
            before,
            while_packed,
            after: h.fingerprint(&path).await,
            image_left: h.layout(&path).image.exists(),
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Packing then unpacking any tree yields an identical tree.
    #[test]
    fn prop_round_trip_preserves_content(files in tree()) {
        let result = round_trip(&files, None);
        prop_assert_eq!(&result.while_packed, &result.before);
        prop_assert_eq!(&result.after, &result.before);
        prop_assert!(!result.image_left);
    }

    /// A copy failure at any batch, followed by a retry, converges on the
    /// same result as an uninterrupted pack.
    #[test]
    fn prop_retry_after_copy_failure_converges(files in tree(), nth in 1u32..8) {
        let result = round_trip(&files, Some(nth));
        prop_assert_eq!(&result.while_packed, &result.before);
        prop_assert_eq!(&result.after, &result.before);
    }
}

// ============================================================================
// Admission table
// ============================================================================

proptest! {
    /// An operation never starts or resumes over a different operation's
    /// pending work.
    #[test]
    fn prop_admit_never_mixes_operations(
        state in state(),
        pending in proptest::option::of((kind(), 0u32..11)),
        requested in kind(),
    ) {
        let mut entry = ManagedPath::new(PathBuf::from("/w/node_modules"));
        entry.state = state;
        entry.pending_operation = pending.map(|(kind, step)| {
            let mut p = PendingOperation::new("op".to_string(), kind);
            p.step = step;
            p
        });

        let result = admit(requested, &entry.logical_path, Some(&entry));
        let other_pending = entry
            .pending_operation
            .as_ref()
            .is_some_and(|p| p.kind != requested);
        if other_pending && (entry.state.is_in_flight() || matches!(entry.state, PathState::Failed { .. })) {
            prop_assert!(result.is_err(), "admitted {requested:?} over {:?}", entry.pending_operation);
        }
        if let Ok(Admission::Resume { .. }) = result {
            prop_assert_eq!(entry.pending_operation.map(|p| p.kind), Some(requested));
        }
    }

    /// Only pack may run on a path without a ledger entry.
    #[test]
    fn prop_unmanaged_paths_only_admit_pack(requested in kind()) {
        let result = admit(requested, Path::new("/w/target"), None);
        prop_assert_eq!(result.is_ok(), requested == OperationKind::Pack);
    }
}

// ============================================================================
// Sizes
// ============================================================================

proptest! {
    /// Binary suffixes multiply exactly.
    #[test]
    fn prop_parse_size_suffixes(n in 0u64..1_000_000, suffix in prop::sample::select(vec![
        ("", 1u64), ("b", 1), ("k", 1 << 10), ("KB", 1 << 10), ("m", 1 << 20), ("G", 1 << 30),
    ])) {
        let (text, multiplier) = suffix;
        prop_assert_eq!(parse_size(&format!("{n}{text}")), Ok(n * multiplier));
    }

    /// Capacity and required space never undercut the content they hold.
    #[test]
    fn prop_sizing_covers_source(source in 0u64..(1 << 50), headroom in 0u64..200, overhead in 0u64..50) {
        let sizing = ImageSizing {
            max_size: 1 << 30,
            headroom_percent: headroom,
            overhead_percent: overhead,
            min_overhead: 64 << 20,
        };
        prop_assert!(sizing.capacity(source) >= source + (64 << 20));
        prop_assert!(sizing.capacity(source) >= 1 << 30);
        prop_assert!(sizing.required_space(source) >= source + (64 << 20));
    }
}
