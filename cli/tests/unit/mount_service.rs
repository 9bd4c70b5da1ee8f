//! Mount ownership: idempotent attach, adopting a mount left by another
//! process, conflicts at an occupied mount point and repeated detach.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use afpack_cli::application::ports::ImageBackend;
use afpack_cli::domain::error::{PackError, classify, exit_code_for};

use crate::fakes::{Harness, write_tree};

fn image(h: &Harness, name: &str) -> PathBuf {
    let image = h.work.path().join(name);
    write_tree(&image, &[("pkg/index.js", "module.exports = 1;\n")]);
    image
}

#[tokio::test]
async fn attach_twice_reuses_the_mount() {
    let h = Harness::new();
    let img = image(&h, "deps.asif");
    let mount_point = h.work.path().join("node_modules");
    let orch = h.orchestrator();

    let first = orch.mounts().attach(&img, &mount_point).await.expect("attach");
    let second = orch.mounts().attach(&img, &mount_point).await.expect("attach again");

    assert_eq!(h.image.calls("attach"), 1);
    assert_eq!(first.device, second.device);
    assert_eq!(second.image, img);
    assert!(mount_point.join("pkg/index.js").is_file());
    assert!(orch.mounts().is_mounted(&mount_point).await.unwrap());
}

#[tokio::test]
async fn fresh_manager_adopts_existing_mount() {
    let h = Harness::new();
    let img = image(&h, "deps.asif");
    let mount_point = h.work.path().join("node_modules");
    h.orchestrator()
        .mounts()
        .attach(&img, &mount_point)
        .await
        .expect("attach");

    let later = h.orchestrator();
    let adopted = later.mounts().attach(&img, &mount_point).await.expect("adopt");

    assert_eq!(h.image.calls("attach"), 1);
    assert_eq!(adopted.image, img);
    assert_eq!(adopted.mount_point, mount_point);
    later.mounts().detach(&adopted).await.expect("detach adopted");
    assert_eq!(h.image.calls("detach"), 1);
    assert!(h.image.mounted_image(&mount_point).is_none());
}

#[tokio::test]
async fn another_image_at_the_mount_point_conflicts() {
    let h = Harness::new();
    let img = image(&h, "deps.asif");
    let other = image(&h, "other.asif");
    let mount_point = h.work.path().join("node_modules");
    let orch = h.orchestrator();
    orch.mounts().attach(&img, &mount_point).await.expect("attach");

    let err = orch
        .mounts()
        .attach(&other, &mount_point)
        .await
        .expect_err("owned by deps.asif");
    assert_eq!(exit_code_for(&err), 7);

    let err = h
        .orchestrator()
        .mounts()
        .attach(&other, &mount_point)
        .await
        .expect_err("mounted by someone else");
    match classify(&err) {
        Some(PackError::MountConflict { detail, .. }) => assert!(detail.contains("deps.asif")),
        other => panic!("expected MountConflict, got {other:?}"),
    }
    assert_eq!(h.image.calls("attach"), 1);
    assert!(other.is_dir());
}

#[tokio::test]
async fn foreign_volume_at_the_mount_point_conflicts() {
    let h = Harness::new();
    let img = image(&h, "deps.asif");
    let mount_point = h.work.path().join("node_modules");
    h.image.mount_foreign(&mount_point, "/dev/disk7s2");

    let err = h
        .orchestrator()
        .mounts()
        .attach(&img, &mount_point)
        .await
        .expect_err("foreign volume");

    match classify(&err) {
        Some(PackError::MountConflict { detail, .. }) => assert!(detail.contains("/dev/disk7s2")),
        other => panic!("expected MountConflict, got {other:?}"),
    }
    assert_eq!(h.image.calls("attach"), 0);
}

#[tokio::test]
async fn detach_twice_is_a_no_op() {
    let h = Harness::new();
    let img = image(&h, "deps.asif");
    let mount_point = h.work.path().join("node_modules");
    let orch = h.orchestrator();
    let handle = orch.mounts().attach(&img, &mount_point).await.expect("attach");

    orch.mounts().detach(&handle).await.expect("detach");
    orch.mounts().detach(&handle).await.expect("detach again");
    orch.mounts()
        .detach_at(&mount_point)
        .await
        .expect("nothing mounted");

    assert_eq!(h.image.calls("detach"), 1);
    assert!(!orch.mounts().is_mounted(&mount_point).await.unwrap());
    assert!(img.join("pkg/index.js").is_file());
}

#[tokio::test]
async fn attach_after_outside_detach_mounts_again() {
    let h = Harness::new();
    let img = image(&h, "deps.asif");
    let mount_point = h.work.path().join("node_modules");
    let orch = h.orchestrator();
    let handle = orch.mounts().attach(&img, &mount_point).await.expect("attach");
    h.image.detach(&handle).await.expect("detached behind our back");

    let again = orch.mounts().attach(&img, &mount_point).await.expect("reattach");

    assert_eq!(h.image.calls("attach"), 2);
    assert_eq!(again.mount_point, mount_point);
    assert!(mount_point.join("pkg/index.js").is_file());
}
