//! `diskutil`-driven implementation of the `ImageBackend` port.
//!
//! Images are sparse ASIF files holding a single APFS volume. Tool failures
//! are classified from stderr into the domain taxonomy so callers can decide
//! whether a retry is safe.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::application::ports::{CommandRunner, ImageBackend, MountHandle, MountedVolume};
use crate::domain::error::PackError;
use crate::domain::size::diskutil_size;
use crate::infra::command_runner::IMAGE_CMD_TIMEOUT;

static DEVICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(/dev/disk\d+(?:s\d+)?)").expect("valid regex")
});

/// One line of `mount` output: `<device> on <mount point> (<options>)`.
static MOUNT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^(/dev/\S+) on (.+) \(").expect("valid regex")
});

/// Production image backend shelling out to `diskutil` (and `hdiutil info`
/// to map a mounted device back to its image).
pub struct DiskutilBackend<R> {
    runner: R,
}

impl<R: CommandRunner> DiskutilBackend<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn diskutil(&self, args: &[&str]) -> Result<Output> {
        match self
            .runner
            .run_with_timeout("diskutil", args, IMAGE_CMD_TIMEOUT)
            .await
        {
            Ok(out) => Ok(out),
            Err(e) if is_not_found(&e) => {
                Err(PackError::Unsupported("diskutil is not available on this host".into()).into())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<std::io::Error>())
        .any(|e| e.kind() == ErrorKind::NotFound)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

/// Map a failed `diskutil` invocation onto the domain taxonomy.
fn classify_failure(operation: &str, target: &Path, output: &Output) -> anyhow::Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    let lower = detail.to_lowercase();

    let err = if lower.contains("no space") || lower.contains("not enough space") {
        PackError::InsufficientSpace {
            required: 0,
            available: 0,
        }
    } else if lower.contains("busy") || lower.contains("in use") {
        if operation == "attach" {
            PackError::MountConflict {
                mount_point: target.to_path_buf(),
                detail,
            }
        } else {
            PackError::DeviceBusy(format!("{}: {detail}", target.display()))
        }
    } else if lower.contains("corrupt")
        || lower.contains("not recognized")
        || lower.contains("no mountable file systems")
    {
        PackError::CorruptImage(format!("{}: {detail}", target.display()))
    } else if lower.contains("unrecognized verb") || lower.contains("not supported") {
        PackError::Unsupported(format!("diskutil image {operation}: {detail}"))
    } else {
        return anyhow::anyhow!(
            "diskutil {operation} failed for {} ({}): {detail}",
            target.display(),
            output.status
        );
    };
    err.into()
}

/// Volume device named in `diskutil image attach` output (the last
/// `/dev/diskNsM` mentioned, which is the mounted volume).
#[must_use]
pub fn parse_attach_device(stdout: &str) -> Option<String> {
    DEVICE_RE
        .captures_iter(stdout)
        .last()
        .map(|c| c[1].to_string())
}

/// Device mounted at `mount_point` according to `mount` output.
#[must_use]
pub fn parse_mount_table(stdout: &str, mount_point: &Path) -> Option<String> {
    stdout.lines().find_map(|line| {
        let caps = MOUNT_LINE_RE.captures(line)?;
        (Path::new(&caps[2]) == mount_point).then(|| caps[1].to_string())
    })
}

/// Image path backing `device` according to `hdiutil info` output.
#[must_use]
pub fn parse_hdiutil_info(stdout: &str, device: &str) -> Option<PathBuf> {
    let whole = whole_disk(device);
    stdout.split("================================================").find_map(|section| {
        let attached = section.lines().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|dev| dev == whole || dev == device)
        });
        if !attached {
            return None;
        }
        section.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "image-path").then(|| PathBuf::from(value.trim()))
        })
    })
}

/// `/dev/disk5s1` → `/dev/disk5`.
fn whole_disk(device: &str) -> &str {
    let Some(rest) = device.strip_prefix("/dev/disk") else {
        return device;
    };
    match rest.find('s') {
        Some(idx) => &device[..("/dev/disk".len() + idx)],
        None => device,
    }
}

#[cfg(unix)]
async fn is_mount_root(path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if !meta.is_dir() {
        return Ok(false);
    }
    let parent = path.parent().unwrap_or(Path::new("/"));
    let parent_meta = tokio::fs::metadata(parent)
        .await
        .with_context(|| format!("stat {}", parent.display()))?;
    Ok(meta.dev() != parent_meta.dev())
}

#[cfg(not(unix))]
async fn is_mount_root(_path: &Path) -> Result<bool> {
    Ok(false)
}

impl<R: CommandRunner> ImageBackend for DiskutilBackend<R> {
    async fn create(&self, image: &Path, size_bytes: u64) -> Result<()> {
        let size = diskutil_size(size_bytes);
        let target = path_str(image)?;
        tracing::info!(image = %image.display(), size = %size, "creating image");
        let out = self
            .diskutil(&[
                "image", "create", "blank", "--fs", "apfs", "--format", "ASIF", "--size", &size,
                target,
            ])
            .await?;
        if !out.status.success() {
            return Err(classify_failure("create", image, &out));
        }
        Ok(())
    }

    async fn attach(&self, image: &Path, mount_point: &Path) -> Result<MountHandle> {
        tokio::fs::create_dir_all(mount_point)
            .await
            .with_context(|| format!("creating mount point {}", mount_point.display()))?;
        let (img, mp) = (path_str(image)?, path_str(mount_point)?);
        tracing::info!(image = %image.display(), mount_point = %mount_point.display(), "attaching image");
        let out = self
            .diskutil(&["image", "attach", "--mountPoint", mp, img])
            .await?;
        if !out.status.success() {
            return Err(classify_failure("attach", mount_point, &out));
        }
        let device = parse_attach_device(&String::from_utf8_lossy(&out.stdout)).unwrap_or_default();
        Ok(MountHandle {
            image: image.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            device,
        })
    }

    async fn detach(&self, handle: &MountHandle) -> Result<()> {
        let mp = path_str(&handle.mount_point)?;
        tracing::info!(mount_point = %handle.mount_point.display(), device = %handle.device, "detaching image");
        let out = self.diskutil(&["unmount", mp]).await?;
        if !out.status.success() {
            return Err(classify_failure("detach", &handle.mount_point, &out));
        }
        if !handle.device.is_empty() {
            // Unmount succeeded; a leftover attached disk only wastes a device node.
            let whole = whole_disk(&handle.device);
            match self.runner.run("hdiutil", &["detach", whole]).await {
                Ok(out) if !out.status.success() => {
                    tracing::warn!(device = whole, "hdiutil detach failed after unmount");
                }
                Err(e) => tracing::warn!(device = whole, error = %e, "hdiutil detach failed"),
                Ok(_) => {}
            }
        }
        Ok(())
    }

    async fn delete(&self, image: &Path) -> Result<()> {
        tracing::info!(image = %image.display(), "deleting image");
        match tokio::fs::remove_file(image).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", image.display())),
        }
    }

    async fn mounted_at(&self, mount_point: &Path) -> Result<Option<MountedVolume>> {
        if !is_mount_root(mount_point).await? {
            return Ok(None);
        }
        let out = self.runner.run("mount", &[]).await?;
        let table = String::from_utf8_lossy(&out.stdout);
        let device = parse_mount_table(&table, mount_point).unwrap_or_default();

        let image = if device.is_empty() {
            None
        } else {
            match self.runner.run("hdiutil", &["info"]).await {
                Ok(out) if out.status.success() => {
                    parse_hdiutil_info(&String::from_utf8_lossy(&out.stdout), &device)
                }
                _ => None,
            }
        };
        Ok(Some(MountedVolume { device, image }))
    }
}
