//! Local filesystem implementation of the `TreeOps` port.
//!
//! Walks never follow symlinks. Blocking work runs on
//! `tokio::task::spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use afpack_common::Fingerprint;
use anyhow::{Context, Result, bail};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::application::ports::{CancelFlag, EntryKind, PathKind, TreeEntry, TreeOps};
use crate::domain::error::Cancelled;
use crate::domain::layout::{hex_encode, is_volume_metadata, normalize};

/// Entries hashed between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Production filesystem implementation of `TreeOps`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTree;

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .with_context(|| format!("{what} task panicked"))?
}

impl TreeOps for LocalTree {
    async fn absolute(&self, path: &Path) -> Result<PathBuf> {
        let path = path.to_path_buf();
        blocking("resolve", move || absolute_path(&path)).await
    }

    async fn kind(&self, path: &Path) -> Result<PathKind> {
        let path = path.to_path_buf();
        blocking("stat", move || path_kind(&path)).await
    }

    async fn scan(&self, root: &Path) -> Result<Vec<TreeEntry>> {
        let root = root.to_path_buf();
        blocking("scan", move || scan_tree(&root)).await
    }

    async fn copy_entries(&self, src: &Path, dst: &Path, entries: &[TreeEntry]) -> Result<()> {
        let (src, dst, entries) = (src.to_path_buf(), dst.to_path_buf(), entries.to_vec());
        blocking("copy", move || {
            for entry in &entries {
                copy_entry(&src, &dst, entry)?;
            }
            Ok(())
        })
        .await
    }

    async fn finalize_dirs(&self, src: &Path, dst: &Path, entries: &[TreeEntry]) -> Result<()> {
        let (src, dst, entries) = (src.to_path_buf(), dst.to_path_buf(), entries.to_vec());
        blocking("finalize", move || finalize_dirs(&src, &dst, &entries)).await
    }

    async fn fingerprint(&self, root: &Path, cancel: &CancelFlag) -> Result<Fingerprint> {
        let (root, cancel) = (root.to_path_buf(), cancel.clone());
        blocking("fingerprint", move || fingerprint_tree(&root, &cancel)).await
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        let path = path.to_path_buf();
        blocking("statfs", move || {
            let probe = path
                .ancestors()
                .find(|p| p.exists())
                .unwrap_or(Path::new("/"))
                .to_path_buf();
            fs2::available_space(&probe)
                .with_context(|| format!("querying free space on {}", probe.display()))
        })
        .await
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        blocking("mkdir", move || {
            fs::create_dir_all(&path)
                .with_context(|| format!("creating directory {}", path.display()))
        })
        .await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        blocking("rename", move || {
            fs::rename(&from, &to)
                .with_context(|| format!("renaming {} to {}", from.display(), to.display()))
        })
        .await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        blocking("rmdir", move || match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing directory {}", path.display())),
        })
        .await
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        blocking("remove", move || remove_tree(&path)).await
    }
}

// ── Resolve ───────────────────────────────────────────────────────────────────

fn absolute_path(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("reading the working directory")?
            .join(path)
    };
    // A trailing `..` has no name to keep; the whole path must exist then.
    let (target, name) = match (joined.parent(), joined.file_name()) {
        (Some(parent), Some(name)) => (parent.to_path_buf(), Some(name.to_os_string())),
        _ => (joined.clone(), None),
    };
    match fs::canonicalize(&target) {
        Ok(resolved) => Ok(match name {
            Some(name) => resolved.join(name),
            None => resolved,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(normalize(&joined)),
        Err(e) => Err(e).with_context(|| format!("resolving {}", target.display())),
    }
}

// ── Walk ──────────────────────────────────────────────────────────────────────

fn path_kind(path: &Path) -> Result<PathKind> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(PathKind::Directory),
        Ok(_) => Ok(PathKind::Other),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(PathKind::Missing),
        Err(e) => Err(e).with_context(|| format!("inspecting {}", path.display())),
    }
}

fn scan_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() == 1 && e.file_name().to_str().is_some_and(is_volume_metadata))
        });

    let mut entries = Vec::new();
    for item in walker {
        let item = item.with_context(|| format!("walking {}", root.display()))?;
        let relative = item
            .path()
            .strip_prefix(root)
            .context("failed to relativize path")?
            .to_path_buf();
        let file_type = item.file_type();
        let (kind, size) = if file_type.is_dir() {
            (EntryKind::Dir, 0)
        } else if file_type.is_symlink() {
            (EntryKind::Symlink, 0)
        } else if file_type.is_file() {
            let meta = item
                .metadata()
                .with_context(|| format!("reading metadata of {}", item.path().display()))?;
            (EntryKind::File, meta.len())
        } else {
            bail!(
                "{} is a special file (socket, fifo or device) and cannot be packed",
                item.path().display()
            );
        };
        entries.push(TreeEntry {
            relative,
            kind,
            size,
        });
    }
    Ok(entries)
}

// ── Copy ──────────────────────────────────────────────────────────────────────

fn copy_entry(src_root: &Path, dst_root: &Path, entry: &TreeEntry) -> Result<()> {
    let src = src_root.join(&entry.relative);
    let dst = dst_root.join(&entry.relative);
    let meta = fs::symlink_metadata(&src)
        .with_context(|| format!("reading metadata of {}", src.display()))?;

    match entry.kind {
        EntryKind::Dir => {
            fs::create_dir_all(&dst)
                .with_context(|| format!("creating directory {}", dst.display()))?;
        }
        EntryKind::File => {
            remove_if_present(&dst)?;
            fs::copy(&src, &dst)
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            apply_owner(&dst, &meta)?;
            filetime::set_file_times(
                &dst,
                FileTime::from_last_access_time(&meta),
                FileTime::from_last_modification_time(&meta),
            )
            .with_context(|| format!("setting times on {}", dst.display()))?;
        }
        EntryKind::Symlink => {
            remove_if_present(&dst)?;
            let target = fs::read_link(&src)
                .with_context(|| format!("reading symlink {}", src.display()))?;
            make_symlink(&target, &dst)?;
            apply_owner(&dst, &meta)?;
            filetime::set_symlink_file_times(
                &dst,
                FileTime::from_last_access_time(&meta),
                FileTime::from_last_modification_time(&meta),
            )
            .with_context(|| format!("setting times on {}", dst.display()))?;
        }
    }
    Ok(())
}

fn finalize_dirs(src_root: &Path, dst_root: &Path, entries: &[TreeEntry]) -> Result<()> {
    let dirs = entries
        .iter()
        .rev()
        .filter(|e| e.kind == EntryKind::Dir)
        .map(|e| e.relative.as_path())
        .chain(std::iter::once(Path::new("")));
    for relative in dirs {
        let src = src_root.join(relative);
        let dst = dst_root.join(relative);
        let meta =
            fs::metadata(&src).with_context(|| format!("reading metadata of {}", src.display()))?;
        fs::set_permissions(&dst, meta.permissions())
            .with_context(|| format!("setting permissions on {}", dst.display()))?;
        apply_owner(&dst, &meta)?;
        filetime::set_file_times(
            &dst,
            FileTime::from_last_access_time(&meta),
            FileTime::from_last_modification_time(&meta),
        )
        .with_context(|| format!("setting times on {}", dst.display()))?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => remove_tree(path),
        Ok(_) => fs::remove_file(path).with_context(|| format!("removing {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("inspecting {}", path.display())),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("creating symlink {}", link.display()))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<()> {
    bail!("cannot recreate symlink {} on this platform", link.display())
}

/// Copy ownership. Unprivileged users cannot give files away; that is fine
/// because the copy already belongs to them.
#[cfg(unix)]
fn apply_owner(path: &Path, meta: &fs::Metadata) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    match std::os::unix::fs::lchown(path, Some(meta.uid()), Some(meta.gid())) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(()),
        Err(e) => Err(e).with_context(|| format!("changing owner of {}", path.display())),
    }
}

#[cfg(not(unix))]
fn apply_owner(_path: &Path, _meta: &fs::Metadata) -> Result<()> {
    Ok(())
}

// ── Remove ────────────────────────────────────────────────────────────────────

fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            // Read-only directories block unlinking their children.
            make_dirs_writable(path);
            fs::remove_dir_all(path).with_context(|| format!("removing {}", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

#[cfg(unix)]
fn make_dirs_writable(root: &Path) {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mode = meta.permissions().mode() | 0o700;
            let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode));
        }
    }
}

#[cfg(not(unix))]
fn make_dirs_writable(_root: &Path) {}

// ── Fingerprint ───────────────────────────────────────────────────────────────

fn fingerprint_tree(root: &Path, cancel: &CancelFlag) -> Result<Fingerprint> {
    let entries = scan_tree(root)?;
    let mut manifest = Sha256::new();
    let mut fp = Fingerprint {
        digest: String::new(),
        files: 0,
        dirs: 0,
        symlinks: 0,
        bytes: 0,
    };

    for (i, entry) in entries.iter().enumerate() {
        if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let path = root.join(&entry.relative);
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        let (tag, content) = match entry.kind {
            EntryKind::Dir => {
                fp.dirs += 1;
                ("d", String::new())
            }
            EntryKind::Symlink => {
                fp.symlinks += 1;
                let target = fs::read_link(&path)
                    .with_context(|| format!("reading symlink {}", path.display()))?;
                ("l", target.to_string_lossy().into_owned())
            }
            EntryKind::File => {
                fp.files += 1;
                fp.bytes += meta.len();
                ("f", hash_file(&path)?)
            }
        };
        let line = format!(
            "{tag}\0{}\0{:o}\0{}\0{content}\n",
            entry.relative.to_string_lossy(),
            permission_bits(&meta),
            if entry.kind == EntryKind::File { meta.len() } else { 0 },
        );
        manifest.update(line.as_bytes());
    }

    fp.digest = hex_encode(&manifest.finalize());
    Ok(fp)
}

fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).with_context(|| format!("reading {}", path.display()))?;
    hasher.flush().ok();
    Ok(hex_encode(&hasher.finalize()))
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.file_type().is_symlink() {
        // Link modes are not portable across filesystems.
        0
    } else {
        meta.permissions().mode() & 0o7777
    }
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}
