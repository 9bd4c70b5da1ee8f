//! Infrastructure implementation of the `StateLedger` port.
//!
//! `FileLedger` keeps one JSON snapshot and one JSON-lines operation log per
//! managed path under `<state_dir>/ledger/`. Snapshots are replaced with a
//! durable atomic write (temp file, fsync, rename, directory fsync) and all
//! blocking I/O runs on `tokio::task::spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use afpack_common::{LEDGER_SCHEMA, ManagedPath, OperationRecord};
use anyhow::{Context, Result};
use chrono::Utc;

use crate::application::ports::StateLedger;
use crate::domain::error::PackError;
use crate::domain::layout::ledger_key;

const SNAPSHOT_EXT: &str = "json";
const LOG_SUFFIX: &str = ".ops.jsonl";

/// File-backed ledger rooted at `<state_dir>/ledger`.
#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
}

impl FileLedger {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("ledger"),
        }
    }

    /// Directory holding snapshots and logs.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, logical: &Path) -> PathBuf {
        self.root
            .join(format!("{}.{SNAPSHOT_EXT}", ledger_key(logical)))
    }

    fn log_path(&self, logical: &Path) -> PathBuf {
        self.root.join(format!("{}{LOG_SUFFIX}", ledger_key(logical)))
    }

    fn get_sync(&self, logical: &Path) -> Result<Option<ManagedPath>> {
        let path = self.snapshot_path(logical);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading ledger entry {}", path.display()));
            }
        };
        let entry = parse_snapshot(&content, logical)?;
        if entry.logical_path != logical {
            return Err(corrupt(
                logical,
                format!(
                    "entry {} records path {}",
                    path.display(),
                    entry.logical_path.display()
                ),
            ));
        }
        Ok(Some(entry))
    }

    fn put_sync(&self, entry: &ManagedPath) -> Result<ManagedPath> {
        let stored = self.get_sync(&entry.logical_path)?.map_or(0, |e| e.version);
        if stored != entry.version {
            return Err(corrupt(
                &entry.logical_path,
                format!(
                    "stale write: writer holds version {}, ledger has {stored}",
                    entry.version
                ),
            ));
        }
        let mut next = entry.clone();
        next.version = stored + 1;
        next.schema = LEDGER_SCHEMA;
        next.updated_at = Utc::now();
        let content = serde_json::to_vec_pretty(&next).context("serializing ledger entry")?;
        write_atomic(&self.snapshot_path(&next.logical_path), &content)?;
        Ok(next)
    }

    fn append_sync(&self, logical: &Path, mut record: OperationRecord) -> Result<u64> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating ledger directory {}", self.root.display()))?;
        let path = self.log_path(logical);
        let mut file = open_private(&path, OpenOptions::new().create(true).read(true).append(true))?;

        let mut existing = String::new();
        file.read_to_string(&mut existing)
            .with_context(|| format!("reading operation log {}", path.display()))?;
        let last = parse_log(&existing, &path).last().map_or(0, |r| r.seq);
        record.seq = last + 1;

        let mut line = Vec::new();
        // A torn final line from a crash must not swallow the new record.
        if !existing.is_empty() && !existing.ends_with('\n') {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &record).context("serializing operation record")?;
        line.push(b'\n');
        file.write_all(&line)
            .with_context(|| format!("appending to {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", path.display()))?;
        Ok(record.seq)
    }

    fn remove_sync(&self, logical: &Path) -> Result<()> {
        for path in [self.snapshot_path(logical), self.log_path(logical)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("removing {}", path.display()));
                }
            }
        }
        sync_dir(&self.root)
    }

    fn list_sync(&self) -> Result<Vec<ManagedPath>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("listing {}", self.root.display()));
            }
        };
        let mut entries = Vec::new();
        for item in dir {
            let item = item.with_context(|| format!("listing {}", self.root.display()))?;
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key) = name.strip_suffix(&format!(".{SNAPSHOT_EXT}")) else {
                continue;
            };
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading ledger entry {}", path.display()))?;
            let entry = parse_snapshot(&content, &path)?;
            if ledger_key(&entry.logical_path) != key {
                return Err(corrupt(
                    &entry.logical_path,
                    format!("entry stored under foreign key {}", path.display()),
                ));
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.logical_path.cmp(&b.logical_path));
        Ok(entries)
    }

    fn operations_sync(&self, logical: &Path) -> Result<Vec<OperationRecord>> {
        let path = self.log_path(logical);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(parse_log(&content, &path)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("reading operation log {}", path.display())),
        }
    }
}

impl StateLedger for FileLedger {
    async fn get(&self, path: &Path) -> Result<Option<ManagedPath>> {
        let ledger = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || ledger.get_sync(&path))
            .await
            .context("ledger read task panicked")?
    }

    async fn put(&self, entry: &mut ManagedPath) -> Result<()> {
        let ledger = self.clone();
        let snapshot = entry.clone();
        let written = tokio::task::spawn_blocking(move || ledger.put_sync(&snapshot))
            .await
            .context("ledger write task panicked")??;
        *entry = written;
        Ok(())
    }

    async fn append_operation(&self, path: &Path, record: OperationRecord) -> Result<u64> {
        let ledger = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || ledger.append_sync(&path, record))
            .await
            .context("ledger append task panicked")?
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let ledger = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || ledger.remove_sync(&path))
            .await
            .context("ledger remove task panicked")?
    }

    async fn list_all(&self) -> Result<Vec<ManagedPath>> {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || ledger.list_sync())
            .await
            .context("ledger list task panicked")?
    }

    async fn operations(&self, path: &Path) -> Result<Vec<OperationRecord>> {
        let ledger = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || ledger.operations_sync(&path))
            .await
            .context("ledger read task panicked")?
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn corrupt(path: &Path, detail: String) -> anyhow::Error {
    PackError::CorruptLedger {
        path: path.to_path_buf(),
        detail,
    }
    .into()
}

fn parse_snapshot(content: &str, origin: &Path) -> Result<ManagedPath> {
    let entry: ManagedPath =
        serde_json::from_str(content).map_err(|e| corrupt(origin, format!("unparseable: {e}")))?;
    if entry.schema > LEDGER_SCHEMA {
        return Err(corrupt(
            origin,
            format!("schema {} is newer than supported {LEDGER_SCHEMA}", entry.schema),
        ));
    }
    Ok(entry)
}

/// Parse an operation log, skipping lines torn by a crash mid-append.
fn parse_log(content: &str, origin: &Path) -> Vec<OperationRecord> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(log = %origin.display(), error = %e, "skipping torn operation record");
                None
            }
        })
        .collect()
}

fn open_private(path: &Path, options: &mut OpenOptions) -> Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// Durable replace: temp file, fsync, rename over `path`, fsync the directory.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = path.with_extension("json.tmp");
    let mut file = open_private(
        &temp_path,
        OpenOptions::new().create(true).write(true).truncate(true),
    )?;
    file.write_all(content)
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("finalizing ledger entry {}", path.display()))?;
    sync_dir(parent)
}

fn sync_dir(dir: &Path) -> Result<()> {
    match File::open(dir) {
        Ok(d) => d
            .sync_all()
            .with_context(|| format!("syncing directory {}", dir.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("opening directory {}", dir.display())),
    }
}
