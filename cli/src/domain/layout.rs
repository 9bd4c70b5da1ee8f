//! Derived on-disk locations for a managed path.
//!
//! Sibling paths (image, temp image, trash, restore directory) live next to
//! the logical path so that renames between them stay on one volume.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const IMAGE_EXTENSION: &str = "asif";

/// Directories the OS creates at the root of a freshly mounted volume.
pub const VOLUME_METADATA: &[&str] = &[
    ".fseventsd",
    ".Spotlight-V100",
    ".Trashes",
    ".TemporaryItems",
];

/// Directory names `pack` picks up when run without a path.
pub const ARTIFACT_DIRS: &[&str] = &[
    "node_modules",
    "target",
    ".build",
    ".venv",
    "venv",
    "Pods",
    ".gradle",
    "vendor",
];

/// Encode bytes as lowercase hex.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
    }
    out
}

/// Stable ledger key: the first 16 bytes of SHA-256 of the absolute path.
#[must_use]
pub fn ledger_key(logical_path: &Path) -> String {
    let digest = Sha256::digest(logical_path.as_os_str().as_encoded_bytes());
    hex_encode(&digest[..16])
}

/// All paths derived from one logical path and the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    pub logical: PathBuf,
    pub key: String,
    /// `<path>.asif`
    pub image: PathBuf,
    /// `<path>.asif.partial`, renamed to `image` once verified.
    pub temp_image: PathBuf,
    /// `.<name>.afpack-trash`, the moved-aside original.
    pub trash: PathBuf,
    /// `.<name>.afpack-restore`, the unpack staging directory.
    pub restore: PathBuf,
    /// `<state>/mnt/<key>`, the private staging mount point.
    pub staging_mount: PathBuf,
}

impl PathLayout {
    /// Derive the layout for an absolute, normalized `logical` path.
    #[must_use]
    pub fn new(logical: &Path, state_dir: &Path) -> Self {
        let key = ledger_key(logical);
        let name = logical
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("root"));
        let parent = logical.parent().unwrap_or(Path::new("/"));

        let with_suffix = |suffix: &str| {
            let mut s = logical.as_os_str().to_os_string();
            s.push(suffix);
            PathBuf::from(s)
        };
        let hidden = |suffix: &str| {
            let mut s = OsString::from(".");
            s.push(&name);
            s.push(suffix);
            parent.join(s)
        };

        Self {
            logical: logical.to_path_buf(),
            image: with_suffix(&format!(".{IMAGE_EXTENSION}")),
            temp_image: with_suffix(&format!(".{IMAGE_EXTENSION}.partial")),
            trash: hidden(".afpack-trash"),
            restore: hidden(".afpack-restore"),
            staging_mount: state_dir.join("mnt").join(&key),
            key,
        }
    }
}

/// Lexically normalize an absolute path: drop `.`, resolve `..`, strip a
/// trailing separator. Symlinks are not followed.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether a root-level entry name is volume metadata to leave out of copies
/// and fingerprints.
#[must_use]
pub fn is_volume_metadata(name: &str) -> bool {
    VOLUME_METADATA.contains(&name)
}
