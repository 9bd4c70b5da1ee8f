//! Domain types and validators for afpack configuration.
//!
//! Pure functions only: no I/O, no async and no filesystem access.

use std::path::PathBuf;

use afpack_common::CompressionAlgorithm;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;
use crate::domain::size::{ImageSizing, format_size, parse_size};

// ── Constants ────────────────────────────────────────────────────────────────

pub const VALID_CONFIG_KEYS: &[&str] = &[
    "state_dir",
    "image.max_size",
    "image.headroom_percent",
    "image.overhead_percent",
    "image.min_overhead",
    "compression.algorithm",
    "compression.batch_size",
    "compression.verify",
    "copy.batch_size",
];

// ── Config schema ────────────────────────────────────────────────────────────

/// Top-level configuration stored in `~/.afpack/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AfpackConfig {
    /// Ledger, lock and staging-mount root. `~/.afpack` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    pub image: ImageConfig,
    pub compression: CompressionConfig,
    pub copy: CopyConfig,
}

/// Image sizing settings. Sizes are human strings (`10G`, `64M`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImageConfig {
    pub max_size: String,
    pub headroom_percent: u64,
    pub overhead_percent: u64,
    pub min_overhead: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_size: "10G".to_string(),
            headroom_percent: 20,
            overhead_percent: 5,
            min_overhead: "64M".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    /// Files handed to the compression backend per call.
    pub batch_size: usize,
    /// Fingerprint the mounted tree after a compression pass.
    pub verify: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::default(),
            batch_size: 256,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CopyConfig {
    /// Tree entries copied between checkpoints.
    pub batch_size: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

impl AfpackConfig {
    /// Resolve the image sizing policy.
    ///
    /// # Errors
    ///
    /// Returns an error if a size string in the file is malformed.
    pub fn sizing(&self) -> Result<ImageSizing> {
        Ok(ImageSizing {
            max_size: parse_size(&self.image.max_size)?,
            headroom_percent: self.image.headroom_percent,
            overhead_percent: self.image.overhead_percent,
            min_overhead: parse_size(&self.image.min_overhead)?,
        })
    }

    /// Flattened `key = value` view used by `afpack config show`.
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let state_dir = self
            .state_dir
            .as_ref()
            .map_or_else(|| "~/.afpack".to_string(), |p| p.display().to_string());
        let max = parse_size(&self.image.max_size)
            .map_or_else(|_| self.image.max_size.clone(), |b| {
                format!("{} ({})", self.image.max_size, format_size(b))
            });
        vec![
            ("state_dir", state_dir),
            ("image.max_size", max),
            (
                "image.headroom_percent",
                self.image.headroom_percent.to_string(),
            ),
            (
                "image.overhead_percent",
                self.image.overhead_percent.to_string(),
            ),
            ("image.min_overhead", self.image.min_overhead.clone()),
            (
                "compression.algorithm",
                self.compression.algorithm.to_string(),
            ),
            (
                "compression.batch_size",
                self.compression.batch_size.to_string(),
            ),
            ("compression.verify", self.compression.verify.to_string()),
            ("copy.batch_size", self.copy.batch_size.to_string()),
        ]
    }

    /// Apply an already-validated `key = value` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value is invalid.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        validate_config_key(key)?;
        validate_config_value(key, value)?;
        match key {
            "state_dir" => self.state_dir = Some(PathBuf::from(value)),
            "image.max_size" => self.image.max_size = value.to_string(),
            "image.headroom_percent" => self.image.headroom_percent = value.parse()?,
            "image.overhead_percent" => self.image.overhead_percent = value.parse()?,
            "image.min_overhead" => self.image.min_overhead = value.to_string(),
            "compression.algorithm" => {
                self.compression.algorithm = value.parse().map_err(anyhow::Error::msg)?;
            }
            "compression.batch_size" => self.compression.batch_size = value.parse()?,
            "compression.verify" => self.compression.verify = value.parse()?,
            "copy.batch_size" => self.copy.batch_size = value.parse()?,
            _ => anyhow::bail!("Unknown setting: {key}"),
        }
        Ok(())
    }
}

// ── Effective settings ───────────────────────────────────────────────────────

/// Resolved, typed settings handed to the application services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub sizing: ImageSizing,
    pub copy_batch: usize,
    pub compress_batch: usize,
    pub algorithm: CompressionAlgorithm,
    pub verify_compression: bool,
}

impl Settings {
    /// Resolve `config` against an already-chosen state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a size string in the config is malformed.
    pub fn from_config(config: &AfpackConfig, state_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            state_dir,
            sizing: config.sizing()?,
            copy_batch: config.copy.batch_size.max(1),
            compress_batch: config.compression.batch_size.max(1),
            algorithm: config.compression.algorithm,
            verify_compression: config.compression.verify,
        })
    }
}

// ── Validators ───────────────────────────────────────────────────────────────

/// Validates a configuration key against the whitelist.
///
/// # Errors
///
/// Returns an error if the key is not in the allowed list.
pub fn validate_config_key(key: &str) -> Result<()> {
    if !VALID_CONFIG_KEYS.contains(&key) {
        return Err(ConfigError::UnknownKey {
            key: key.to_string(),
            valid: VALID_CONFIG_KEYS.join(", "),
        }
        .into());
    }
    Ok(())
}

/// Validates a configuration value for the given key.
///
/// # Errors
///
/// Returns an error if the value is not valid for the key.
pub fn validate_config_value(key: &str, value: &str) -> Result<()> {
    let expected = match key {
        "image.max_size" | "image.min_overhead" => {
            parse_size(value).is_ok().then_some(()).ok_or("a size such as 10G or 64M")
        }
        "image.headroom_percent" | "image.overhead_percent" => value
            .parse::<u64>()
            .ok()
            .filter(|p| *p <= 1000)
            .map(|_| ())
            .ok_or("an integer percentage between 0 and 1000"),
        "compression.algorithm" => value
            .parse::<CompressionAlgorithm>()
            .map(|_| ())
            .map_err(|_| "one of lzfse, lzvn, zlib"),
        "compression.batch_size" | "copy.batch_size" => value
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .map(|_| ())
            .ok_or("a positive integer"),
        "compression.verify" => value
            .parse::<bool>()
            .map(|_| ())
            .map_err(|_| "true or false"),
        "state_dir" => (!value.trim().is_empty())
            .then_some(())
            .ok_or("a non-empty directory path"),
        _ => Ok(()),
    };
    expected.map_err(|expected| {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
        .into()
    })
}

// ── Unit tests ───────────────────────────────────────────────────────────────
