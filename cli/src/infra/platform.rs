//! macOS capability probe implementing the `PlatformProbe` port.

use anyhow::Result;
use semver::Version;

use crate::application::ports::{CommandRunner, PlatformProbe};

/// First macOS release whose `diskutil` can create ASIF images.
pub const MIN_IMAGE_CREATION_MAJOR: u64 = 26;

pub struct MacosProbe<R> {
    runner: R,
}

impl<R: CommandRunner> MacosProbe<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// `sw_vers -productVersion`, `None` off macOS or when unparseable.
    async fn product_version(&self) -> Option<Version> {
        let out = self.runner.run("sw_vers", &["-productVersion"]).await.ok()?;
        if !out.status.success() {
            return None;
        }
        let version = parse_product_version(&String::from_utf8_lossy(&out.stdout));
        tracing::debug!(?version, "detected macOS version");
        version
    }
}

/// Parse `15.4` / `26.0.1` style product versions.
#[must_use]
pub fn parse_product_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut parts: Vec<&str> = raw.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts[..3].join(".")).ok()
}

impl<R: CommandRunner> PlatformProbe for MacosProbe<R> {
    async fn supports_image_creation(&self) -> Result<bool> {
        Ok(self
            .product_version()
            .await
            .is_some_and(|v| v.major >= MIN_IMAGE_CREATION_MAJOR))
    }

    async fn supports_compressed_read(&self) -> Result<bool> {
        Ok(self.product_version().await.is_some())
    }
}
