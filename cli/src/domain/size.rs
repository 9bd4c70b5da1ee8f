//! Size strings and image sizing arithmetic.
//!
//! Pure functions only, no I/O.

use crate::domain::error::SizeError;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Parse a human size string into bytes.
///
/// Accepts a plain byte count or a number with one of the suffixes
/// `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`, `t`/`tb` (case-insensitive, binary
/// multiples). A decimal fraction is allowed with a suffix: `1.5G`.
///
/// # Errors
///
/// Returns [`SizeError::Malformed`] for anything else and
/// [`SizeError::Overflow`] when the result exceeds `u64`.
pub fn parse_size(input: &str) -> Result<u64, SizeError> {
    let trimmed = input.trim();
    let lower = trimmed.to_ascii_lowercase();
    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, suffix) = lower.split_at(split);
    let malformed = || SizeError::Malformed(input.to_string());

    let multiplier = match suffix.trim_start() {
        "" | "b" => 1,
        "k" | "kb" => KIB,
        "m" | "mb" => MIB,
        "g" | "gb" => GIB,
        "t" | "tb" => TIB,
        _ => return Err(malformed()),
    };

    if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
        return Err(malformed());
    }
    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) if !f.contains('.') => (w, f),
        Some(_) => return Err(malformed()),
        None => (number, ""),
    };
    if !fraction.is_empty() && multiplier == 1 {
        return Err(malformed());
    }

    let overflow = || SizeError::Overflow(input.to_string());
    let whole: u64 = whole.parse().map_err(|_| overflow())?;
    let mut bytes = whole.checked_mul(multiplier).ok_or_else(overflow)?;

    if !fraction.is_empty() {
        // Up to 9 fractional digits keep the intermediate inside u128 comfortably.
        let digits = &fraction[..fraction.len().min(9)];
        let scale = 10u128.pow(u32::try_from(digits.len()).map_err(|_| malformed())?);
        let frac: u128 = digits.parse().map_err(|_| malformed())?;
        let extra = frac * u128::from(multiplier) / scale;
        let extra = u64::try_from(extra).map_err(|_| overflow())?;
        bytes = bytes.checked_add(extra).ok_or_else(overflow)?;
    }
    Ok(bytes)
}

/// Render a byte count for people: `0 B`, `512 B`, `1.2 GB`.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [("TB", TIB), ("GB", GIB), ("MB", MIB), ("KB", KIB)];
    for (unit, scale) in UNITS {
        if bytes >= scale {
            #[allow(clippy::cast_precision_loss)]
            let value = bytes as f64 / scale as f64;
            return format!("{value:.1} {unit}");
        }
    }
    format!("{bytes} B")
}

/// Render a byte count as whole mebibytes for the image tool (`"10240m"`),
/// rounding up.
#[must_use]
pub fn diskutil_size(bytes: u64) -> String {
    format!("{}m", bytes.div_ceil(MIB).max(1))
}

// ── Image sizing ─────────────────────────────────────────────────────────────

/// Sizing policy for new images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSizing {
    /// Sparse capacity floor.
    pub max_size: u64,
    pub headroom_percent: u64,
    pub overhead_percent: u64,
    pub min_overhead: u64,
}

impl ImageSizing {
    /// Capacity of the image created for a tree of `source_bytes`.
    ///
    /// The image is sparse, so a generous capacity costs nothing on disk.
    #[must_use]
    pub fn capacity(&self, source_bytes: u64) -> u64 {
        let grown = source_bytes
            .saturating_add(percent_of(source_bytes, self.headroom_percent))
            .saturating_add(self.min_overhead);
        grown.max(self.max_size)
    }

    /// Free space required on the host volume before packing starts.
    #[must_use]
    pub fn required_space(&self, source_bytes: u64) -> u64 {
        let overhead = percent_of(source_bytes, self.overhead_percent).max(self.min_overhead);
        source_bytes.saturating_add(overhead)
    }
}

fn percent_of(value: u64, percent: u64) -> u64 {
    let scaled = u128::from(value) * u128::from(percent) / 100;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}
