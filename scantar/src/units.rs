//! Human-friendly byte sizes and durations.
//!
//! All units are binary: `K` is 1024 bytes, `G` is 1024³.  This matches the way the size cap and
//! in-memory threshold are advertised to operators, so `SIZECAP=2G` caps a segment at exactly
//! 2 GiB of uncompressed payload.

use crate::{error, Result};
use snafu::prelude::*;
use std::time::Duration;

pub(crate) const KIB: u64 = 1024;
pub(crate) const MIB: u64 = 1024 * 1024;
pub(crate) const GIB: u64 = 1024 * 1024 * 1024;
pub(crate) const TIB: u64 = 1024 * 1024 * 1024 * 1024;

/// Parse a byte size like `100`, `512K`, `96KB` or `2G` into bytes.
///
/// The suffix is case-insensitive and the `B` is optional.  A bare integer is a count of bytes.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());

    let (digits, unit) = s.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .ok()
        .context(error::InvalidByteSizeSnafu { input })?;

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => KIB,
        "M" | "MB" => MIB,
        "G" | "GB" => GIB,
        "T" | "TB" => TIB,
        _ => return error::InvalidByteSizeSnafu { input }.fail(),
    };

    value
        .checked_mul(multiplier)
        .context(error::InvalidByteSizeSnafu { input })
}

/// Render a byte count with a binary-unit suffix, e.g. `3.50 MiB`.
pub fn humanize_bytes(bytes: u64) -> String {
    let b = bytes as f64;
    if bytes >= TIB {
        format!("{:.2} TiB", b / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GiB", b / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", b / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", b / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Render a transfer rate over the given interval, e.g. `12.00 MiB/s`.
pub fn humanize_rate(bytes: u64, interval: Duration) -> String {
    if interval.is_zero() {
        return "N/A".to_string();
    }

    let rate = bytes as f64 / interval.as_secs_f64();
    format!("{}/s", humanize_bytes(rate as u64))
}

/// Parse a duration like `90s`, `20m` or `1h`.
///
/// A bare integer is a count of seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());

    let (digits, unit) = s.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .ok()
        .context(error::InvalidDurationSnafu { input })?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        _ => return error::InvalidDurationSnafu { input }.fail(),
    };

    Ok(Duration::from_secs(seconds))
}
