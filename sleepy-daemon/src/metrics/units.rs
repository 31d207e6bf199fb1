//! Human-readable byte sizes as printed by `docker stats` and `zpool list`

use md5::{Digest, Md5};
use tracing::warn;

const KIB: f64 = 1024.0;
const MIB: f64 = 1_048_576.0;
const GIB: f64 = 1_073_741_824.0;
const TIB: f64 = 1_099_511_627_776.0;

/// Parse `docker stats` sizes: `1.5MiB`, `12kB`, `0B`
pub fn parse_bytes(raw: &str) -> u64 {
    let raw = raw.trim();
    const SUFFIXES: &[(&str, f64)] = &[
        ("KiB", KIB),
        ("MiB", MIB),
        ("GiB", GIB),
        ("TiB", TIB),
        ("kB", 1e3),
        ("MB", 1e6),
        ("GB", 1e9),
        ("TB", 1e12),
        ("B", 1.0),
    ];

    for (suffix, factor) in SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            if let Ok(value) = number.trim().parse::<f64>() {
                return (value * factor) as u64;
            }
        }
    }

    warn!("Failed to convert {} to bytes!", raw);
    0
}

/// Parse `zpool list` sizes: `928G`, `1.2T`, `512K`
pub fn parse_short_bytes(raw: &str) -> u64 {
    let raw = raw.trim();
    let Some(unit) = raw.chars().last() else {
        return 0;
    };
    let factor = match unit {
        'B' => 1.0,
        'K' => KIB,
        'M' => MIB,
        'G' => GIB,
        'T' => TIB,
        _ => return raw.parse::<u64>().unwrap_or(0),
    };
    raw[..raw.len() - 1]
        .parse::<f64>()
        .map(|value| (value * factor) as u64)
        .unwrap_or(0)
}

/// Lowercase hex MD5, used for every agent-issued identifier
pub fn stable_id(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}
