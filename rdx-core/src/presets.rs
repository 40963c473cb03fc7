//! Named quality, speed and bandwidth-limit levels.
//!
//! Pure data for presentation layers that offer a choice of levels and want
//! to show the current effective value with a familiar label.

/// Target quality levels. `0` is auto.
pub const QUALITY: &[(u8, &str)] = &[
    (0, "Auto"),
    (1, "Lowest"),
    (30, "Low"),
    (50, "Average"),
    (90, "Best"),
    (100, "Lossless"),
];

/// Minimum quality levels.
pub const MIN_QUALITY: &[(u8, &str)] = &[(0, "None"), (30, "Low"), (50, "Average"), (75, "High")];

/// Target speed levels. `0` is auto.
pub const SPEED: &[(u8, &str)] = &[
    (0, "Auto"),
    (1, "Lowest Bandwidth"),
    (30, "Low Bandwidth"),
    (50, "Average"),
    (70, "Low Latency"),
    (100, "Lowest Latency"),
];

/// Minimum speed levels.
pub const MIN_SPEED: &[(u8, &str)] = &[
    (0, "None"),
    (30, "Low Bandwidth"),
    (50, "Average"),
    (70, "Low Latency"),
];

/// Bandwidth-limit choices in megabits per second.
pub const BANDWIDTH_LIMIT_MBPS: &[u32] = &[1, 2, 5, 10, 20, 50, 100];

/// Label of the highest level at or below `value`.
pub fn label(levels: &[(u8, &'static str)], value: u8) -> &'static str {
    levels
        .iter()
        .rev()
        .find(|(v, _)| *v <= value)
        .or_else(|| levels.first())
        .map(|(_, l)| *l)
        .unwrap_or("")
}

/// Bandwidth-limit choices converted to bytes per second.
pub fn bandwidth_limits_bytes() -> Vec<u64> {
    BANDWIDTH_LIMIT_MBPS
        .iter()
        .map(|&mbps| mbps as u64 * 1_000_000 / 8)
        .collect()
}

/// Human-readable bandwidth, e.g. `"2.5 Mbps"`.
pub fn format_bandwidth(bytes_per_sec: u64) -> String {
    let bits = bytes_per_sec as f64 * 8.0;
    if bits >= 1_000_000.0 {
        format!("{:.1} Mbps", bits / 1_000_000.0)
    } else if bits >= 1_000.0 {
        format!("{:.1} Kbps", bits / 1_000.0)
    } else {
        format!("{bits:.0} bps")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_pick_level_at_or_below() {
        assert_eq!(label(QUALITY, 0), "Auto");
        assert_eq!(label(QUALITY, 95), "Best");
        assert_eq!(label(QUALITY, 100), "Lossless");
        assert_eq!(label(SPEED, 69), "Average");
        assert_eq!(label(MIN_QUALITY, 80), "High");
    }

    #[test]
    fn bandwidth_limits() {
        let b = bandwidth_limits_bytes();
        assert_eq!(b.first(), Some(&125_000));
        assert_eq!(b.last(), Some(&12_500_000));
        assert_eq!(format_bandwidth(125_000), "1.0 Mbps");
        assert_eq!(format_bandwidth(100), "800 bps");
    }
}
