//! Severity band table shared by the live engine and the strength metrics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// dB margin below the current band's floor that must be crossed before a
/// demotion is considered.
pub const HYSTERESIS_DB: f64 = 2.0;

/// Consecutive qualifying ticks required before promoting to a higher band.
pub const PERSISTENCE_TICKS: u32 = 3;

/// Consecutive sub-hysteresis ticks required before demoting or clearing.
pub const DECAY_TICKS: u32 = 5;

/// One of the five ordered severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrengthBucket {
    L1,
    L2,
    L3,
    L4,
    L5,
}

impl StrengthBucket {
    /// All buckets in ascending severity order.
    pub const ALL: [Self; 5] = [Self::L1, Self::L2, Self::L3, Self::L4, Self::L5];

    pub const fn key(self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
            Self::L4 => "l4",
            Self::L5 => "l5",
        }
    }

    /// Zero-based rank, L1 = 0.
    pub const fn rank(self) -> usize {
        match self {
            Self::L1 => 0,
            Self::L2 => 1,
            Self::L3 => 2,
            Self::L4 => 3,
            Self::L5 => 4,
        }
    }

    /// Minimum strength (dB) for this band.
    pub const fn min_db(self) -> f64 {
        STRENGTH_BANDS[self.rank()].min_db
    }
}

impl fmt::Display for StrengthBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A band's key and lower threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrengthBand {
    pub key: StrengthBucket,
    pub min_db: f64,
}

/// Threshold table, ascending.
pub const STRENGTH_BANDS: [StrengthBand; 5] = [
    StrengthBand { key: StrengthBucket::L1, min_db: 10.0 },
    StrengthBand { key: StrengthBucket::L2, min_db: 16.0 },
    StrengthBand { key: StrengthBucket::L3, min_db: 22.0 },
    StrengthBand { key: StrengthBucket::L4, min_db: 28.0 },
    StrengthBand { key: StrengthBucket::L5, min_db: 34.0 },
];

/// Highest band whose threshold is at or below `db`, or `None` below L1.
pub fn bucket_for_strength(db: f64) -> Option<StrengthBucket> {
    if !db.is_finite() {
        return None;
    }
    STRENGTH_BANDS
        .iter()
        .rev()
        .find(|band| db >= band.min_db)
        .map(|band| band.key)
}

/// Rank of an optional bucket; `-1` stands for "no band".
pub fn band_rank(bucket: Option<StrengthBucket>) -> i32 {
    bucket.map_or(-1, |b| b.rank() as i32)
}

pub fn band_by_key(key: &str) -> Option<StrengthBand> {
    STRENGTH_BANDS.iter().find(|b| b.key.key() == key).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_thresholds() {
        assert_eq!(bucket_for_strength(9.99), None);
        assert_eq!(bucket_for_strength(10.0), Some(StrengthBucket::L1));
        assert_eq!(bucket_for_strength(15.9), Some(StrengthBucket::L1));
        assert_eq!(bucket_for_strength(16.0), Some(StrengthBucket::L2));
        assert_eq!(bucket_for_strength(27.0), Some(StrengthBucket::L3));
        assert_eq!(bucket_for_strength(33.0), Some(StrengthBucket::L4));
        assert_eq!(bucket_for_strength(80.0), Some(StrengthBucket::L5));
        assert_eq!(bucket_for_strength(f64::NAN), None);
    }

    #[test]
    fn test_rank_and_lookup() {
        assert_eq!(band_rank(None), -1);
        assert_eq!(band_rank(Some(StrengthBucket::L3)), 2);
        let band = band_by_key("l4").expect("l4 exists");
        assert!((band.min_db - 28.0).abs() < f64::EPSILON);
        assert!(band_by_key("l9").is_none());
    }

    #[test]
    fn test_bucket_serializes_lowercase() {
        let json = serde_json::to_string(&StrengthBucket::L2).expect("serialize");
        assert_eq!(json, "\"l2\"");
    }
}
