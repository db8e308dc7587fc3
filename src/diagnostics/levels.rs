//! Dominant active band per source, per sensor and per physical location.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::tracker::{TrackerKey, TrackerLevelState};
use super::SILENCE_DB;
use crate::orders::{MatrixSource, OrderClass};
use crate::strength::StrengthBucket;

/// Strongest banded tracker feeding one dwell-matrix source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveLevel {
    #[serde(rename = "bucket_key")]
    pub bucket: StrengthBucket,
    pub strength_db: f64,
    pub sensor_label: String,
    pub sensor_location: String,
    #[serde(rename = "class_key")]
    pub class: OrderClass,
    pub peak_hz: f64,
}

/// Strongest banded tracker of one sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorLevel {
    #[serde(rename = "bucket_key")]
    pub bucket: StrengthBucket,
    pub strength_db: f64,
    #[serde(rename = "class_key")]
    pub class: OrderClass,
    pub peak_hz: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationCandidate {
    pub sensor_id: String,
    pub sensor_label: String,
    pub bucket: StrengthBucket,
    pub strength_db: f64,
    pub class: OrderClass,
    pub peak_hz: f64,
}

/// Aggregated band of one location with its agreement confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationLevel {
    #[serde(rename = "bucket_key")]
    pub bucket: StrengthBucket,
    pub strength_db: f64,
    pub sensor_label: String,
    pub sensor_location: String,
    #[serde(rename = "class_key")]
    pub class: OrderClass,
    pub peak_hz: f64,
    /// `1 + (agreeing sensors - 1)`.
    pub confidence: f64,
    pub agreement_count: usize,
    pub sensor_count: usize,
}

/// Replace the level of every source `level.class` feeds if `level` is stronger.
pub fn upsert_active_level(by_source: &mut BTreeMap<MatrixSource, ActiveLevel>, level: &ActiveLevel) {
    for source in level.class.sources() {
        match by_source.get(source) {
            Some(existing) if existing.strength_db >= level.strength_db => {}
            _ => {
                by_source.insert(*source, level.clone());
            }
        }
    }
}

pub fn upsert_sensor_level(by_sensor: &mut BTreeMap<String, SensorLevel>, sensor_id: &str, level: SensorLevel) {
    match by_sensor.get(sensor_id) {
        Some(existing) if existing.strength_db >= level.strength_db => {}
        _ => {
            by_sensor.insert(sensor_id.to_string(), level);
        }
    }
}

/// Trimmed location, `None` when blank.
pub fn location_key(sensor_location: &str) -> Option<&str> {
    let key = sensor_location.trim();
    (!key.is_empty()).then_some(key)
}

/// Fold every banded sensor tracker into the three level views.
pub fn collect_from_trackers(
    trackers: &BTreeMap<TrackerKey, TrackerLevelState>,
    by_source: &mut BTreeMap<MatrixSource, ActiveLevel>,
    by_sensor: &mut BTreeMap<String, SensorLevel>,
    candidates: &mut BTreeMap<String, Vec<LocationCandidate>>,
) {
    for (key, tracker) in trackers {
        let Some(bucket) = tracker.current_bucket() else {
            continue;
        };
        upsert_active_level(
            by_source,
            &ActiveLevel {
                bucket,
                strength_db: tracker.last_strength_db,
                sensor_label: tracker.last_sensor_label.clone(),
                sensor_location: tracker.last_sensor_location.clone(),
                class: key.class,
                peak_hz: tracker.last_peak_hz,
            },
        );
        upsert_sensor_level(
            by_sensor,
            &key.sensor_id,
            SensorLevel {
                bucket,
                strength_db: tracker.last_strength_db,
                class: key.class,
                peak_hz: tracker.last_peak_hz,
            },
        );
        if let Some(location) = location_key(&tracker.last_sensor_location) {
            candidates.entry(location.to_string()).or_default().push(LocationCandidate {
                sensor_id: key.sensor_id.clone(),
                sensor_label: tracker.last_sensor_label.clone(),
                bucket,
                strength_db: tracker.last_strength_db,
                class: key.class,
                peak_hz: tracker.last_peak_hz,
            });
        }
    }
}

fn agreement_bin(candidate: &LocationCandidate, freq_bin_hz: f64) -> (OrderClass, StrengthBucket, i64) {
    let bin = (candidate.peak_hz / freq_bin_hz.max(0.01)).round() as i64;
    (candidate.class, candidate.bucket, bin)
}

/// Dominant candidate per location, with confidence from the number of
/// distinct sensors agreeing on its class, band and frequency bin.
pub fn build_levels_by_location(
    candidates: &BTreeMap<String, Vec<LocationCandidate>>,
    freq_bin_hz: f64,
) -> BTreeMap<String, LocationLevel> {
    let mut by_location = BTreeMap::new();
    for (location, rows) in candidates {
        let Some(dominant) = rows.iter().max_by(|a, b| {
            let a_db = if a.strength_db.is_finite() { a.strength_db } else { SILENCE_DB };
            let b_db = if b.strength_db.is_finite() { b.strength_db } else { SILENCE_DB };
            a_db.total_cmp(&b_db)
        }) else {
            continue;
        };
        let dominant_bin = agreement_bin(dominant, freq_bin_hz);
        let agreeing: BTreeSet<&str> = rows
            .iter()
            .filter(|row| !row.sensor_id.is_empty() && agreement_bin(row, freq_bin_hz) == dominant_bin)
            .map(|row| row.sensor_id.as_str())
            .collect();
        let sensors: BTreeSet<&str> = rows
            .iter()
            .filter(|row| !row.sensor_id.is_empty())
            .map(|row| row.sensor_id.as_str())
            .collect();
        let agreement_count = agreeing.len();
        by_location.insert(
            location.clone(),
            LocationLevel {
                bucket: dominant.bucket,
                strength_db: dominant.strength_db,
                sensor_label: dominant.sensor_label.clone(),
                sensor_location: location.clone(),
                class: dominant.class,
                peak_hz: dominant.peak_hz,
                confidence: 1.0 + agreement_count.saturating_sub(1) as f64,
                agreement_count,
                sensor_count: sensors.len(),
            },
        );
    }
    by_location
}
