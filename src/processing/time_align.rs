//! Multi-sensor time alignment.
//!
//! Each buffer's analysis window is placed on a timeline, from the sensor
//! clock (`t0_us`) when the sensor is synced and from the server receive time
//! otherwise. The intersection over union of those windows tells whether
//! the sensors actually observed the same stretch of road.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::defaults::ALIGNMENT_MIN_OVERLAP;

/// Intersection over union of several time ranges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlapResult {
    pub overlap_ratio: f64,
    pub aligned: bool,
    pub shared_start: f64,
    pub shared_end: f64,
    pub overlap_s: f64,
}

impl OverlapResult {
    const NONE: Self = Self {
        overlap_ratio: 0.0,
        aligned: false,
        shared_start: 0.0,
        shared_end: 0.0,
        overlap_s: 0.0,
    };
}

/// Analysis window of a single buffer, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    pub start_s: f64,
    pub end_s: f64,
    /// `true` when derived from the sensor clock.
    pub synced: bool,
}

/// Inputs needed to place one buffer on the timeline.
#[derive(Debug, Clone, Copy)]
pub struct BufferTiming {
    pub count: usize,
    pub capacity: usize,
    pub sample_rate_hz: u32,
    pub waveform_seconds: u32,
    /// Server receive time of the newest chunk, `None` before any ingest.
    pub last_ingest_s: Option<f64>,
    pub last_t0_us: u64,
    pub samples_since_t0: u64,
}

pub fn compute_overlap(ranges: &[(f64, f64)]) -> OverlapResult {
    if ranges.is_empty() {
        return OverlapResult::NONE;
    }
    let shared_start = ranges.iter().map(|r| r.0).fold(f64::NEG_INFINITY, f64::max);
    let shared_end = ranges.iter().map(|r| r.1).fold(f64::INFINITY, f64::min);
    let union_start = ranges.iter().map(|r| r.0).fold(f64::INFINITY, f64::min);
    let union_end = ranges.iter().map(|r| r.1).fold(f64::NEG_INFINITY, f64::max);

    let overlap = (shared_end - shared_start).max(0.0);
    let union = (union_end - union_start).max(1e-9);
    let overlap_ratio = overlap / union;
    OverlapResult {
        overlap_ratio,
        aligned: overlap_ratio >= ALIGNMENT_MIN_OVERLAP,
        shared_start,
        shared_end,
        overlap_s: overlap,
    }
}

/// Window covered by the samples an analysis would use right now.
///
/// `None` without data, without an ingest timestamp, or at a zero rate.
pub fn analysis_time_range(timing: &BufferTiming) -> Option<TimeRange> {
    let last_ingest_s = timing.last_ingest_s?;
    if timing.count == 0 || timing.sample_rate_hz == 0 {
        return None;
    }
    let sr = u64::from(timing.sample_rate_hz);
    let desired = usize::try_from(sr * u64::from(timing.waveform_seconds)).unwrap_or(usize::MAX).max(1);
    let n_window = timing.count.min(timing.capacity).min(desired);
    let duration_s = n_window as f64 / sr as f64;

    // t0 marks the first sample of the newest frame; a t0 that overflows
    // the window end is treated as unsynced
    let synced_end_us = (timing.last_t0_us > 0)
        .then(|| {
            timing
                .samples_since_t0
                .checked_mul(1_000_000)
                .and_then(|us| timing.last_t0_us.checked_add(us / sr))
        })
        .flatten();
    if let Some(end_us) = synced_end_us {
        let end_s = end_us as f64 / 1e6;
        return Some(TimeRange {
            start_s: end_s - duration_s,
            end_s,
            synced: true,
        });
    }

    Some(TimeRange {
        start_s: last_ingest_s - duration_s,
        end_s: last_ingest_s,
        synced: false,
    })
}

/// Per-sensor window as reported by [`TimeAlignmentInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorWindow {
    pub start_s: f64,
    pub end_s: f64,
    pub duration_s: f64,
    pub synced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SharedWindow {
    pub start_s: f64,
    pub end_s: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeAlignmentInfo {
    pub per_sensor: BTreeMap<String, SensorWindow>,
    pub shared_window: Option<SharedWindow>,
    pub overlap_ratio: f64,
    pub aligned: bool,
    /// All included sensors report sensor-clock timestamps.
    pub clock_synced: bool,
    pub sensors_included: Vec<String>,
    pub sensors_excluded: Vec<String>,
}

impl TimeAlignmentInfo {
    /// Fold per-client ranges (`None` = excluded) into alignment metadata.
    pub fn from_ranges(ranges: Vec<(String, Option<TimeRange>)>) -> Self {
        let mut per_sensor = BTreeMap::new();
        let mut spans = Vec::new();
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut all_synced = true;

        for (client_id, range) in ranges {
            let Some(range) = range else {
                excluded.push(client_id);
                continue;
            };
            all_synced &= range.synced;
            per_sensor.insert(
                client_id.clone(),
                SensorWindow {
                    start_s: range.start_s,
                    end_s: range.end_s,
                    duration_s: range.end_s - range.start_s,
                    synced: range.synced,
                },
            );
            spans.push((range.start_s, range.end_s));
            included.push(client_id);
        }

        if spans.len() < 2 {
            return Self {
                per_sensor,
                shared_window: None,
                overlap_ratio: if spans.len() == 1 { 1.0 } else { 0.0 },
                aligned: true,
                clock_synced: all_synced && !included.is_empty(),
                sensors_included: included,
                sensors_excluded: excluded,
            };
        }

        let overlap = compute_overlap(&spans);
        let shared_window = (overlap.overlap_s > 0.0).then_some(SharedWindow {
            start_s: overlap.shared_start,
            end_s: overlap.shared_end,
            duration_s: overlap.overlap_s,
        });
        Self {
            per_sensor,
            shared_window,
            overlap_ratio: round4(overlap.overlap_ratio),
            aligned: overlap.aligned,
            clock_synced: all_synced,
            sensors_included: included,
            sensors_excluded: excluded,
        }
    }
}

pub(crate) fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(last_ingest_s: Option<f64>, last_t0_us: u64) -> BufferTiming {
        BufferTiming {
            count: 1600,
            capacity: 1600,
            sample_rate_hz: 800,
            waveform_seconds: 2,
            last_ingest_s,
            last_t0_us,
            samples_since_t0: 400,
        }
    }

    #[test]
    fn test_overlap_ratio() {
        let ov = compute_overlap(&[(0.0, 2.0), (1.0, 3.0)]);
        assert!((ov.overlap_ratio - 1.0 / 3.0).abs() < 1e-12);
        assert!(!ov.aligned);
        assert!((ov.overlap_s - 1.0).abs() < 1e-12);

        let ov = compute_overlap(&[(0.0, 2.0), (0.5, 2.0)]);
        assert!(ov.aligned);

        let disjoint = compute_overlap(&[(0.0, 1.0), (5.0, 6.0)]);
        assert!(disjoint.overlap_s.abs() < f64::EPSILON);
        assert!(!compute_overlap(&[]).aligned);
    }

    #[test]
    fn test_range_requires_data_and_rate() {
        assert!(analysis_time_range(&timing(None, 0)).is_none());
        let mut zero_rate = timing(Some(10.0), 0);
        zero_rate.sample_rate_hz = 0;
        assert!(analysis_time_range(&zero_rate).is_none());
    }

    #[test]
    fn test_range_uses_sensor_clock_when_synced() {
        let range = analysis_time_range(&timing(Some(99.0), 5_000_000)).expect("range");
        assert!(range.synced);
        // 400 samples at 800 Hz after t0 = 5.5 s
        assert!((range.end_s - 5.5).abs() < 1e-9);
        assert!((range.start_s - 3.5).abs() < 1e-9);

        let fallback = analysis_time_range(&timing(Some(99.0), 0)).expect("range");
        assert!(!fallback.synced);
        assert!((fallback.end_s - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_overflowing_sensor_clock_falls_back_to_receive_time() {
        let range = analysis_time_range(&timing(Some(42.0), u64::MAX - 10)).expect("range");
        assert!(!range.synced);
        assert!((range.end_s - 42.0).abs() < 1e-9);

        let mut long_run = timing(Some(42.0), 1_000_000);
        long_run.samples_since_t0 = u64::MAX / 2;
        assert!(!analysis_time_range(&long_run).expect("range").synced);
    }

    #[test]
    fn test_alignment_info_partitions_sensors() {
        let info = TimeAlignmentInfo::from_ranges(vec![
            ("a".into(), Some(TimeRange { start_s: 0.0, end_s: 2.0, synced: true })),
            ("b".into(), Some(TimeRange { start_s: 0.5, end_s: 2.5, synced: false })),
            ("c".into(), None),
        ]);
        assert_eq!(info.sensors_included, vec!["a", "b"]);
        assert_eq!(info.sensors_excluded, vec!["c"]);
        assert!((info.overlap_ratio - 0.6).abs() < 1e-12);
        assert!(info.aligned);
        assert!(!info.clock_synced);
        let shared = info.shared_window.expect("shared window");
        assert!((shared.duration_s - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_sensor_is_trivially_aligned() {
        let info = TimeAlignmentInfo::from_ranges(vec![(
            "a".into(),
            Some(TimeRange { start_s: 0.0, end_s: 1.0, synced: false }),
        )]);
        assert!((info.overlap_ratio - 1.0).abs() < f64::EPSILON);
        assert!(info.aligned);
        assert!(info.shared_window.is_none());

        let empty = TimeAlignmentInfo::from_ranges(Vec::new());
        assert!(empty.overlap_ratio.abs() < f64::EPSILON);
        assert!(!empty.clock_synced);
    }
}
