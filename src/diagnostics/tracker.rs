//! Per-key tracker state and the emission rules built on it.

use serde::Serialize;
use std::fmt;

use super::severity::SeverityState;
use super::SILENCE_DB;
use crate::orders::OrderClass;
use crate::strength::StrengthBucket;

/// Identity of a per-sensor tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerKey {
    pub sensor_id: String,
    pub class: OrderClass,
}

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sensor_id, self.class)
    }
}

/// What the engine remembers about one `sensor:class` or combined key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerLevelState {
    pub severity: SeverityState,
    /// Adjusted strength of the latest observation.
    pub last_strength_db: f64,
    pub last_band_rms_g: f64,
    pub last_update_ms: u64,
    pub last_peak_hz: f64,
    pub last_class: OrderClass,
    pub last_sensor_label: String,
    pub last_sensor_location: String,
    pub last_emitted_ms: Option<u64>,
    pub silence_ticks: u32,
}

impl Default for TrackerLevelState {
    fn default() -> Self {
        Self::new(OrderClass::Other)
    }
}

impl TrackerLevelState {
    pub fn new(class: OrderClass) -> Self {
        Self {
            severity: SeverityState::new(),
            last_strength_db: SILENCE_DB,
            last_band_rms_g: 0.0,
            last_update_ms: 0,
            last_peak_hz: 0.0,
            last_class: class,
            last_sensor_label: String::new(),
            last_sensor_location: String::new(),
            last_emitted_ms: None,
            silence_ticks: 0,
        }
    }

    pub const fn current_bucket(&self) -> Option<StrengthBucket> {
        self.severity.current()
    }

    /// Run one severity observation and return the bucket held before it.
    ///
    /// The frequency guard uses `last_peak_hz` once a peak has been seen.
    pub fn apply(&mut self, strength_db: f64, sensor_count: usize, freq_bin_hz: f64) -> Option<StrengthBucket> {
        let previous = self.current_bucket();
        let peak_hz = (self.last_peak_hz > 0.0).then_some(self.last_peak_hz);
        let reading = self.severity.observe(strength_db, sensor_count, peak_hz, Some(freq_bin_hz));
        self.last_strength_db = reading.db;
        previous
    }

    /// Emit on any change into a band, and as a heartbeat while a band holds.
    pub fn should_emit(&self, previous: Option<StrengthBucket>, now_ms: u64, heartbeat_ms: u64) -> bool {
        let Some(current) = self.current_bucket() else {
            return false;
        };
        if previous != Some(current) {
            return true;
        }
        match self.last_emitted_ms {
            Some(last) => now_ms.saturating_sub(last) >= heartbeat_ms,
            None => true,
        }
    }

    /// Bucket counted in the dwell matrix this tick: the current band on
    /// emission, otherwise only an entry or escalation.
    pub fn matrix_bucket(&self, previous: Option<StrengthBucket>, emitting: bool) -> Option<StrengthBucket> {
        if emitting {
            return self.current_bucket();
        }
        matrix_transition_bucket(previous, self.current_bucket())
    }
}

/// Bucket that a transition contributes to the matrix count, if any.
///
/// Only entering a band from nothing or escalating counts.
pub fn matrix_transition_bucket(
    previous: Option<StrengthBucket>,
    current: Option<StrengthBucket>,
) -> Option<StrengthBucket> {
    let current = current?;
    match previous {
        Some(prev) if current <= prev => None,
        _ => Some(current),
    }
}
