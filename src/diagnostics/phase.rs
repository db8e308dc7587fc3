//! Driving phase from a short rolling speed history.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// m/s to km/h.
pub const MPS_TO_KMH: f64 = 3.6;

/// Entries kept in the speed history.
pub const PHASE_HISTORY_MAX: usize = 5;

/// Below this speed the vehicle is idle.
pub const IDLE_SPEED_KMH: f64 = 3.0;

/// Speed derivative magnitude separating cruise from acceleration/deceleration.
pub const ACCEL_THRESHOLD_KMH_S: f64 = 1.5;

/// Decelerating below this speed is a coast-down.
pub const COAST_DOWN_MAX_KMH: f64 = 15.0;

/// Shortest history span used for the derivative.
const MIN_DERIVATIVE_SPAN_S: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrivingPhase {
    Idle,
    Acceleration,
    Cruise,
    Deceleration,
    CoastDown,
    SpeedUnknown,
}

impl DrivingPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acceleration => "acceleration",
            Self::Cruise => "cruise",
            Self::Deceleration => "deceleration",
            Self::CoastDown => "coast_down",
            Self::SpeedUnknown => "speed_unknown",
        }
    }

    /// Phase of one sample given its speed and speed derivative.
    pub fn classify(speed_kmh: Option<f64>, deriv_kmh_s: Option<f64>) -> Self {
        let Some(speed_kmh) = speed_kmh else {
            return Self::SpeedUnknown;
        };
        if speed_kmh < IDLE_SPEED_KMH {
            return Self::Idle;
        }
        match deriv_kmh_s {
            Some(d) if d > ACCEL_THRESHOLD_KMH_S => Self::Acceleration,
            Some(d) if d < -ACCEL_THRESHOLD_KMH_S => {
                if speed_kmh < COAST_DOWN_MAX_KMH {
                    Self::CoastDown
                } else {
                    Self::Deceleration
                }
            }
            _ => Self::Cruise,
        }
    }
}

impl fmt::Display for DrivingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PhaseClassifier {
    history: VecDeque<(f64, Option<f64>)>,
    current: DrivingPhase,
}

impl Default for PhaseClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseClassifier {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(PHASE_HISTORY_MAX),
            current: DrivingPhase::Idle,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub const fn current(&self) -> DrivingPhase {
        self.current
    }

    /// Record a speed sample (`None` or non-finite = unknown) and reclassify.
    ///
    /// The derivative spans the oldest and newest known speeds in the history.
    pub fn update(&mut self, speed_mps: Option<f64>, now_s: f64) -> DrivingPhase {
        let speed_kmh = speed_mps.filter(|s| s.is_finite()).map(|s| s * MPS_TO_KMH);
        if self.history.len() >= PHASE_HISTORY_MAX {
            self.history.pop_front();
        }
        self.history.push_back((now_s, speed_kmh));

        let mut known = self.history.iter().filter_map(|(t, s)| s.map(|s| (*t, s)));
        let first = known.next();
        let last = known.last();
        let deriv = match (first, last) {
            (Some((t0, s0)), Some((t1, s1))) if t1 - t0 >= MIN_DERIVATIVE_SPAN_S => Some((s1 - s0) / (t1 - t0)),
            _ => None,
        };
        self.current = DrivingPhase::classify(speed_kmh, deriv);
        self.current
    }
}
