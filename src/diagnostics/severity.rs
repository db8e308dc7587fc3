//! Severity state machine: persistence on the way up, hysteresis and decay
//! on the way down.

use serde::Serialize;
use std::cmp::Ordering;

use super::SILENCE_DB;
use crate::strength::{bucket_for_strength, StrengthBucket, DECAY_TICKS, HYSTERESIS_DB, PERSISTENCE_TICKS};

/// Flat bonus applied when two or more sensors agree.
pub const MULTI_SENSOR_CORROBORATION_DB: f64 = 3.0;

/// Band and counters of one tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SeverityState {
    current: Option<StrengthBucket>,
    pending: Option<StrengthBucket>,
    consecutive_up: u32,
    consecutive_down: u32,
    /// Peak frequency the pending streak is anchored to.
    last_confirmed_hz: Option<f64>,
}

/// Band after an observation plus the adjusted strength that drove it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityReading {
    pub bucket: Option<StrengthBucket>,
    pub db: f64,
}

impl SeverityState {
    pub const fn new() -> Self {
        Self {
            current: None,
            pending: None,
            consecutive_up: 0,
            consecutive_down: 0,
            last_confirmed_hz: None,
        }
    }

    pub const fn current(&self) -> Option<StrengthBucket> {
        self.current
    }

    pub const fn pending(&self) -> Option<StrengthBucket> {
        self.pending
    }

    pub const fn consecutive_up(&self) -> u32 {
        self.consecutive_up
    }

    pub const fn consecutive_down(&self) -> u32 {
        self.consecutive_down
    }

    /// Feed one tick of strength into the state machine.
    ///
    /// - Promotion needs [`PERSISTENCE_TICKS`] consecutive ticks at the same
    ///   higher candidate band. With `peak_hz` and `freq_bin_hz` set, a peak
    ///   that wanders more than one bin restarts the streak.
    /// - Demotion (or clearing) needs [`DECAY_TICKS`] consecutive ticks more
    ///   than [`HYSTERESIS_DB`] below the current band's floor.
    /// - A tick at the current band resets both streaks.
    ///
    /// Non-finite strengths count as silence.
    pub fn observe(
        &mut self,
        strength_db: f64,
        sensor_count: usize,
        peak_hz: Option<f64>,
        freq_bin_hz: Option<f64>,
    ) -> SeverityReading {
        let strength_db = if strength_db.is_finite() { strength_db } else { SILENCE_DB };
        let adjusted = if sensor_count >= 2 {
            strength_db + MULTI_SENSOR_CORROBORATION_DB
        } else {
            strength_db
        };
        let guard = match (peak_hz, freq_bin_hz) {
            (Some(hz), Some(bin)) if hz.is_finite() && bin.is_finite() && bin > 0.0 => Some((hz, bin)),
            _ => None,
        };

        match (bucket_for_strength(adjusted), self.current) {
            (None, None) => self.clear_pending(),
            (None, Some(current)) => self.decay_towards(None, current, adjusted),
            (Some(candidate), None) => self.promote_towards(candidate, guard),
            (Some(candidate), Some(current)) => match candidate.cmp(&current) {
                Ordering::Greater => self.promote_towards(candidate, guard),
                Ordering::Less => self.decay_towards(Some(candidate), current, adjusted),
                Ordering::Equal => {
                    self.clear_pending();
                    self.consecutive_down = 0;
                }
            },
        }

        SeverityReading {
            bucket: self.current,
            db: adjusted,
        }
    }

    fn clear_pending(&mut self) {
        self.pending = None;
        self.consecutive_up = 0;
        self.last_confirmed_hz = None;
    }

    fn promote_towards(&mut self, candidate: StrengthBucket, guard: Option<(f64, f64)>) {
        self.consecutive_down = 0;
        self.advance_pending(candidate, guard);
        if self.consecutive_up >= PERSISTENCE_TICKS {
            self.current = Some(candidate);
            self.pending = None;
            self.consecutive_up = 0;
            self.last_confirmed_hz = guard.map(|(hz, _)| hz);
        }
    }

    fn advance_pending(&mut self, candidate: StrengthBucket, guard: Option<(f64, f64)>) {
        if self.pending != Some(candidate) {
            self.pending = Some(candidate);
            self.consecutive_up = 1;
            self.last_confirmed_hz = guard.map(|(hz, _)| hz);
            return;
        }
        if let Some((hz, bin)) = guard {
            match self.last_confirmed_hz {
                Some(anchor) if (hz - anchor).abs() > bin => {
                    self.consecutive_up = 1;
                    self.last_confirmed_hz = Some(hz);
                    return;
                }
                None => self.last_confirmed_hz = Some(hz),
                Some(_) => {}
            }
        }
        self.consecutive_up += 1;
    }

    fn decay_towards(&mut self, target: Option<StrengthBucket>, current: StrengthBucket, adjusted: f64) {
        // falling under the current band ends any promotion streak
        self.clear_pending();
        if adjusted < current.min_db() - HYSTERESIS_DB {
            self.consecutive_down += 1;
            if self.consecutive_down >= DECAY_TICKS {
                self.current = target;
                self.consecutive_down = 0;
            }
        } else {
            self.consecutive_down = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut SeverityState, db: f64, ticks: u32) -> Option<StrengthBucket> {
        let mut bucket = state.current();
        for _ in 0..ticks {
            bucket = state.observe(db, 1, None, None).bucket;
        }
        bucket
    }

    fn at_l3() -> SeverityState {
        let mut state = SeverityState::new();
        assert_eq!(feed(&mut state, 25.0, PERSISTENCE_TICKS), Some(StrengthBucket::L3));
        state
    }

    #[test]
    fn test_promotion_needs_exactly_persistence_ticks() {
        let mut state = SeverityState::new();
        assert_eq!(state.observe(25.0, 1, None, None).bucket, None);
        assert_eq!(state.observe(25.0, 1, None, None).bucket, None);
        assert_eq!(state.pending(), Some(StrengthBucket::L3));
        assert_eq!(state.consecutive_up(), 2);
        assert_eq!(state.observe(25.0, 1, None, None).bucket, Some(StrengthBucket::L3));
        assert_eq!(state.pending(), None);
    }

    #[test]
    fn test_regression_restarts_promotion_streak() {
        let mut state = SeverityState::new();
        feed(&mut state, 25.0, 2);
        state.observe(5.0, 1, None, None);
        assert_eq!(state.consecutive_up(), 0);
        assert_eq!(feed(&mut state, 25.0, 2), None);
        assert_eq!(feed(&mut state, 25.0, 1), Some(StrengthBucket::L3));
    }

    #[test]
    fn test_dip_within_hysteresis_does_not_demote() {
        let mut state = at_l3();
        // L3 floor is 22 dB; 20.5 is inside the 2 dB margin
        for _ in 0..(DECAY_TICKS * 3) {
            assert_eq!(state.observe(20.5, 1, None, None).bucket, Some(StrengthBucket::L3));
        }
        assert_eq!(state.consecutive_down(), 0);
    }

    #[test]
    fn test_demotion_needs_decay_ticks() {
        let mut state = at_l3();
        assert_eq!(feed(&mut state, 15.0, DECAY_TICKS - 1), Some(StrengthBucket::L3));
        assert_eq!(feed(&mut state, 15.0, 1), Some(StrengthBucket::L1));

        assert_eq!(feed(&mut state, SILENCE_DB, DECAY_TICKS - 1), Some(StrengthBucket::L1));
        assert_eq!(feed(&mut state, SILENCE_DB, 1), None);
    }

    #[test]
    fn test_recovery_interrupts_decay() {
        let mut state = at_l3();
        feed(&mut state, 15.0, DECAY_TICKS - 1);
        state.observe(23.0, 1, None, None);
        assert_eq!(state.consecutive_down(), 0);
        assert_eq!(feed(&mut state, 15.0, DECAY_TICKS - 1), Some(StrengthBucket::L3));
    }

    #[test]
    fn test_frequency_jump_restarts_streak() {
        let mut state = SeverityState::new();
        let bin = Some(1.5);
        state.observe(25.0, 1, Some(40.0), bin);
        state.observe(25.0, 1, Some(40.5), bin);
        assert_eq!(state.observe(25.0, 1, Some(50.0), bin).bucket, None);
        assert_eq!(state.consecutive_up(), 1);
        state.observe(25.0, 1, Some(50.5), bin);
        assert_eq!(state.observe(25.0, 1, Some(51.0), bin).bucket, Some(StrengthBucket::L3));
    }

    #[test]
    fn test_corroboration_bonus_for_multiple_sensors() {
        let mut state = SeverityState::new();
        let single = state.observe(20.0, 1, None, None);
        assert!((single.db - 20.0).abs() < f64::EPSILON);
        let multi = state.observe(20.0, 2, None, None);
        assert!((multi.db - 23.0).abs() < f64::EPSILON);
        // L2 streak from the single-sensor tick is replaced by an L3 streak
        assert_eq!(state.pending(), Some(StrengthBucket::L3));
        assert_eq!(state.consecutive_up(), 1);
    }

    #[test]
    fn test_non_finite_strength_counts_as_silence() {
        let mut state = at_l3();
        let reading = state.observe(f64::NAN, 1, None, None);
        assert!((reading.db - SILENCE_DB).abs() < f64::EPSILON);
        assert_eq!(state.consecutive_down(), 1);
    }
}
