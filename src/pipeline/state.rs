//! Live State and System Status
//!
//! Shared state for the live diagnostics loop, readable from the binary's
//! status reporter while the loop updates it.

use serde::Serialize;
use std::time::Instant;

use crate::diagnostics::DiagnosticsSnapshot;
use crate::processing::IntakeStats;
use crate::strength::StrengthBucket;

/// Top-finding severity at or above which the system reports an alert.
pub const ALERT_SEVERITY: StrengthBucket = StrengthBucket::L4;

// ============================================================================
// Live State
// ============================================================================

/// State published by the live loop after every tick.
///
/// Wrapped in `Arc<RwLock<>>` and shared with readers across the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct LiveState {
    /// System uptime (not serialized)
    #[serde(skip)]
    pub uptime: Instant,

    /// Current system status
    pub status: SystemStatus,

    /// Latest diagnostics snapshot (heavy or light tick)
    pub latest_snapshot: Option<DiagnosticsSnapshot>,

    /// Processor intake counters at the last heavy tick
    pub intake: Option<IntakeStats>,

    /// Sensors active at the last heavy tick
    pub active_clients: usize,

    /// Latest known vehicle speed
    pub speed_mps: Option<f64>,

    /// Batches accepted into the processor
    pub batches_ingested: u64,

    pub heavy_ticks: u64,

    pub light_ticks: u64,

    /// Wall-clock time of the last heavy tick
    pub last_heavy_tick: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for LiveState {
    fn default() -> Self {
        Self {
            uptime: Instant::now(),
            status: SystemStatus::Initializing,
            latest_snapshot: None,
            intake: None,
            active_clients: 0,
            speed_mps: None,
            batches_ingested: 0,
            heavy_ticks: 0,
            light_ticks: 0,
            last_heavy_tick: None,
        }
    }
}

impl LiveState {
    /// Status implied by a fresh snapshot.
    pub fn status_for(snapshot: &DiagnosticsSnapshot, active_clients: usize) -> SystemStatus {
        if active_clients == 0 {
            return SystemStatus::Waiting;
        }
        match &snapshot.top_finding {
            Some(top) if top.is_ranked() && top.severity.is_some_and(|s| s >= ALERT_SEVERITY) => SystemStatus::Alert,
            _ => SystemStatus::Monitoring,
        }
    }
}

// ============================================================================
// System Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemStatus {
    /// Loop is starting up
    Initializing,
    /// Running, but no sensor is sending data
    Waiting,
    /// Normal operation, monitoring active
    Monitoring,
    /// Top finding at or above the alert band
    Alert,
    /// Source ended or shutdown requested
    Stopped,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Waiting => write!(f, "Waiting"),
            Self::Monitoring => write!(f, "Monitoring"),
            Self::Alert => write!(f, "Alert"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_state_default() {
        let state = LiveState::default();
        assert_eq!(state.status, SystemStatus::Initializing);
        assert!(state.latest_snapshot.is_none());
        assert_eq!(state.batches_ingested, 0);
    }

    #[test]
    fn test_system_status_display() {
        assert_eq!(format!("{}", SystemStatus::Initializing), "Initializing");
        assert_eq!(format!("{}", SystemStatus::Alert), "Alert");
        assert_eq!(format!("{}", SystemStatus::Stopped), "Stopped");
    }
}
