//! Live Diagnostics - severity tracking over per-client spectra
//!
//! Turns the strongest peaks of every client spectrum into classified
//! events, runs each `(sensor, class)` pair through a hysteresis state
//! machine and keeps a windowed dwell matrix of how long each source sat
//! in each severity band.
//!
//! ## Architecture
//!
//! ```text
//! MultiSpectrumPayload ──► detect events (top 4 peaks/client, classified)
//!                                 │ strongest per sensor:class
//!                                 ▼
//!                 sensor trackers ──► combined trackers (same class, Hz chain)
//!                        │                      │
//!                        └──► active levels ◄───┘ ──► DwellMatrix, findings
//!                                 │
//!                                 ▼
//!                        DiagnosticsSnapshot
//! ```
//!
//! "Light" ticks (`spectra = None`) only accrue dwell seconds. The engine
//! holds no locks and must be driven from a single task.
//!
//! ## Usage
//!
//! ```ignore
//! let mut engine = LiveDiagnosticsEngine::new();
//! let spectra = processor.multi_spectrum_payload(&ids);
//! let snapshot = engine.update(Some(speed_mps), &clients, Some(&spectra), &settings);
//! if let Some(top) = &snapshot.top_finding {
//!     info!(finding = %top.finding_id, message = %top.message, "Top finding");
//! }
//! ```

mod engine;
mod findings;
mod levels;
mod matrix;
mod phase;
mod severity;
mod tracker;

pub use engine::{ClientInfo, DiagnosticEvent, DiagnosticsSnapshot, EventKind, LevelsSnapshot, LiveDiagnosticsEngine};
pub use findings::{build_live_findings, select_top_finding, FindingKind, LiveFinding};
pub use levels::{build_levels_by_location, ActiveLevel, LocationCandidate, LocationLevel, SensorLevel};
pub use matrix::{DwellMatrix, MatrixCell, MatrixTable};
pub use phase::{DrivingPhase, PhaseClassifier};
pub use severity::{SeverityReading, SeverityState, MULTI_SENSOR_CORROBORATION_DB};
pub use tracker::{matrix_transition_bucket, TrackerKey, TrackerLevelState};

/// Strength used to decay trackers that produced no peak this tick.
pub const SILENCE_DB: f64 = -120.0;

/// Sensor trackers must have been updated this recently to join a group.
pub const MULTI_SYNC_WINDOW_MS: u64 = 800;

/// Max Hz spacing between neighbours of a combined group.
pub const MULTI_FREQ_BIN_HZ: f64 = 1.5;

/// Re-emit a standing level at least this often.
pub const HEARTBEAT_EMIT_MS: u64 = 3000;

/// Silent ticks after which a tracker is forgotten.
pub const TRACKER_PRUNE_SILENCE_TICKS: u32 = 60;

/// Combined trackers without a band are dropped after this idle time.
pub const COMBINED_TRACKER_IDLE_MS: u64 = 30_000;

/// Peaks per client considered for event detection.
pub const EVENT_PEAKS_PER_CLIENT: usize = 4;

/// Bound of the recent-events list in the snapshot.
pub const MAX_RECENT_EVENTS: usize = 64;

/// Dwell matrix window.
pub const MATRIX_WINDOW_MS: u64 = 5 * 60 * 1000;
