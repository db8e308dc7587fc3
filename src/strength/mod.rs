//! Vibration Strength Library
//!
//! Stateless functions that turn a combined amplitude spectrum into a single
//! comparable "vibration strength" scalar, plus the severity band table that
//! the live diagnostics engine buckets those values into.
//!
//! ## Usage
//!
//! ```ignore
//! use vibesensor::strength::{compute_vibration_strength_db, PEAK_BANDWIDTH_HZ, PEAK_SEPARATION_HZ};
//!
//! let metrics = compute_vibration_strength_db(&freq, &combined, PEAK_BANDWIDTH_HZ, PEAK_SEPARATION_HZ, 5);
//! println!("{:.1} dB ({:?})", metrics.vibration_strength_db, metrics.strength_bucket);
//! ```

mod bands;
mod vibration;

pub use bands::*;
pub use vibration::*;
