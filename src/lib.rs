//! VibeSensor: real-time vehicle vibration diagnostics
//!
//! Wheel-corner accelerometers stream raw samples; the pipeline turns them
//! into per-sensor spectra, classifies the strongest peaks against the
//! car's rotational orders and tracks severity over time.
//!
//! ## Architecture
//!
//! - **Strength**: spectrum to vibration strength (dB) and severity bands
//! - **Processing**: per-client ring buffers, snapshot FFT, payloads
//! - **Orders**: wheel / driveshaft / engine order frequencies and peak classes
//! - **Diagnostics**: severity state machine, dwell matrix, live findings
//! - **Pipeline**: sensor registry, sample sources and the live tick loop

pub mod config;
pub mod diagnostics;
pub mod orders;
pub mod pipeline;
pub mod processing;
pub mod simulate;
pub mod strength;
pub mod worker_pool;

// Re-export pipeline configuration
pub use config::PipelineConfig;

// Re-export commonly used types
pub use diagnostics::{ClientInfo, DiagnosticsSnapshot, LiveDiagnosticsEngine, LiveFinding};
pub use orders::{classify_peak_hz, vehicle_orders_hz, AnalysisSettings, MatrixSource, OrderClass};
pub use processing::{MultiSpectrumPayload, SignalProcessor, SpectrumPayload};
pub use strength::{StrengthBucket, VibrationStrength};
pub use worker_pool::{PoolError, WorkerPool};

// Re-export the live pipeline
pub use pipeline::{LiveLoop, LiveState, SampleBatch, SampleSource, SensorRegistry, SystemStatus};
