//! Signal processing module - ring buffers and FFT analysis per client
//!
//! ## Architecture
//!
//! ```text
//! ingest ──► ClientBuffer (ring, per client) ──snapshot──► FftProcessor
//!                 ▲                                          │
//!                 └──────── commit if generation current ◄───┘
//!                                      │
//!                 spectrum / multi / selected payloads (cached)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let processor = SignalProcessor::new(&config.processing, Some(pool))?;
//! processor.ingest("front-left", &samples, Some(800), None);
//! let metrics = processor.compute_all(&processor.client_ids());
//! let spectra = processor.multi_spectrum_payload(&processor.client_ids());
//! ```

mod buffer;
mod fft;
mod metrics;
mod payload;
mod processor;
mod time_align;

pub use buffer::ClientBuffer;
pub use fft::*;
pub use metrics::{AxisMetrics, ClientMetrics, CombinedMetrics};
pub use payload::*;
pub use processor::{IntakeStats, SignalProcessor, DEFAULT_RAW_SAMPLES};
pub use time_align::{
    analysis_time_range, compute_overlap, BufferTiming, OverlapResult, SensorWindow, SharedWindow,
    TimeAlignmentInfo, TimeRange,
};

use thiserror::Error;

/// Errors in signal processor construction
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Invalid buffer capacity: {sample_rate_hz} Hz x {waveform_seconds} s holds no samples")]
    InvalidCapacity { sample_rate_hz: u32, waveform_seconds: u32 },

    #[error("FFT size {fft_n} is below the minimum of {min}")]
    FftTooSmall { fft_n: usize, min: usize },

    #[error("FFT size {fft_n} exceeds buffer capacity {capacity}")]
    FftExceedsCapacity { fft_n: usize, capacity: usize },
}
