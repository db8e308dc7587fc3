//! System-wide default constants.
//!
//! Centralises the tuned numbers used by the pipeline. Grouped by subsystem
//! for easy discovery.

// ============================================================================
// Processing
// ============================================================================

/// Nominal accelerometer sample rate (Hz) assumed until a client reports one.
pub const SAMPLE_RATE_HZ: u32 = 800;

/// Seconds of history kept per client ring buffer.
pub const WAVEFORM_SECONDS: u32 = 8;

/// Target rate (Hz) of the decimated waveform sent to the dashboard.
pub const WAVEFORM_DISPLAY_HZ: u32 = 120;

/// FFT block length in samples.
pub const FFT_N: usize = 2048;

/// Smallest accepted FFT block length.
pub const MIN_FFT_N: usize = 16;

/// Lower edge of the reported spectrum (Hz).
pub const SPECTRUM_MIN_HZ: f64 = 5.0;

/// Upper edge of the reported spectrum (Hz).
pub const SPECTRUM_MAX_HZ: f64 = 200.0;

/// Client-reported sample rates are clamped to this ceiling to bound buffer growth.
pub const MAX_CLIENT_SAMPLE_RATE_HZ: u32 = 4096;

/// Distinct sample rates whose frequency slices are memoised.
pub const FFT_CACHE_MAX_ENTRIES: usize = 64;

/// Default per-axis peak count reported in client metrics.
pub const AXIS_TOP_PEAKS: usize = 3;

/// Peaks computed on the combined spectrum for strength metrics.
pub const COMBINED_TOP_PEAKS: usize = 8;

/// A client counts as "recent" if it delivered samples within this window (s).
pub const RECENT_DATA_MAX_AGE_S: f64 = 3.0;

/// Absolute tolerance (Hz) when comparing frequency axes across clients.
pub const FREQUENCY_AXIS_TOLERANCE_HZ: f64 = 1e-6;

/// Shared window must cover at least this fraction of the union to count as aligned.
pub const ALIGNMENT_MIN_OVERLAP: f64 = 0.5;

// ============================================================================
// Worker Pool
// ============================================================================

/// Default number of FFT worker threads.
pub const WORKER_THREADS: usize = 4;

// ============================================================================
// Live Loop
// ============================================================================

/// Interval between heavy ticks that recompute spectra (ms). 4 Hz.
pub const HEAVY_TICK_MS: u64 = 250;

/// Interval between light diagnostics-only ticks (ms). 10 Hz.
pub const LIGHT_TICK_MS: u64 = 100;

/// Clients silent for longer than this are evicted (s).
pub const CLIENT_TTL_SECONDS: u64 = 120;

// ============================================================================
// Sensor Registry
// ============================================================================

/// Recent sequence numbers tracked per client for duplicate detection.
pub const DEDUP_WINDOW: usize = 128;

/// Largest backward seq distance still treated as a retransmit.
pub const DEDUP_RESTART_GAP: u32 = 4;

/// Backward seq jump (frames) beyond which the sensor is considered reset.
pub const RESET_SEQ_GAP: u32 = 1000;
