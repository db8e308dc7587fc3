//! FFT computation using rustfft
//!
//! Pre-planned real-signal spectra for the per-client vibration analysis.
//!
//! # Features
//!
//! - One forward plan per processor, shared across worker threads
//! - Symmetric Hann window with single-sided amplitude scaling (g)
//! - Frequency slices memoised per sample rate
//! - Per-axis peak picking on a smoothed spectrum
//!
//! # Example
//!
//! ```ignore
//! let fft = FftProcessor::new(2048, 5.0, 200.0)?;
//! let spectrum = fft.analyze(&block, 800);
//! println!("{:.1} dB", spectrum.strength.vibration_strength_db);
//! ```

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, PoisonError};

use super::ProcessingError;
use crate::config::defaults::{
    AXIS_TOP_PEAKS, COMBINED_TOP_PEAKS, FFT_CACHE_MAX_ENTRIES, MIN_FFT_N,
};
use crate::strength::{
    combined_spectrum_amp_g, compute_vibration_strength_db, noise_floor_amp_p20_g,
    VibrationStrength, PEAK_BANDWIDTH_HZ, PEAK_SEPARATION_HZ, PEAK_THRESHOLD_FLOOR_RATIO,
    STRENGTH_EPSILON_MIN_G,
};

/// Axis names in sample column order.
pub const AXES: [&str; 3] = ["x", "y", "z"];

/// Smoothing width used for per-axis peak picking.
const AXIS_SMOOTHING_BINS: usize = 3;

/// A first bin below this frequency is ignored for peak picking.
const DC_SUPPRESS_HZ: f64 = 0.5;

/// Time-domain block with one column per axis.
pub type AxisBlock = [Vec<f64>; 3];

// ============================================================================
// Frequency Slices
// ============================================================================

/// The bins of a single-sided spectrum inside `[min_hz, max_hz]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrequencySlice {
    pub freq: Vec<f64>,
    /// Indexes into the full single-sided spectrum.
    pub valid_idx: Vec<usize>,
}

impl FrequencySlice {
    /// Bins `k·sr/fft_n` kept within the display range. Empty for `sr == 0`.
    pub fn for_rate(fft_n: usize, sample_rate_hz: u32, min_hz: f64, max_hz: f64) -> Self {
        if sample_rate_hz == 0 || fft_n == 0 {
            return Self::default();
        }
        let resolution = f64::from(sample_rate_hz) / fft_n as f64;
        let (freq, valid_idx) = (0..=fft_n / 2)
            .map(|k| (k as f64 * resolution, k))
            .filter(|(hz, _)| *hz >= min_hz && *hz <= max_hz)
            .unzip();
        Self { freq, valid_idx }
    }

    pub fn len(&self) -> usize {
        self.freq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.freq.is_empty()
    }
}

/// FIFO-bounded memo of frequency slices keyed by sample rate.
#[derive(Debug, Default)]
struct SliceCache {
    slices: HashMap<u32, Arc<FrequencySlice>>,
    order: VecDeque<u32>,
}

// ============================================================================
// Peaks
// ============================================================================

/// A local maximum of one axis spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisPeak {
    pub hz: f64,
    /// Unsmoothed amplitude at the peak bin (g).
    pub amp: f64,
    pub snr_ratio: f64,
}

/// Moving average over an odd window with edge padding.
pub fn smooth_spectrum(amps: &[f64], bins: usize) -> Vec<f64> {
    let mut width = bins.max(1);
    if width <= 1 || amps.is_empty() {
        return amps.to_vec();
    }
    if width % 2 == 0 {
        width += 1;
    }
    if amps.len() < width {
        return amps.to_vec();
    }
    let half = width / 2;
    let last = amps.len() - 1;
    (0..amps.len())
        .map(|i| {
            let sum: f64 = (0..width).map(|k| amps[(i + k).saturating_sub(half).min(last)]).sum();
            sum / width as f64
        })
        .collect()
}

/// P20 floor of the finite, non-negative bins.
pub fn noise_floor(amps: &[f64]) -> f64 {
    let mut finite: Vec<f64> = amps.iter().copied().filter(|v| v.is_finite() && *v >= 0.0).collect();
    if finite.is_empty() {
        return 0.0;
    }
    finite.sort_by(f64::total_cmp);
    noise_floor_amp_p20_g(&finite)
}

/// Up to `top_n` peaks of `amps` that clear the noise-floor threshold.
///
/// Falls back to the strongest non-DC bin when nothing crosses the
/// threshold, as long as it is above zero.
pub fn top_peaks(freqs: &[f64], amps: &[f64], top_n: usize, smoothing_bins: usize) -> Vec<AxisPeak> {
    let n = freqs.len().min(amps.len());
    if n == 0 {
        return Vec::new();
    }
    let amps = &amps[..n];
    let smoothed = smooth_spectrum(amps, smoothing_bins);
    let mut floor = noise_floor(&smoothed);
    if !floor.is_finite() || floor < 0.0 {
        floor = 0.0;
    }
    let threshold = (floor * PEAK_THRESHOLD_FLOOR_RATIO.max(1.1)).max(floor + STRENGTH_EPSILON_MIN_G);

    let mut peak_idx: Vec<usize> = (1..n.saturating_sub(1))
        .filter(|&i| {
            let amp = smoothed[i];
            amp >= threshold && amp > smoothed[i - 1] && amp >= smoothed[i + 1]
        })
        .collect();
    if n > 1 {
        let last = n - 1;
        if smoothed[last] >= threshold && smoothed[last] > smoothed[last - 1] {
            peak_idx.push(last);
        }
    }

    if peak_idx.is_empty() {
        let skip = usize::from(n > 1);
        let candidate = smoothed
            .iter()
            .enumerate()
            .skip(skip)
            .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((i, v)),
            });
        if let Some((idx, value)) = candidate {
            if value > 0.0 {
                peak_idx.push(idx);
            }
        }
    }

    peak_idx.sort_by(|a, b| smoothed[*b].total_cmp(&smoothed[*a]));
    peak_idx
        .into_iter()
        .take(top_n)
        .map(|idx| AxisPeak {
            hz: freqs[idx],
            amp: amps[idx],
            snr_ratio: (amps[idx] + STRENGTH_EPSILON_MIN_G) / (floor + STRENGTH_EPSILON_MIN_G),
        })
        .collect()
}

/// 3-point median per axis over interleaved rows. Edge rows are untouched.
pub fn medfilt3(rows: &mut [[f64; 3]]) {
    if rows.len() < 3 {
        return;
    }
    let original = rows.to_vec();
    for i in 1..rows.len() - 1 {
        for axis in 0..3 {
            rows[i][axis] = median3(original[i - 1][axis], original[i][axis], original[i + 1][axis]);
        }
    }
}

fn median3(a: f64, b: f64, c: f64) -> f64 {
    a.max(b).min(a.min(b).max(c))
}

// ============================================================================
// Spectrum Result
// ============================================================================

/// Everything one FFT pass produces for a client.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumResult {
    pub sample_rate_hz: u32,
    pub freq: Arc<FrequencySlice>,
    /// Per-axis amplitude over `freq` (g).
    pub axes: [Vec<f64>; 3],
    pub axis_peaks: [Vec<AxisPeak>; 3],
    /// RMS across axes per bin.
    pub combined: Vec<f64>,
    pub strength: VibrationStrength,
}

// ============================================================================
// FFT Processor
// ============================================================================

/// Pre-planned FFT plus window for a fixed block length.
pub struct FftProcessor {
    fft: Arc<dyn Fft<f64>>,
    fft_n: usize,
    window: Vec<f64>,
    scale: f64,
    spectrum_min_hz: f64,
    spectrum_max_hz: f64,
    slices: Mutex<SliceCache>,
}

impl std::fmt::Debug for FftProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftProcessor")
            .field("fft_n", &self.fft_n)
            .field("scale", &self.scale)
            .field("spectrum_min_hz", &self.spectrum_min_hz)
            .field("spectrum_max_hz", &self.spectrum_max_hz)
            .finish_non_exhaustive()
    }
}

impl FftProcessor {
    /// Create a new FFT processor
    ///
    /// # Arguments
    /// * `fft_n` - Block length in samples (at least 16)
    /// * `spectrum_min_hz` / `spectrum_max_hz` - Reported band edges
    pub fn new(fft_n: usize, spectrum_min_hz: f64, spectrum_max_hz: f64) -> Result<Self, ProcessingError> {
        if fft_n < MIN_FFT_N {
            return Err(ProcessingError::FftTooSmall { fft_n, min: MIN_FFT_N });
        }
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_n);
        let window = hann_window(fft_n);
        let scale = 2.0 / window.iter().sum::<f64>().max(1.0);

        Ok(Self {
            fft,
            fft_n,
            window,
            scale,
            spectrum_min_hz: spectrum_min_hz.max(0.0),
            spectrum_max_hz,
            slices: Mutex::new(SliceCache::default()),
        })
    }

    pub const fn fft_n(&self) -> usize {
        self.fft_n
    }

    pub const fn scale(&self) -> f64 {
        self.scale
    }

    pub const fn spectrum_min_hz(&self) -> f64 {
        self.spectrum_min_hz
    }

    pub const fn spectrum_max_hz(&self) -> f64 {
        self.spectrum_max_hz
    }

    /// Memoised frequency slice for `sample_rate_hz`.
    pub fn frequency_slice(&self, sample_rate_hz: u32) -> Arc<FrequencySlice> {
        if sample_rate_hz == 0 {
            return Arc::new(FrequencySlice::default());
        }
        let mut cache = self.slices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slice) = cache.slices.get(&sample_rate_hz) {
            return Arc::clone(slice);
        }
        let slice = Arc::new(FrequencySlice::for_rate(
            self.fft_n,
            sample_rate_hz,
            self.spectrum_min_hz,
            self.spectrum_max_hz,
        ));
        cache.slices.insert(sample_rate_hz, Arc::clone(&slice));
        cache.order.push_back(sample_rate_hz);
        while cache.order.len() > FFT_CACHE_MAX_ENTRIES {
            if let Some(oldest) = cache.order.pop_front() {
                cache.slices.remove(&oldest);
            }
        }
        slice
    }

    /// Number of memoised sample rates.
    pub fn cached_rates(&self) -> usize {
        self.slices.lock().unwrap_or_else(PoisonError::into_inner).slices.len()
    }

    /// Scaled single-sided amplitude spectrum of one `fft_n` block.
    ///
    /// Shorter input is zero-padded; longer input is truncated.
    pub fn amplitude(&self, signal: &[f64]) -> Vec<f64> {
        let mut buffer: Vec<Complex<f64>> = (0..self.fft_n)
            .map(|i| Complex::new(signal.get(i).copied().unwrap_or(0.0) * self.window[i], 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let n_positive = self.fft_n / 2 + 1;
        let mut spec: Vec<f64> = buffer[..n_positive].iter().map(|c| c.norm() * self.scale).collect();
        spec[0] *= 0.5;
        if self.fft_n % 2 == 0 && n_positive > 1 {
            spec[n_positive - 1] *= 0.5;
        }
        spec
    }

    /// Detrend, transform and reduce a 3-axis block into a [`SpectrumResult`].
    pub fn analyze(&self, block: &AxisBlock, sample_rate_hz: u32) -> SpectrumResult {
        let slice = self.frequency_slice(sample_rate_hz);
        let mut axes: [Vec<f64>; 3] = Default::default();
        let mut axis_peaks: [Vec<AxisPeak>; 3] = Default::default();

        for (axis_idx, samples) in block.iter().enumerate() {
            let detrended = detrend(samples);
            let spec = self.amplitude(&detrended);
            let amp_slice: Vec<f64> = slice.valid_idx.iter().map(|&k| spec[k]).collect();

            let mut amp_for_peaks = amp_slice.clone();
            if amp_for_peaks.len() > 1 && slice.freq.first().is_some_and(|hz| *hz < DC_SUPPRESS_HZ) {
                amp_for_peaks[0] = 0.0;
            }
            axis_peaks[axis_idx] = top_peaks(&slice.freq, &amp_for_peaks, AXIS_TOP_PEAKS, AXIS_SMOOTHING_BINS);
            axes[axis_idx] = amp_slice;
        }

        let axis_refs: Vec<&[f64]> = axes.iter().map(Vec::as_slice).collect();
        let combined = combined_spectrum_amp_g(&axis_refs);
        let strength = compute_vibration_strength_db(
            &slice.freq,
            &combined,
            PEAK_BANDWIDTH_HZ,
            PEAK_SEPARATION_HZ,
            COMBINED_TOP_PEAKS,
        );

        SpectrumResult {
            sample_rate_hz,
            freq: slice,
            axes,
            axis_peaks,
            combined,
            strength,
        }
    }
}

/// Symmetric Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (n - 1) as f64;
            (0..n).map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / denom).cos()).collect()
        }
    }
}

/// Subtract the mean. Empty input stays empty.
pub fn detrend(samples: &[f64]) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    samples.iter().map(|v| v - mean).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq_hz: f64, amp: f64, sr: u32, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| amp * (2.0 * PI * freq_hz * i as f64 / f64::from(sr)).sin())
            .collect()
    }

    #[test]
    fn test_hann_window_is_symmetric() {
        let w = hann_window(16);
        assert!(w[0].abs() < 1e-12);
        assert!(w[15].abs() < 1e-12);
        for i in 0..8 {
            assert!((w[i] - w[15 - i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rejects_tiny_fft() {
        assert!(matches!(
            FftProcessor::new(8, 5.0, 200.0),
            Err(ProcessingError::FftTooSmall { fft_n: 8, .. })
        ));
    }

    #[test]
    fn test_zero_rate_gives_empty_slice() {
        let fft = FftProcessor::new(1024, 5.0, 200.0).expect("processor");
        assert!(fft.frequency_slice(0).is_empty());
        assert_eq!(fft.cached_rates(), 0);
        let block: AxisBlock = [vec![0.1; 1024], vec![0.0; 1024], vec![0.0; 1024]];
        let result = fft.analyze(&block, 0);
        assert!(result.combined.is_empty());
        assert!(result.strength.top_peaks.is_empty());
    }

    #[test]
    fn test_slice_respects_band_edges() {
        let slice = FrequencySlice::for_rate(1024, 800, 5.0, 200.0);
        assert!(slice.freq.iter().all(|hz| (5.0..=200.0).contains(hz)));
        assert!((slice.freq[0] - 5.46875).abs() < 1e-9);
        assert_eq!(slice.freq.len(), slice.valid_idx.len());
    }

    #[test]
    fn test_slice_cache_is_bounded() {
        let fft = FftProcessor::new(64, 0.0, 10_000.0).expect("processor");
        for rate in 1..=(FFT_CACHE_MAX_ENTRIES as u32 + 10) {
            let _ = fft.frequency_slice(rate);
        }
        assert_eq!(fft.cached_rates(), FFT_CACHE_MAX_ENTRIES);
    }

    #[test]
    fn test_tone_amplitude_is_recovered() {
        let fft = FftProcessor::new(1024, 0.0, 400.0).expect("processor");
        // 50 Hz lands exactly on bin 64 at 800 Hz / 1024
        let spec = fft.amplitude(&tone(50.0, 0.2, 800, 1024));
        let (peak_bin, peak_amp) = spec
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        assert_eq!(peak_bin, 64);
        assert!((peak_amp - 0.2).abs() < 0.01, "amp {peak_amp}");
    }

    #[test]
    fn test_analyze_reports_dominant_axis_peak() {
        let fft = FftProcessor::new(1024, 5.0, 200.0).expect("processor");
        let block: AxisBlock = [tone(31.25, 0.05, 800, 1024), vec![0.0; 1024], vec![0.0; 1024]];
        let result = fft.analyze(&block, 800);
        let top = result.axis_peaks[0].first().expect("x peak");
        assert!((top.hz - 31.25).abs() < 1.0);
        assert!(top.snr_ratio > 1.0);
        assert!(result.strength.vibration_strength_db > 0.0);
        assert_eq!(result.combined.len(), result.freq.len());
    }

    #[test]
    fn test_top_peaks_falls_back_to_argmax() {
        let freqs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let amps = [0.5, 0.5, 0.5, 0.5, 0.5];
        let peaks = top_peaks(&freqs, &amps, 3, 1);
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].hz - 2.0).abs() < f64::EPSILON);

        assert!(top_peaks(&freqs, &[0.0; 5], 3, 1).is_empty());
    }

    #[test]
    fn test_medfilt3_removes_isolated_spike_and_keeps_edges() {
        let mut rows = vec![[9.0, 0.0, 0.0], [0.0, 0.0, 0.0], [5.0, 0.0, 0.0], [0.0, 0.0, 0.0], [7.0, 0.0, 0.0]];
        medfilt3(&mut rows);
        assert!((rows[0][0] - 9.0).abs() < f64::EPSILON);
        assert!(rows[2][0].abs() < f64::EPSILON);
        assert!((rows[4][0] - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_smooth_spectrum_edge_padding() {
        let smoothed = smooth_spectrum(&[3.0, 0.0, 0.0, 0.0], 3);
        assert!((smoothed[0] - 2.0).abs() < 1e-12);
        assert!((smoothed[1] - 1.0).abs() < 1e-12);
        assert!(smoothed[3].abs() < 1e-12);
    }
}
