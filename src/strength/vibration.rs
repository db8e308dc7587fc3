//! Noise-floor estimation, peak detection and the vibration strength dB scalar.
//!
//! Everything here is a pure function over single-sided FFT amplitude
//! arrays in g. The combined spectrum is `sqrt(mean(axis_amp²))` per bin and
//! the strength of a peak is its band-limited RMS compared against the
//! peak-excluded median floor on a 20·log10 scale.

use serde::Serialize;

use super::bands::{bucket_for_strength, StrengthBucket};

// ============================================================================
// Tuned constants
// ============================================================================

/// Half-width (Hz) of the band integrated around a peak bin.
pub const PEAK_BANDWIDTH_HZ: f64 = 1.2;

/// Minimum spacing (Hz) between two reported peaks.
pub const PEAK_SEPARATION_HZ: f64 = 1.2;

/// Lower bound on the dB epsilon, in g.
pub const STRENGTH_EPSILON_MIN_G: f64 = 1e-9;

/// Epsilon as a fraction of the floor amplitude.
pub const STRENGTH_EPSILON_FLOOR_RATIO: f64 = 0.05;

/// A bin must exceed the P20 floor by this factor to be a candidate peak.
pub const PEAK_THRESHOLD_FLOOR_RATIO: f64 = 2.6;

/// Default number of peaks kept by [`compute_vibration_strength_db`].
pub const DEFAULT_TOP_N: usize = 5;

/// Clamp range applied to per-sensor dB values before linear combination.
const COMBINE_DB_MIN: f64 = -60.0;
const COMBINE_DB_MAX: f64 = 200.0;

// ============================================================================
// Result types
// ============================================================================

/// One ranked peak of the combined spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrengthPeak {
    pub hz: f64,
    /// Band RMS amplitude around the peak (g).
    pub amp: f64,
    pub vibration_strength_db: f64,
    pub strength_bucket: Option<StrengthBucket>,
}

/// Strength metrics for one combined spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VibrationStrength {
    pub vibration_strength_db: f64,
    pub peak_amp_g: f64,
    pub noise_floor_amp_g: f64,
    pub strength_bucket: Option<StrengthBucket>,
    pub top_peaks: Vec<StrengthPeak>,
}

impl VibrationStrength {
    pub const fn empty() -> Self {
        Self {
            vibration_strength_db: 0.0,
            peak_amp_g: 0.0,
            noise_floor_amp_g: 0.0,
            strength_bucket: None,
            top_peaks: Vec::new(),
        }
    }
}

// ============================================================================
// Statistics helpers
// ============================================================================

/// Median with even-length averaging. Empty input yields 0.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(f64::total_cmp);
    let mid = ordered.len() / 2;
    if ordered.len() % 2 == 0 {
        (ordered[mid - 1] + ordered[mid]) / 2.0
    } else {
        ordered[mid]
    }
}

/// Linearly interpolated percentile of an already sorted slice.
pub fn percentile(sorted_values: &[f64], q: f64) -> f64 {
    match sorted_values.len() {
        0 => 0.0,
        1 => sorted_values[0],
        len => {
            let clamped = if q.is_finite() { q.clamp(0.0, 1.0) } else { 0.0 };
            let pos = clamped * (len - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(len - 1);
            if lo == hi {
                return sorted_values[lo];
            }
            let frac = pos - lo as f64;
            (sorted_values[hi] - sorted_values[lo]).mul_add(frac, sorted_values[lo])
        }
    }
}

// ============================================================================
// Spectrum reductions
// ============================================================================

/// RMS across axes per bin, truncated to the shortest axis.
pub fn combined_spectrum_amp_g(axis_spectra_amp_g: &[&[f64]]) -> Vec<f64> {
    let target_len = axis_spectra_amp_g.iter().map(|a| a.len()).min().unwrap_or(0);
    if target_len == 0 {
        return Vec::new();
    }
    let divisor = (axis_spectra_amp_g.len() as f64).max(1.0);
    (0..target_len)
        .map(|idx| {
            let sq_sum: f64 = axis_spectra_amp_g.iter().map(|axis| axis[idx] * axis[idx]).sum();
            (sq_sum / divisor).sqrt()
        })
        .collect()
}

/// 20th percentile of the finite, non-negative bins, skipping DC.
pub fn noise_floor_amp_p20_g(combined: &[f64]) -> f64 {
    let band = if combined.len() > 1 { &combined[1..] } else { combined };
    let mut finite: Vec<f64> = band
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .collect();
    finite.sort_by(f64::total_cmp);
    percentile(&finite, 0.20)
}

/// Median floor over `[min_hz, max_hz]` excluding bins near any peak.
///
/// Falls back to the P20 floor when every bin is excluded so that a fully
/// peaked spectrum never reports a zero floor.
pub fn strength_floor_amp_g(
    freq_hz: &[f64],
    combined: &[f64],
    peak_indexes: &[usize],
    exclusion_hz: f64,
    min_hz: f64,
    max_hz: f64,
) -> f64 {
    let n = freq_hz.len().min(combined.len());
    if n == 0 {
        return 0.0;
    }
    let peak_hz: Vec<f64> = peak_indexes
        .iter()
        .filter(|&&idx| idx < n)
        .map(|&idx| freq_hz[idx])
        .collect();
    let selected: Vec<f64> = (0..n)
        .filter(|&idx| {
            let hz = freq_hz[idx];
            hz >= min_hz
                && hz <= max_hz
                && !peak_hz.iter().any(|c| (hz - c).abs() <= exclusion_hz)
        })
        .map(|idx| combined[idx])
        .filter(|amp| amp.is_finite() && *amp >= 0.0)
        .collect();
    if selected.is_empty() {
        return noise_floor_amp_p20_g(&combined[..n]);
    }
    median(&selected)
}

/// RMS of the bins within `bandwidth_hz` of `center_idx`.
pub fn peak_band_rms_amp_g(
    freq_hz: &[f64],
    combined: &[f64],
    center_idx: usize,
    bandwidth_hz: f64,
) -> f64 {
    let n = freq_hz.len().min(combined.len());
    if center_idx >= n {
        return 0.0;
    }
    let center_hz = freq_hz[center_idx];
    let (sq_sum, count) = (0..n)
        .filter(|&idx| (freq_hz[idx] - center_hz).abs() <= bandwidth_hz)
        .fold((0.0, 0usize), |(sum, count), idx| {
            (combined[idx].mul_add(combined[idx], sum), count + 1)
        });
    if count == 0 {
        return 0.0;
    }
    (sq_sum / count as f64).sqrt()
}

/// `20·log10((band + ε) / (floor + ε))` with non-finite inputs treated as 0.
pub fn vibration_strength_db_scalar(
    peak_band_rms_amp_g: f64,
    floor_amp_g: f64,
    epsilon_g: Option<f64>,
) -> f64 {
    let floor = sanitize_amp(floor_amp_g);
    let band = sanitize_amp(peak_band_rms_amp_g);
    let eps = match epsilon_g {
        Some(e) if e.is_finite() => STRENGTH_EPSILON_MIN_G.max(e),
        Some(_) => STRENGTH_EPSILON_MIN_G,
        None => STRENGTH_EPSILON_MIN_G.max(floor * STRENGTH_EPSILON_FLOOR_RATIO),
    };
    20.0 * ((band + eps) / (floor + eps)).log10()
}

fn sanitize_amp(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

// ============================================================================
// Strength metrics
// ============================================================================

/// Detect, rank and score peaks of a combined spectrum.
pub fn compute_vibration_strength_db(
    freq_hz: &[f64],
    combined_spectrum: &[f64],
    peak_bandwidth_hz: f64,
    peak_separation_hz: f64,
    top_n: usize,
) -> VibrationStrength {
    let n = freq_hz.len().min(combined_spectrum.len());
    if n == 0 {
        return VibrationStrength::empty();
    }

    let freq = &freq_hz[..n];
    let combined: Vec<f64> = combined_spectrum[..n].iter().map(|&v| sanitize_amp(v)).collect();
    let floor_p20 = noise_floor_amp_p20_g(&combined);
    let threshold = (floor_p20 * PEAK_THRESHOLD_FLOOR_RATIO).max(floor_p20 + STRENGTH_EPSILON_MIN_G);

    let mut local_maxima: Vec<usize> = (1..n.saturating_sub(1))
        .filter(|&idx| {
            let value = combined[idx];
            value >= threshold && value > combined[idx - 1] && value >= combined[idx + 1]
        })
        .collect();
    if n > 1 {
        let last = combined[n - 1];
        if last >= threshold && last > combined[n - 2] {
            local_maxima.push(n - 1);
        }
    }
    local_maxima.sort_by(|&a, &b| combined[b].total_cmp(&combined[a]));
    let peak_indexes = &local_maxima[..local_maxima.len().min(top_n.max(1))];

    let floor_strength = strength_floor_amp_g(
        freq,
        &combined,
        peak_indexes,
        peak_separation_hz,
        freq[0],
        freq[n - 1],
    );

    let mut candidates: Vec<StrengthPeak> = local_maxima
        .iter()
        .filter_map(|&idx| {
            let band_rms = peak_band_rms_amp_g(freq, &combined, idx, peak_bandwidth_hz);
            let db = vibration_strength_db_scalar(band_rms, floor_strength, None);
            db.is_finite().then(|| StrengthPeak {
                hz: freq[idx],
                amp: band_rms,
                vibration_strength_db: db,
                strength_bucket: bucket_for_strength(db),
            })
        })
        .collect();
    candidates.sort_by(|a, b| b.vibration_strength_db.total_cmp(&a.vibration_strength_db));

    let mut chosen: Vec<StrengthPeak> = Vec::with_capacity(top_n);
    for candidate in candidates {
        if chosen.len() >= top_n {
            break;
        }
        if chosen
            .iter()
            .any(|existing| (existing.hz - candidate.hz).abs() < peak_separation_hz)
        {
            continue;
        }
        chosen.push(candidate);
    }

    let (top_db, peak_amp_g) = chosen
        .first()
        .map_or((0.0, 0.0), |p| (p.vibration_strength_db, p.amp));

    VibrationStrength {
        vibration_strength_db: top_db,
        peak_amp_g,
        noise_floor_amp_g: floor_strength,
        strength_bucket: bucket_for_strength(top_db),
        top_peaks: chosen,
    }
}

/// Combine per-sensor strength values in the linear amplitude domain.
///
/// Each value is converted to `10^(db/20)`, averaged, and converted back.
/// Non-finite entries are skipped; `None` when nothing usable remains.
pub fn combine_amplitude_strength_db(values_db: &[f64]) -> Option<f64> {
    let linear: Vec<f64> = values_db
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| 10f64.powf(v.clamp(COMBINE_DB_MIN, COMBINE_DB_MAX) / 20.0))
        .collect();
    if linear.is_empty() {
        return None;
    }
    let mean = linear.iter().sum::<f64>() / linear.len() as f64;
    Some(vibration_strength_db_scalar(mean, 1.0, Some(STRENGTH_EPSILON_MIN_G)))
}
