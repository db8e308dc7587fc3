//! Per-client time-domain and spectral metrics.

use serde::Serialize;

use super::fft::{detrend, AxisBlock, AxisPeak, SpectrumResult};
use crate::strength::{StrengthPeak, VibrationStrength};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AxisMetrics {
    pub rms: f64,
    pub p2p: f64,
    pub peaks: Vec<AxisPeak>,
}

/// Metrics of the vector magnitude `sqrt(x² + y² + z²)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombinedMetrics {
    pub vib_mag_rms: f64,
    pub vib_mag_p2p: f64,
    pub peaks: Vec<StrengthPeak>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength_metrics: Option<VibrationStrength>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientMetrics {
    pub x: AxisMetrics,
    pub y: AxisMetrics,
    pub z: AxisMetrics,
    pub combined: CombinedMetrics,
    /// Present once the buffer held a full FFT block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength_metrics: Option<VibrationStrength>,
}

impl ClientMetrics {
    /// RMS and peak-to-peak of the detrended window. Non-finite values become 0.
    pub fn from_window(window: &AxisBlock) -> Self {
        let detrended: [Vec<f64>; 3] = [detrend(&window[0]), detrend(&window[1]), detrend(&window[2])];
        let axis = |samples: &[f64]| AxisMetrics {
            rms: finite_or_zero(rms(samples)),
            p2p: finite_or_zero(p2p(samples)),
            peaks: Vec::new(),
        };

        let n = detrended.iter().map(Vec::len).min().unwrap_or(0);
        let vib_mag: Vec<f64> = (0..n)
            .map(|i| {
                let [x, y, z] = [detrended[0][i], detrended[1][i], detrended[2][i]];
                z.mul_add(z, x.mul_add(x, y * y)).sqrt()
            })
            .collect();

        Self {
            x: axis(&detrended[0]),
            y: axis(&detrended[1]),
            z: axis(&detrended[2]),
            combined: CombinedMetrics {
                vib_mag_rms: finite_or_zero(rms(&vib_mag)),
                vib_mag_p2p: finite_or_zero(p2p(&vib_mag)),
                peaks: Vec::new(),
                strength_metrics: None,
            },
            strength_metrics: None,
        }
    }

    /// Attach the peaks and strength metrics of an FFT pass.
    pub fn apply_spectrum(&mut self, spectrum: &SpectrumResult) {
        let [px, py, pz] = &spectrum.axis_peaks;
        self.x.peaks.clone_from(px);
        self.y.peaks.clone_from(py);
        self.z.peaks.clone_from(pz);
        self.combined.peaks.clone_from(&spectrum.strength.top_peaks);
        self.combined.strength_metrics = Some(spectrum.strength.clone());
        self.strength_metrics = Some(spectrum.strength.clone());
    }
}

fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|v| v * v).sum::<f64>() / samples.len() as f64).sqrt()
}

fn p2p(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let (lo, hi) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    hi - lo
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
