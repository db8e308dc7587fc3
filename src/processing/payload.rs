//! Serializable views of the processor state for the transport layer.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::fft::AxisPeak;
use super::metrics::ClientMetrics;
use crate::strength::{StrengthPeak, VibrationStrength};

/// Warning code for clients whose frequency axes disagree.
pub const FREQUENCY_BIN_MISMATCH: &str = "frequency_bin_mismatch";

/// Latest spectrum of one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpectrumPayload {
    /// Only set inside a multi-client payload whose axes disagree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<Vec<f64>>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub combined_spectrum_amp_g: Vec<f64>,
    pub strength_metrics: Option<VibrationStrength>,
}

impl SpectrumPayload {
    pub fn is_empty(&self) -> bool {
        self.combined_spectrum_amp_g.is_empty() && self.strength_metrics.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencyMismatchWarning {
    pub code: &'static str,
    pub message: String,
    pub client_ids: Vec<String>,
}

/// Overlap summary attached to multi-client payloads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlignmentSummary {
    pub overlap_ratio: f64,
    pub aligned: bool,
    pub shared_window_s: f64,
    pub sensor_count: usize,
    pub clock_synced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MultiSpectrumPayload {
    /// Shared axis; empty when clients disagree (see `warning`).
    pub freq: Vec<f64>,
    pub clients: BTreeMap<String, SpectrumPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<FrequencyMismatchWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentSummary>,
}

impl MultiSpectrumPayload {
    /// Strength metrics of `client_id`, if it produced a spectrum.
    pub fn strength_for(&self, client_id: &str) -> Option<&VibrationStrength> {
        self.clients.get(client_id)?.strength_metrics.as_ref()
    }
}

/// Decimated waveform with a time axis relative to the newest sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Waveform {
    pub t: Vec<f64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectedSpectrum {
    pub freq: Vec<f64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub combined_spectrum_amp_g: Vec<f64>,
    pub strength_metrics: Option<VibrationStrength>,
}

/// Everything the dashboard needs for the focused client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedPayload {
    pub client_id: String,
    pub sample_rate_hz: u32,
    pub waveform: Option<Waveform>,
    pub spectrum: Option<SelectedSpectrum>,
    pub metrics: Option<Arc<ClientMetrics>>,
}

impl SelectedPayload {
    pub(crate) fn empty(client_id: &str, sample_rate_hz: u32) -> Self {
        Self {
            client_id: client_id.to_string(),
            sample_rate_hz,
            waveform: None,
            spectrum: None,
            metrics: None,
        }
    }
}

// ============================================================================
// Debug views
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawStats {
    pub mean_g: [f64; 3],
    pub std_g: [f64; 3],
    pub min_g: [f64; 3],
    pub max_g: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopBin {
    pub bin: usize,
    pub freq_hz: f64,
    pub combined_amp_g: f64,
    pub x_amp_g: f64,
    pub y_amp_g: f64,
    pub z_amp_g: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumDebug {
    pub client_id: String,
    pub sample_rate_hz: u32,
    pub fft_n: usize,
    pub fft_scale: f64,
    pub window: &'static str,
    pub spectrum_min_hz: f64,
    pub spectrum_max_hz: f64,
    pub freq_bins: usize,
    pub freq_resolution_hz: f64,
    pub raw_stats: RawStats,
    pub vibration_strength_db: f64,
    pub top_bins_by_amplitude: Vec<TopBin>,
    pub strength_peaks: Vec<StrengthPeak>,
    pub axis_peaks: [Vec<AxisPeak>; 3],
}

/// Result of [`SignalProcessor::debug_spectrum`](super::SignalProcessor::debug_spectrum).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DebugSpectrum {
    Ready(Box<SpectrumDebug>),
    InsufficientSamples { error: &'static str, count: usize, fft_n: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSamples {
    pub client_id: String,
    pub sample_rate_hz: u32,
    pub n_samples: usize,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_axis_payload_omits_per_client_freq_and_warning() {
        let mut payload = MultiSpectrumPayload {
            freq: vec![5.0, 6.0],
            ..MultiSpectrumPayload::default()
        };
        payload.clients.insert("a".into(), SpectrumPayload::default());
        let json = serde_json::to_value(&payload).expect("serialize");
        assert!(json.get("warning").is_none());
        assert!(json.get("alignment").is_none());
        assert!(json["clients"]["a"].get("freq").is_none());
        assert!(json["clients"]["a"]["strength_metrics"].is_null());
    }

    #[test]
    fn test_insufficient_debug_serializes_flat() {
        let debug = DebugSpectrum::InsufficientSamples {
            error: "insufficient samples",
            count: 12,
            fft_n: 2048,
        };
        let json = serde_json::to_value(&debug).expect("serialize");
        assert_eq!(json["error"], "insufficient samples");
        assert_eq!(json["count"], 12);
    }
}
