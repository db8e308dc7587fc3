//! Pipeline configuration structs and TOML loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::orders::AnalysisSettings;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "VIBESENSOR_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "vibesensor.toml";

// ============================================================================
// Top-level config
// ============================================================================

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    /// Car settings used until the operator supplies an updated snapshot.
    #[serde(default)]
    pub vehicle: AnalysisSettings,
}

impl PipelineConfig {
    /// Load configuration using the standard search order.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded pipeline config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./vibesensor.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded pipeline config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, err) => ConfigError::Parse(path.to_path_buf(), err),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        // Unknown keys only warn; existing configs keep working.
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let mut config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.vehicle = config.vehicle.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate ranges and cross-field consistency, collecting every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.processing;
        let d = &self.diagnostics;
        let mut errors: Vec<String> = Vec::new();

        if p.sample_rate_hz == 0 || p.sample_rate_hz > defaults::MAX_CLIENT_SAMPLE_RATE_HZ {
            errors.push(format!(
                "processing.sample_rate_hz ({}) must be in 1..={}",
                p.sample_rate_hz,
                defaults::MAX_CLIENT_SAMPLE_RATE_HZ
            ));
        }
        if p.waveform_seconds == 0 {
            errors.push("processing.waveform_seconds must be >= 1".to_string());
        }
        if p.waveform_display_hz == 0 {
            errors.push("processing.waveform_display_hz must be >= 1".to_string());
        }
        if p.fft_n < defaults::MIN_FFT_N {
            errors.push(format!(
                "processing.fft_n ({}) must be >= {}",
                p.fft_n,
                defaults::MIN_FFT_N
            ));
        } else if p.fft_n > p.capacity() {
            errors.push(format!(
                "processing.fft_n ({}) exceeds buffer capacity ({} = sample_rate_hz x waveform_seconds)",
                p.fft_n,
                p.capacity()
            ));
        }
        if !(p.spectrum_min_hz.is_finite() && p.spectrum_min_hz >= 0.0) {
            errors.push(format!(
                "processing.spectrum_min_hz ({}) must be finite and >= 0",
                p.spectrum_min_hz
            ));
        }
        if !(p.spectrum_max_hz.is_finite() && p.spectrum_max_hz > p.spectrum_min_hz) {
            errors.push(format!(
                "processing.spectrum_max_hz ({}) must exceed spectrum_min_hz ({})",
                p.spectrum_max_hz, p.spectrum_min_hz
            ));
        }
        if let Some(scale) = p.accel_scale_g_per_lsb {
            if !(scale.is_finite() && scale > 0.0) {
                errors.push(format!(
                    "processing.accel_scale_g_per_lsb ({scale}) must be positive"
                ));
            }
        }
        if p.worker_threads == 0 {
            errors.push("processing.worker_threads must be >= 1".to_string());
        }
        if d.heavy_tick_ms == 0 || d.light_tick_ms == 0 {
            errors.push("diagnostics tick intervals must be > 0 ms".to_string());
        }
        if d.light_tick_ms > d.heavy_tick_ms {
            errors.push(format!(
                "diagnostics.light_tick_ms ({}) must not exceed heavy_tick_ms ({})",
                d.light_tick_ms, d.heavy_tick_ms
            ));
        }
        if d.client_ttl_seconds == 0 {
            errors.push("diagnostics.client_ttl_seconds must be >= 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Config errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation failed:\n{}", bullet_list(.0))]
    Validation(Vec<String>),
}

fn bullet_list(errors: &[String]) -> String {
    errors.iter().map(|e| format!("  - {e}\n")).collect()
}

// ============================================================================
// Processing
// ============================================================================

fn default_sample_rate_hz() -> u32 {
    defaults::SAMPLE_RATE_HZ
}
fn default_waveform_seconds() -> u32 {
    defaults::WAVEFORM_SECONDS
}
fn default_waveform_display_hz() -> u32 {
    defaults::WAVEFORM_DISPLAY_HZ
}
fn default_fft_n() -> usize {
    defaults::FFT_N
}
fn default_spectrum_min_hz() -> f64 {
    defaults::SPECTRUM_MIN_HZ
}
fn default_spectrum_max_hz() -> f64 {
    defaults::SPECTRUM_MAX_HZ
}
fn default_spike_filter_enabled() -> bool {
    true
}
fn default_worker_threads() -> usize {
    defaults::WORKER_THREADS
}

/// Signal processing parameters shared by every client buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Rate assumed for clients that have not reported one.
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
    /// Seconds of samples retained per client.
    #[serde(default = "default_waveform_seconds")]
    pub waveform_seconds: u32,
    #[serde(default = "default_waveform_display_hz")]
    pub waveform_display_hz: u32,
    #[serde(default = "default_fft_n")]
    pub fft_n: usize,
    #[serde(default = "default_spectrum_min_hz")]
    pub spectrum_min_hz: f64,
    #[serde(default = "default_spectrum_max_hz")]
    pub spectrum_max_hz: f64,
    /// Raw LSB to g conversion. `None` keeps raw values.
    #[serde(default)]
    pub accel_scale_g_per_lsb: Option<f64>,
    /// 3-point median filter against single-sample spikes.
    #[serde(default = "default_spike_filter_enabled")]
    pub spike_filter_enabled: bool,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: default_sample_rate_hz(),
            waveform_seconds: default_waveform_seconds(),
            waveform_display_hz: default_waveform_display_hz(),
            fft_n: default_fft_n(),
            spectrum_min_hz: default_spectrum_min_hz(),
            spectrum_max_hz: default_spectrum_max_hz(),
            accel_scale_g_per_lsb: None,
            spike_filter_enabled: default_spike_filter_enabled(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl ProcessingConfig {
    /// Ring buffer capacity for a client at the default sample rate.
    pub fn capacity(&self) -> usize {
        self.sample_rate_hz as usize * self.waveform_seconds as usize
    }
}

// ============================================================================
// Diagnostics / live loop
// ============================================================================

fn default_heavy_tick_ms() -> u64 {
    defaults::HEAVY_TICK_MS
}
fn default_light_tick_ms() -> u64 {
    defaults::LIGHT_TICK_MS
}
fn default_client_ttl_seconds() -> u64 {
    defaults::CLIENT_TTL_SECONDS
}
fn default_recent_data_max_age_s() -> f64 {
    defaults::RECENT_DATA_MAX_AGE_S
}

/// Tick cadence and client lifecycle for the live loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Interval between full spectrum recomputes.
    #[serde(default = "default_heavy_tick_ms")]
    pub heavy_tick_ms: u64,
    /// Interval between diagnostics-only updates.
    #[serde(default = "default_light_tick_ms")]
    pub light_tick_ms: u64,
    #[serde(default = "default_client_ttl_seconds")]
    pub client_ttl_seconds: u64,
    /// Clients without samples in this window are skipped by heavy ticks.
    #[serde(default = "default_recent_data_max_age_s")]
    pub recent_data_max_age_s: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            heavy_tick_ms: default_heavy_tick_ms(),
            light_tick_ms: default_light_tick_ms(),
            client_ttl_seconds: default_client_ttl_seconds(),
            recent_data_max_age_s: default_recent_data_max_age_s(),
        }
    }
}
