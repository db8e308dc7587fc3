//! Pipeline Configuration Module
//!
//! Provides the processing, live-loop and default vehicle settings loaded
//! from a TOML file.
//!
//! ## Loading Order
//!
//! 1. `VIBESENSOR_CONFIG` environment variable (path to TOML file)
//! 2. `vibesensor.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` from the
//! binaries. Library types take their configuration as explicit arguments.
//!
//! ```ignore
//! config::init(PipelineConfig::load());
//! let fft_n = config::get().processing.fft_n;
//! ```

mod pipeline_config;
pub mod defaults;
pub mod validation;

pub use pipeline_config::*;

use std::sync::OnceLock;

/// Global pipeline configuration, initialized once at startup.
static PIPELINE_CONFIG: OnceLock<PipelineConfig> = OnceLock::new();

/// Initialize the global pipeline configuration.
///
/// Later calls are ignored with a warning.
pub fn init(config: PipelineConfig) {
    if PIPELINE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get the global pipeline configuration.
///
/// Falls back to built-in defaults when `init()` has not been called.
pub fn get() -> &'static PipelineConfig {
    PIPELINE_CONFIG.get_or_init(PipelineConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    PIPELINE_CONFIG.get().is_some()
}
