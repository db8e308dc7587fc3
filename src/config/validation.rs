//! Unknown-key detection with Levenshtein suggestions.
//!
//! The raw TOML is parsed into `toml::Value`, its key tree is walked and
//! compared against the known field names. Unknown keys produce warnings
//! with a "did you mean?" suggestion and never break an existing config.

use std::collections::HashSet;

/// A non-fatal config warning (typo, unknown section).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Returns the complete set of valid dotted key paths for `PipelineConfig`.
///
/// Maintained by hand to match the struct hierarchy in `pipeline_config.rs`
/// and `orders::AnalysisSettings`.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [processing]
        "processing",
        "processing.sample_rate_hz",
        "processing.waveform_seconds",
        "processing.waveform_display_hz",
        "processing.fft_n",
        "processing.spectrum_min_hz",
        "processing.spectrum_max_hz",
        "processing.accel_scale_g_per_lsb",
        "processing.spike_filter_enabled",
        "processing.worker_threads",
        // [diagnostics]
        "diagnostics",
        "diagnostics.heavy_tick_ms",
        "diagnostics.light_tick_ms",
        "diagnostics.client_ttl_seconds",
        "diagnostics.recent_data_max_age_s",
        // [vehicle]
        "vehicle",
        "vehicle.tire_width_mm",
        "vehicle.tire_aspect_pct",
        "vehicle.rim_in",
        "vehicle.final_drive_ratio",
        "vehicle.current_gear_ratio",
        "vehicle.tire_deflection_factor",
        "vehicle.wheel_bandwidth_pct",
        "vehicle.driveshaft_bandwidth_pct",
        "vehicle.engine_bandwidth_pct",
        "vehicle.speed_uncertainty_pct",
        "vehicle.tire_diameter_uncertainty_pct",
        "vehicle.final_drive_uncertainty_pct",
        "vehicle.gear_uncertainty_pct",
        "vehicle.min_abs_band_hz",
        "vehicle.max_band_half_width_pct",
    ];
    keys.iter().copied().collect()
}

/// Walk a TOML value tree and return every dotted key path.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, levenshtein(unknown, k)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by(|(ka, da), (kb, db)| da.cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// Parse errors yield no warnings; serde reports them afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}
