//! Config Validation Tests
//!
//! Exercises TOML loading, unknown-key detection and range validation of
//! the pipeline config independently from the rest of the pipeline.

use std::io::Write;

use vibesensor::config::validation::{known_config_keys, suggest_correction, validate_unknown_keys};
use vibesensor::config::{ConfigError, PipelineConfig};

// ============================================================================
// Unknown key detection
// ============================================================================

#[test]
fn typo_in_processing_key_warns_with_suggestion() {
    let toml_str = r#"
[processing]
fft_nn = 1024
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert!(warnings[0].field.contains("fft_nn"));
    assert_eq!(warnings[0].suggestion.as_deref(), Some("processing.fft_n"));
}

#[test]
fn unknown_section_warns_without_breaking_load() {
    let toml_str = r#"
[dashboard]
port = 8000

[diagnostics]
heavy_tick_ms = 300
"#;
    assert_eq!(validate_unknown_keys(toml_str).len(), 2);
    let config = PipelineConfig::from_toml_str(toml_str).expect("unknown keys only warn");
    assert_eq!(config.diagnostics.heavy_tick_ms, 300);
}

#[test]
fn distant_key_gets_no_suggestion() {
    let known = known_config_keys();
    assert_eq!(suggest_correction("completely.unrelated", &known), None);
    assert_eq!(
        suggest_correction("vehicle.rim_inch", &known).as_deref(),
        Some("vehicle.rim_in")
    );
}

// ============================================================================
// Range validation
// ============================================================================

#[test]
fn zero_sample_rate_is_rejected() {
    let toml_str = r#"
[processing]
sample_rate_hz = 0
"#;
    match PipelineConfig::from_toml_str(toml_str) {
        Err(ConfigError::Validation(errors)) => {
            assert!(errors.iter().any(|e| e.contains("sample_rate_hz")), "{errors:?}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn wrong_type_is_a_parse_error() {
    let toml_str = r#"
[diagnostics]
heavy_tick_ms = "fast"
"#;
    assert!(matches!(PipelineConfig::from_toml_str(toml_str), Err(ConfigError::Parse(..))));
}

// ============================================================================
// File loading
// ============================================================================

#[test]
fn load_from_file_reads_all_sections() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
[processing]
sample_rate_hz = 1000
fft_n = 1024
accel_scale_g_per_lsb = 0.0005

[diagnostics]
client_ttl_seconds = 30

[vehicle]
rim_in = 18.0
final_drive_ratio = 3.9
"#
    )
    .expect("write config");

    let config = PipelineConfig::load_from_file(file.path()).expect("load config");
    assert_eq!(config.processing.sample_rate_hz, 1000);
    assert_eq!(config.processing.accel_scale_g_per_lsb, Some(0.0005));
    assert_eq!(config.diagnostics.client_ttl_seconds, 30);
    assert!((config.vehicle.rim_in - 18.0).abs() < f64::EPSILON);
    assert!((config.vehicle.final_drive_ratio - 3.9).abs() < f64::EPSILON);
}

#[test]
fn missing_file_is_io_error_with_path() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("absent.toml");
    match PipelineConfig::load_from_file(&path) {
        Err(ConfigError::Io(p, _)) => assert_eq!(p, path),
        other => panic!("expected I/O error, got {other:?}"),
    }
}

#[test]
fn parse_error_reports_file_path() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "[processing\nfft_n = 1024").expect("write config");
    match PipelineConfig::load_from_file(file.path()) {
        Err(e @ ConfigError::Parse(..)) => {
            assert!(e.to_string().contains(&file.path().display().to_string()));
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}
