//! Pipeline Regression Tests
//!
//! Drives simulated four-corner data through the signal processor and the
//! live diagnostics engine on an explicit clock, and through the full live
//! loop fed from JSON lines. Asserts on classification, severity events,
//! location agreement and data integrity (no NaN in published snapshots).

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use vibesensor::config::PipelineConfig;
use vibesensor::diagnostics::{DrivingPhase, EventKind, LiveDiagnosticsEngine};
use vibesensor::orders::{classify_peak_hz, MatrixSource};
use vibesensor::pipeline::{JsonLinesSource, LiveLoop, LiveState, SensorRegistry, SystemStatus};
use vibesensor::simulate::{Fault, SimulationConfig, VehicleSimulator};
use vibesensor::{DiagnosticsSnapshot, SignalProcessor};

const HEAVY_TICK_MS: u64 = 250;

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.processing.sample_rate_hz = 800;
    config.processing.waveform_seconds = 4;
    config.processing.fft_n = 1024;
    config.processing.accel_scale_g_per_lsb = Some(0.0005);
    config
}

fn simulator(config: &PipelineConfig, fault: Fault, seconds: f64) -> VehicleSimulator {
    let sim = SimulationConfig {
        fault,
        seconds,
        speed_kmh: 80.0,
        sample_rate_hz: config.processing.sample_rate_hz,
        seed: Some(42),
        ..SimulationConfig::default()
    };
    VehicleSimulator::new(sim, &config.vehicle).expect("simulator")
}

/// Ingest one round of batches per heavy tick and run the engine after each.
fn drive(config: &PipelineConfig, sim: VehicleSimulator, speed_mps: Option<f64>) -> DiagnosticsSnapshot {
    let processor = SignalProcessor::new(&config.processing, None).expect("processor");
    let mut registry = SensorRegistry::new(config.diagnostics.client_ttl_seconds);
    let mut engine = LiveDiagnosticsEngine::new();
    let per_round = sim.sensor_count();

    let mut snapshot = None;
    let mut now_ms = 0u64;
    let batches: Vec<_> = sim.collect();
    for round in batches.chunks(per_round) {
        for batch in round {
            let result = registry.update_from_batch(batch, now_ms as f64 / 1000.0);
            assert!(!result.is_duplicate && !result.reset_detected);
            processor.ingest(&batch.client_id, &batch.samples, batch.sample_rate_hz, batch.t0_us);
        }
        now_ms += HEAVY_TICK_MS;
        let ids = registry.active_client_ids(now_ms as f64 / 1000.0);
        processor.compute_all(&ids);
        let spectra = processor.multi_spectrum_payload(&ids);
        let clients = registry.client_infos(now_ms as f64 / 1000.0);
        snapshot = Some(engine.update_at(now_ms, speed_mps, &clients, Some(&spectra), &config.vehicle));
    }
    snapshot.expect("at least one tick")
}

fn assert_finite(snapshot: &DiagnosticsSnapshot) {
    for event in &snapshot.events {
        assert!(event.peak_hz.is_finite() && event.vibration_strength_db.is_finite(), "{event:?}");
    }
    for finding in &snapshot.findings {
        assert!(finding.confidence.is_finite() && finding.ranking_score.is_finite(), "{finding:?}");
    }
    let json = serde_json::to_string(snapshot).expect("snapshot serializes");
    assert!(!json.contains("NaN"));
}

#[test]
fn wheel_fault_becomes_top_finding() {
    let config = test_config();
    let sim = simulator(&config, Fault::Wheel, 10.0);
    let fault_hz = sim.fault_hz().expect("fault frequency");
    let speed = Some(80.0 / 3.6);
    let expected = classify_peak_hz(fault_hz, speed, &config.vehicle).class;
    assert!(expected.is_order(), "fault should match a wheel order, got {expected}");

    let snapshot = drive(&config, sim, speed);
    assert_finite(&snapshot);
    assert_eq!(snapshot.diagnostics_sequence, 40);
    assert_eq!(snapshot.driving_phase, DrivingPhase::Cruise);

    let top = snapshot.top_finding.as_ref().expect("top finding");
    assert!(top.is_ranked(), "{top:?}");
    assert_eq!(top.class, Some(expected));
    assert!(top.severity.is_some());
    assert!(top.peak_hz.is_some_and(|hz| (hz - fault_hz).abs() < 1.5));

    // the faulted corner emitted its own event
    assert!(snapshot
        .events
        .iter()
        .any(|e| e.kind == EventKind::Single && e.sensor_id.as_deref() == Some("fl") && e.class == expected));
    // every corner sees the tone, so a multi-sensor group forms
    assert!(snapshot
        .events
        .iter()
        .any(|e| e.kind == EventKind::Multi && e.sensor_count >= 2 && e.class == expected));

    let wheel_row = &snapshot.matrix[&MatrixSource::Wheel];
    assert!(wheel_row.values().map(|cell| cell.count).sum::<u64>() >= 1);
    assert!(wheel_row.values().map(|cell| cell.seconds).sum::<f64>() > 0.0);

    let front_left = &snapshot.levels.by_location["front_left_wheel"];
    assert_eq!(front_left.class, expected);
    assert!(front_left.agreement_count >= 1);
}

#[test]
fn unknown_speed_reports_reference_finding() {
    let config = test_config();
    let sim = simulator(&config, Fault::Wheel, 4.0);
    let snapshot = drive(&config, sim, None);
    assert_finite(&snapshot);
    assert_eq!(snapshot.driving_phase, DrivingPhase::SpeedUnknown);
    assert_eq!(snapshot.findings.first().map(|f| f.finding_id.as_str()), Some("REF_SPEED"));
    // without speed no peak can match an order
    assert!(snapshot.events.iter().all(|e| !e.class.is_order()));
    assert!(!snapshot.levels.by_source.contains_key(&MatrixSource::Wheel));
}

#[tokio::test]
async fn live_loop_consumes_simulator_json_lines() {
    let mut config = test_config();
    config.diagnostics.heavy_tick_ms = 40;
    config.diagnostics.light_tick_ms = 20;
    let sim = simulator(&config, Fault::Engine, 3.0);
    let total = sim.total_batches();
    let mut lines = String::new();
    for batch in sim {
        lines.push_str(&serde_json::to_string(&batch).expect("serialize batch"));
        lines.push('\n');
    }
    let reader = std::io::Cursor::new(lines.into_bytes());

    let processor = Arc::new(SignalProcessor::new(&config.processing, None).expect("processor"));
    let state = Arc::new(RwLock::new(LiveState::default()));
    let live = LiveLoop::new(processor, Arc::clone(&state), &config, CancellationToken::new());
    let stats = live.run(JsonLinesSource::new(reader, "test")).await;

    assert_eq!(stats.batches_received, total);
    assert_eq!(stats.batches_ingested, total);
    assert_eq!(stats.duplicates_dropped, 0);
    assert!(stats.heavy_ticks >= 1);

    let state = state.read().await;
    assert_eq!(state.status, SystemStatus::Stopped);
    assert_eq!(state.active_clients, 4);
    // speed arrives with the batches
    assert!(state.speed_mps.is_some_and(|s| (s - 80.0 / 3.6).abs() < 1e-9));
    let snapshot = state.latest_snapshot.as_ref().expect("snapshot");
    assert_finite(snapshot);
    assert_eq!(state.intake.as_ref().map(|i| i.total_ingested_samples), Some(total * 200));
}
