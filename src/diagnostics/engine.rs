//! The live diagnostics engine and its snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use tracing::debug;

use super::findings::{build_live_findings, select_top_finding, LiveFinding};
use super::levels::{
    build_levels_by_location, collect_from_trackers, upsert_active_level, ActiveLevel, LocationLevel, SensorLevel,
};
use super::matrix::{DwellMatrix, MatrixTable};
use super::phase::{DrivingPhase, PhaseClassifier};
use super::tracker::{TrackerKey, TrackerLevelState};
use super::{
    COMBINED_TRACKER_IDLE_MS, EVENT_PEAKS_PER_CLIENT, HEARTBEAT_EMIT_MS, MAX_RECENT_EVENTS, MULTI_FREQ_BIN_HZ,
    MULTI_SYNC_WINDOW_MS, SILENCE_DB, TRACKER_PRUNE_SILENCE_TICKS,
};
use crate::orders::{classify_peak_hz, AnalysisSettings, MatrixSource, OrderClass};
use crate::processing::MultiSpectrumPayload;
use crate::strength::{combine_amplitude_strength_db, StrengthBand, StrengthBucket, STRENGTH_BANDS};

// ============================================================================
// Inputs and outputs
// ============================================================================

/// Identity of a connected sensor as known to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: String,
}

impl ClientInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Display label: the name, or the id when unnamed.
    pub fn label(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Single,
    Multi,
}

/// An emitted severity event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEvent {
    pub event_id: u64,
    pub ts_ms: u64,
    pub kind: EventKind,
    #[serde(rename = "class_key")]
    pub class: OrderClass,
    pub sensor_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_label: Option<String>,
    pub sensor_labels: Vec<String>,
    pub peak_hz: f64,
    pub peak_amp: f64,
    pub peak_amp_g: f64,
    #[serde(rename = "severity_key")]
    pub severity: StrengthBucket,
    pub vibration_strength_db: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LevelsSnapshot {
    pub by_source: BTreeMap<MatrixSource, ActiveLevel>,
    pub by_sensor: BTreeMap<String, SensorLevel>,
    pub by_location: BTreeMap<String, LocationLevel>,
}

/// UI-ready state after a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub diagnostics_sequence: u64,
    pub matrix: MatrixTable,
    /// Recent events, oldest first.
    pub events: Vec<DiagnosticEvent>,
    pub strength_bands: &'static [StrengthBand],
    pub levels: LevelsSnapshot,
    pub findings: Vec<LiveFinding>,
    pub top_finding: Option<LiveFinding>,
    pub driving_phase: DrivingPhase,
}

/// A classified peak of one client this tick.
#[derive(Debug, Clone)]
struct SensorEvent {
    sensor_id: String,
    label: String,
    location: String,
    peak_hz: f64,
    peak_amp: f64,
    strength_db: f64,
    class: OrderClass,
}

/// Fresh same-class trackers whose peaks chain within one frequency bin.
#[derive(Debug, Clone)]
struct CombinedGroup {
    class: OrderClass,
    avg_hz: f64,
    avg_amp: f64,
    strength_db: f64,
    labels: Vec<String>,
}

// ============================================================================
// Engine
// ============================================================================

/// Severity tracking across all sensors of one run.
///
/// Not internally synchronized: drive it from one task.
#[derive(Debug)]
pub struct LiveDiagnosticsEngine {
    origin: Instant,
    sensor_trackers: BTreeMap<TrackerKey, TrackerLevelState>,
    combined_trackers: BTreeMap<String, TrackerLevelState>,
    matrix: DwellMatrix,
    phase: PhaseClassifier,
    levels: LevelsSnapshot,
    findings: Vec<LiveFinding>,
    events: VecDeque<DiagnosticEvent>,
    next_event_id: u64,
    diagnostics_sequence: u64,
    last_update_ms: Option<u64>,
}

impl Default for LiveDiagnosticsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveDiagnosticsEngine {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            sensor_trackers: BTreeMap::new(),
            combined_trackers: BTreeMap::new(),
            matrix: DwellMatrix::new(),
            phase: PhaseClassifier::new(),
            levels: LevelsSnapshot::default(),
            findings: Vec::new(),
            events: VecDeque::with_capacity(MAX_RECENT_EVENTS),
            next_event_id: 1,
            diagnostics_sequence: 0,
            last_update_ms: None,
        }
    }

    /// Forget all trackers, levels and matrix history.
    ///
    /// Event ids keep counting so ids stay unique across resets.
    pub fn reset(&mut self) {
        let next_event_id = self.next_event_id;
        *self = Self::new();
        self.next_event_id = next_event_id;
    }

    pub const fn diagnostics_sequence(&self) -> u64 {
        self.diagnostics_sequence
    }

    pub fn sensor_tracker_count(&self) -> usize {
        self.sensor_trackers.len()
    }

    pub fn combined_tracker_count(&self) -> usize {
        self.combined_trackers.len()
    }

    pub fn sensor_tracker(&self, sensor_id: &str, class: OrderClass) -> Option<&TrackerLevelState> {
        self.sensor_trackers.get(&TrackerKey {
            sensor_id: sensor_id.to_string(),
            class,
        })
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Run one tick on the engine's monotonic clock.
    pub fn update(
        &mut self,
        speed_mps: Option<f64>,
        clients: &[ClientInfo],
        spectra: Option<&MultiSpectrumPayload>,
        settings: &AnalysisSettings,
    ) -> DiagnosticsSnapshot {
        let now_ms = self.now_ms();
        self.update_at(now_ms, speed_mps, clients, spectra, settings)
    }

    /// Run one tick at an explicit time.
    ///
    /// With `spectra = None` (a light tick) only the phase and dwell seconds
    /// advance; events, levels and the sequence are left as they were.
    pub fn update_at(
        &mut self,
        now_ms: u64,
        speed_mps: Option<f64>,
        clients: &[ClientInfo],
        spectra: Option<&MultiSpectrumPayload>,
        settings: &AnalysisSettings,
    ) -> DiagnosticsSnapshot {
        self.phase.update(speed_mps, now_ms as f64 / 1000.0);

        let dt_s = self
            .last_update_ms
            .map_or(0.0, |last| (now_ms.saturating_sub(last) as f64 / 1000.0).clamp(0.0, 1.0));
        self.last_update_ms = Some(now_ms);
        self.matrix.accumulate_seconds(now_ms, dt_s, &self.levels.by_source);
        self.matrix.rebuild(now_ms);

        let Some(spectra) = spectra else {
            return self.snapshot();
        };

        let started = Instant::now();
        let sensor_events = detect_sensor_events(speed_mps, clients, spectra, settings);
        let mut strongest: BTreeMap<TrackerKey, SensorEvent> = BTreeMap::new();
        for event in sensor_events {
            let key = TrackerKey {
                sensor_id: event.sensor_id.clone(),
                class: event.class,
            };
            match strongest.get(&key) {
                Some(existing) if existing.strength_db >= event.strength_db => {}
                _ => {
                    strongest.insert(key, event);
                }
            }
        }

        let mut emitted = Vec::new();
        for (key, event) in &strongest {
            let tracker = self
                .sensor_trackers
                .entry(key.clone())
                .or_insert_with(|| TrackerLevelState::new(event.class));
            tracker.last_peak_hz = event.peak_hz;
            let previous = tracker.apply(event.strength_db, 1, MULTI_FREQ_BIN_HZ);
            tracker.last_band_rms_g = event.peak_amp;
            tracker.last_update_ms = now_ms;
            tracker.last_class = event.class;
            tracker.last_sensor_label.clone_from(&event.label);
            tracker.last_sensor_location.clone_from(&event.location);

            let emitting = tracker.should_emit(previous, now_ms, HEARTBEAT_EMIT_MS);
            if let Some(bucket) = tracker.matrix_bucket(previous, emitting) {
                self.matrix.record_many(now_ms, event.class.sources(), bucket, &event.label);
            }
            if emitting {
                if let Some(bucket) = tracker.current_bucket() {
                    tracker.last_emitted_ms = Some(now_ms);
                    emitted.push(DiagnosticEvent {
                        event_id: 0,
                        ts_ms: now_ms,
                        kind: EventKind::Single,
                        class: event.class,
                        sensor_count: 1,
                        sensor_id: Some(event.sensor_id.clone()),
                        sensor_label: Some(event.label.clone()),
                        sensor_labels: vec![event.label.clone()],
                        peak_hz: event.peak_hz,
                        peak_amp: event.peak_amp,
                        peak_amp_g: event.peak_amp,
                        severity: bucket,
                        vibration_strength_db: tracker.last_strength_db,
                    });
                }
            }
        }

        self.decay_unseen_sensor_trackers(&strongest);

        let mut levels = LevelsSnapshot::default();
        let mut candidates = BTreeMap::new();
        collect_from_trackers(&self.sensor_trackers, &mut levels.by_source, &mut levels.by_sensor, &mut candidates);

        self.process_combined_groups(now_ms, &mut levels, &mut emitted);

        levels.by_location = build_levels_by_location(&candidates, MULTI_FREQ_BIN_HZ);
        let speed_known = speed_mps.is_some_and(f64::is_finite);
        self.findings = build_live_findings(&levels.by_source, &levels.by_location, speed_known);
        self.levels = levels;

        for mut event in emitted {
            event.event_id = self.next_event_id;
            self.next_event_id += 1;
            if self.events.len() >= MAX_RECENT_EVENTS {
                self.events.pop_front();
            }
            self.events.push_back(event);
        }

        self.matrix.rebuild(now_ms);
        self.diagnostics_sequence += 1;
        debug!(
            sequence = self.diagnostics_sequence,
            sensor_trackers = self.sensor_trackers.len(),
            combined_trackers = self.combined_trackers.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Diagnostics tick"
        );
        self.snapshot()
    }

    fn decay_unseen_sensor_trackers(&mut self, seen: &BTreeMap<TrackerKey, SensorEvent>) {
        self.sensor_trackers.retain(|key, tracker| {
            if seen.contains_key(key) {
                tracker.silence_ticks = 0;
                return true;
            }
            tracker.apply(SILENCE_DB, 1, MULTI_FREQ_BIN_HZ);
            tracker.silence_ticks += 1;
            tracker.silence_ticks < TRACKER_PRUNE_SILENCE_TICKS
        });
    }

    fn combined_groups(&self, now_ms: u64) -> Vec<CombinedGroup> {
        let mut by_class: BTreeMap<OrderClass, Vec<&TrackerLevelState>> = BTreeMap::new();
        for tracker in self.sensor_trackers.values() {
            if tracker.current_bucket().is_none() || now_ms.saturating_sub(tracker.last_update_ms) > MULTI_SYNC_WINDOW_MS {
                continue;
            }
            by_class.entry(tracker.last_class).or_default().push(tracker);
        }

        let mut groups = Vec::new();
        for (class, mut trackers) in by_class {
            trackers.sort_by(|a, b| a.last_peak_hz.total_cmp(&b.last_peak_hz));
            let mut chains: Vec<Vec<&TrackerLevelState>> = Vec::new();
            for tracker in trackers {
                match chains.last_mut() {
                    Some(chain)
                        if chain
                            .last()
                            .is_some_and(|prev| (tracker.last_peak_hz - prev.last_peak_hz).abs() <= MULTI_FREQ_BIN_HZ) =>
                    {
                        chain.push(tracker);
                    }
                    _ => chains.push(vec![tracker]),
                }
            }
            for chain in chains.into_iter().filter(|c| c.len() >= 2) {
                let n = chain.len() as f64;
                let dbs: Vec<f64> = chain.iter().map(|t| t.last_strength_db).collect();
                groups.push(CombinedGroup {
                    class,
                    avg_hz: chain.iter().map(|t| t.last_peak_hz).sum::<f64>() / n,
                    avg_amp: chain.iter().map(|t| t.last_band_rms_g).sum::<f64>() / n,
                    strength_db: combine_amplitude_strength_db(&dbs).unwrap_or(SILENCE_DB),
                    labels: chain.iter().map(|t| t.last_sensor_label.clone()).collect(),
                });
            }
        }
        groups
    }

    fn process_combined_groups(&mut self, now_ms: u64, levels: &mut LevelsSnapshot, emitted: &mut Vec<DiagnosticEvent>) {
        let mut seen = Vec::new();
        for group in self.combined_groups(now_ms) {
            let freq_bin = (group.avg_hz / MULTI_FREQ_BIN_HZ).round() as i64;
            let key = format!("combined:{}:{freq_bin}", group.class);
            let label = format!("combined({})", group.labels.join(", "));
            let tracker = self
                .combined_trackers
                .entry(key.clone())
                .or_insert_with(|| TrackerLevelState::new(group.class));
            seen.push(key);

            tracker.last_peak_hz = group.avg_hz;
            let previous = tracker.apply(group.strength_db, group.labels.len(), MULTI_FREQ_BIN_HZ);
            tracker.last_band_rms_g = group.avg_amp;
            tracker.last_update_ms = now_ms;
            tracker.last_class = group.class;
            tracker.last_sensor_label.clone_from(&label);
            tracker.silence_ticks = 0;

            let Some(bucket) = tracker.current_bucket() else {
                continue;
            };
            upsert_active_level(
                &mut levels.by_source,
                &ActiveLevel {
                    bucket,
                    strength_db: tracker.last_strength_db,
                    sensor_label: label.clone(),
                    sensor_location: tracker.last_sensor_location.clone(),
                    class: group.class,
                    peak_hz: group.avg_hz,
                },
            );
            let emitting = tracker.should_emit(previous, now_ms, HEARTBEAT_EMIT_MS);
            if let Some(counted) = tracker.matrix_bucket(previous, emitting) {
                self.matrix.record_many(now_ms, group.class.sources(), counted, &label);
            }
            if emitting {
                tracker.last_emitted_ms = Some(now_ms);
                emitted.push(DiagnosticEvent {
                    event_id: 0,
                    ts_ms: now_ms,
                    kind: EventKind::Multi,
                    class: group.class,
                    sensor_count: group.labels.len(),
                    sensor_id: None,
                    sensor_label: None,
                    sensor_labels: group.labels,
                    peak_hz: group.avg_hz,
                    peak_amp: group.avg_amp,
                    peak_amp_g: group.avg_amp,
                    severity: bucket,
                    vibration_strength_db: tracker.last_strength_db,
                });
            }
        }

        self.combined_trackers.retain(|key, tracker| {
            if seen.contains(key) {
                return true;
            }
            tracker.apply(SILENCE_DB, 2, MULTI_FREQ_BIN_HZ);
            tracker.silence_ticks += 1;
            let idle = tracker.current_bucket().is_none()
                && now_ms.saturating_sub(tracker.last_update_ms) > COMBINED_TRACKER_IDLE_MS;
            !idle && tracker.silence_ticks < TRACKER_PRUNE_SILENCE_TICKS
        });
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            diagnostics_sequence: self.diagnostics_sequence,
            matrix: self.matrix.table().clone(),
            events: self.events.iter().cloned().collect(),
            strength_bands: &STRENGTH_BANDS,
            levels: self.levels.clone(),
            findings: self.findings.clone(),
            top_finding: select_top_finding(&self.findings).cloned(),
            driving_phase: self.phase.current(),
        }
    }
}

/// Classify the top peaks of every client that carries strength metrics.
fn detect_sensor_events(
    speed_mps: Option<f64>,
    clients: &[ClientInfo],
    spectra: &MultiSpectrumPayload,
    settings: &AnalysisSettings,
) -> Vec<SensorEvent> {
    let mut events = Vec::new();
    for client_id in spectra.clients.keys() {
        let Some(strength) = spectra.strength_for(client_id) else {
            debug!(client_id = %client_id, "Skipping client without strength metrics");
            continue;
        };
        let info = clients.iter().find(|c| &c.id == client_id);
        let label = info.map_or(client_id.as_str(), ClientInfo::label);
        let location = info.map_or("", |c| c.location.as_str());

        for peak in strength.top_peaks.iter().take(EVENT_PEAKS_PER_CLIENT) {
            if !(peak.hz.is_finite() && peak.amp.is_finite() && peak.vibration_strength_db.is_finite()) {
                debug!(client_id = %client_id, "Skipping non-finite peak");
                continue;
            }
            let classification = classify_peak_hz(peak.hz, speed_mps, settings);
            events.push(SensorEvent {
                sensor_id: client_id.clone(),
                label: label.to_string(),
                location: location.to_string(),
                peak_hz: peak.hz,
                peak_amp: peak.amp,
                strength_db: peak.vibration_strength_db,
                class: classification.class,
            });
        }
    }
    events
}
