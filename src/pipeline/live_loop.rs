//! Live diagnostics loop shared across all input modes.
//!
//! One task owns the registry and the diagnostics engine and interleaves
//! three kinds of work with `tokio::select!`:
//!
//! - incoming batches: registry bookkeeping, then ingest into the processor
//! - heavy ticks: evict stale clients, recompute spectra off the runtime,
//!   run a full diagnostics update
//! - light ticks: diagnostics update without spectra (dwell time only)

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::SensorRegistry;
use super::source::{SampleBatch, SampleSource, SourceEvent};
use super::state::{LiveState, SystemStatus};
use crate::config::{DiagnosticsConfig, PipelineConfig};
use crate::diagnostics::{DiagnosticsSnapshot, LiveDiagnosticsEngine};
use crate::orders::AnalysisSettings;
use crate::processing::{IntakeStats, SignalProcessor};

/// Batches buffered between the reader task and the loop.
const BATCH_CHANNEL_CAPACITY: usize = 256;

/// Car settings shared with whoever updates them while the loop runs.
pub type SettingsHandle = Arc<ArcSwap<AnalysisSettings>>;

/// Counters returned when the loop ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub batches_received: u64,
    pub batches_ingested: u64,
    pub duplicates_dropped: u64,
    pub resets_detected: u64,
    pub clients_evicted: u64,
    pub heavy_ticks: u64,
    pub light_ticks: u64,
    pub diagnostics_sequence: u64,
}

// ============================================================================
// Live Loop
// ============================================================================

pub struct LiveLoop {
    processor: Arc<SignalProcessor>,
    engine: LiveDiagnosticsEngine,
    registry: SensorRegistry,
    settings: SettingsHandle,
    state: Arc<RwLock<LiveState>>,
    cancel_token: CancellationToken,
    config: DiagnosticsConfig,
    speed_mps: Option<f64>,
    origin: Instant,
    stats: LoopStats,
}

impl LiveLoop {
    pub fn new(
        processor: Arc<SignalProcessor>,
        state: Arc<RwLock<LiveState>>,
        config: &PipelineConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            processor,
            engine: LiveDiagnosticsEngine::new(),
            registry: SensorRegistry::new(config.diagnostics.client_ttl_seconds),
            settings: Arc::new(ArcSwap::from_pointee(config.vehicle.clone())),
            state,
            cancel_token,
            config: config.diagnostics.clone(),
            speed_mps: None,
            origin: Instant::now(),
            stats: LoopStats::default(),
        }
    }

    /// Speed used until a batch reports one.
    #[must_use]
    pub fn with_speed(mut self, speed_mps: Option<f64>) -> Self {
        self.speed_mps = speed_mps.filter(|s| s.is_finite());
        self
    }

    /// Handle for replacing the car settings while the loop runs.
    pub fn settings_handle(&self) -> SettingsHandle {
        Arc::clone(&self.settings)
    }

    fn now_s(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Run until the source ends or the token is cancelled.
    ///
    /// The source is read on its own task so a partially read batch is never
    /// lost to a tick winning the `select!`. On end of data one last heavy
    /// tick runs so the final snapshot covers every ingested sample.
    pub async fn run<S: SampleSource>(mut self, source: S) -> LoopStats {
        info!(
            source = source.source_name(),
            heavy_tick_ms = self.config.heavy_tick_ms,
            light_tick_ms = self.config.light_tick_ms,
            "Starting live diagnostics loop"
        );

        let (tx, mut rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_batches(source, tx, self.cancel_token.child_token()));

        let mut heavy = interval(Duration::from_millis(self.config.heavy_tick_ms.max(1)));
        heavy.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut light = interval(Duration::from_millis(self.config.light_tick_ms.max(1)));
        light.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick of an interval completes immediately
        heavy.tick().await;
        light.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => {
                    info!("[LiveLoop] Shutdown signal received");
                    break;
                }
                event = rx.recv() => match event {
                    Some(Ok(SourceEvent::Batch(batch))) => self.handle_batch(&batch),
                    Some(Ok(SourceEvent::Eof)) | None => {
                        info!(batches = self.stats.batches_received, "[LiveLoop] Source reached end");
                        self.heavy_tick().await;
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "[LiveLoop] Source error");
                        break;
                    }
                },
                _ = heavy.tick() => self.heavy_tick().await,
                _ = light.tick() => self.light_tick().await,
            }
        }

        reader.abort();
        self.state.write().await.status = SystemStatus::Stopped;
        self.stats.diagnostics_sequence = self.engine.diagnostics_sequence();
        info!(
            batches_received = self.stats.batches_received,
            batches_ingested = self.stats.batches_ingested,
            duplicates = self.stats.duplicates_dropped,
            resets = self.stats.resets_detected,
            heavy_ticks = self.stats.heavy_ticks,
            light_ticks = self.stats.light_ticks,
            "Live diagnostics loop stopped"
        );
        self.stats
    }

    // ========================================================================
    // Batches
    // ========================================================================

    fn handle_batch(&mut self, batch: &SampleBatch) {
        self.stats.batches_received += 1;
        if let Some(speed) = batch.speed_mps.filter(|s| s.is_finite()) {
            self.speed_mps = Some(speed);
        }

        let result = self.registry.update_from_batch(batch, self.now_s());
        if result.is_duplicate {
            self.stats.duplicates_dropped += 1;
            debug!(client_id = %batch.client_id, seq = ?batch.seq, "Dropping duplicate batch");
            return;
        }
        if result.reset_detected {
            self.stats.resets_detected += 1;
            let flushed = self.processor.flush_client_buffer(&batch.client_id);
            info!(client_id = %batch.client_id, seq = ?batch.seq, flushed, "Sensor restart detected");
        }
        if batch.samples.is_empty() {
            return;
        }
        self.processor
            .ingest(&batch.client_id, &batch.samples, batch.sample_rate_hz, batch.t0_us);
        self.stats.batches_ingested += 1;
    }

    // ========================================================================
    // Ticks
    // ========================================================================

    async fn heavy_tick(&mut self) {
        let now_s = self.now_s();
        let evicted = self.registry.evict_stale(now_s);
        let active_ids = self.registry.active_client_ids(now_s);
        if !evicted.is_empty() {
            let keep: HashSet<String> = active_ids.iter().cloned().collect();
            self.processor.evict_clients(&keep);
            self.stats.clients_evicted += evicted.len() as u64;
            info!(clients = ?evicted, "Evicted stale sensors");
        }

        let processor = Arc::clone(&self.processor);
        let max_age_s = self.config.recent_data_max_age_s;
        let ids = active_ids.clone();
        let computed = tokio::task::spawn_blocking(move || {
            let fresh = processor.clients_with_recent_data(&ids, max_age_s);
            processor.compute_all(&fresh);
            processor.multi_spectrum_payload(&fresh)
        })
        .await;
        let spectra = match computed {
            Ok(spectra) => spectra,
            Err(e) => {
                warn!(error = %e, "Spectrum computation task failed, skipping tick");
                return;
            }
        };
        if let Some(warning) = &spectra.warning {
            debug!(warning = ?warning, "Spectrum alignment warning");
        }

        let clients = self.registry.client_infos(now_s);
        let snapshot = {
            let settings = self.settings.load();
            self.engine.update(self.speed_mps, &clients, Some(&spectra), &settings)
        };
        self.stats.heavy_ticks += 1;
        self.publish(snapshot, Some(self.processor.intake_stats()), active_ids.len()).await;
    }

    async fn light_tick(&mut self) {
        let clients = self.registry.client_infos(self.now_s());
        let snapshot = {
            let settings = self.settings.load();
            self.engine.update(self.speed_mps, &clients, None, &settings)
        };
        self.stats.light_ticks += 1;
        let active = clients.len();
        self.publish(snapshot, None, active).await;
    }

    async fn publish(&self, snapshot: DiagnosticsSnapshot, intake: Option<IntakeStats>, active_clients: usize) {
        let mut state = self.state.write().await;
        state.status = LiveState::status_for(&snapshot, active_clients);
        state.active_clients = active_clients;
        state.speed_mps = self.speed_mps;
        state.batches_ingested = self.stats.batches_ingested;
        state.heavy_ticks = self.stats.heavy_ticks;
        state.light_ticks = self.stats.light_ticks;
        if let Some(intake) = intake {
            state.intake = Some(intake);
            state.last_heavy_tick = Some(chrono::Utc::now());
        }
        state.latest_snapshot = Some(snapshot);
    }
}

/// Forward source events until end of data, an error, or cancellation.
async fn read_batches<S: SampleSource>(
    mut source: S,
    tx: mpsc::Sender<anyhow::Result<SourceEvent>>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => return,
            event = source.next_batch() => event,
        };
        let done = !matches!(event, Ok(SourceEvent::Batch(_)));
        if tx.send(event).await.is_err() || done {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source::ReplaySource;
    use async_trait::async_trait;
    use std::f64::consts::PI;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.processing.sample_rate_hz = 800;
        config.processing.waveform_seconds = 2;
        config.processing.fft_n = 1024;
        config.processing.accel_scale_g_per_lsb = Some(0.001);
        config.diagnostics.heavy_tick_ms = 50;
        config.diagnostics.light_tick_ms = 20;
        config
    }

    fn tone_batches(client_id: &str, batches: u32, per_batch: usize) -> Vec<SampleBatch> {
        (0..batches)
            .map(|seq| {
                let samples = (0..per_batch)
                    .map(|i| {
                        let t = (seq as usize * per_batch + i) as f64 / 800.0;
                        let v = (400.0 * (2.0 * PI * 30.0 * t).sin()).round() as i16;
                        [v, v / 2, 0]
                    })
                    .collect();
                let mut batch = SampleBatch::new(client_id, samples);
                batch.seq = Some(seq);
                batch.sample_rate_hz = Some(800);
                batch
            })
            .collect()
    }

    fn live_loop(config: &PipelineConfig, token: CancellationToken) -> (LiveLoop, Arc<RwLock<LiveState>>) {
        let processor = Arc::new(SignalProcessor::new(&config.processing, None).expect("processor"));
        let state = Arc::new(RwLock::new(LiveState::default()));
        (LiveLoop::new(processor, Arc::clone(&state), config, token), state)
    }

    #[tokio::test]
    async fn test_replay_runs_final_heavy_tick() {
        let config = test_config();
        let (live, state) = live_loop(&config, CancellationToken::new());
        let mut batches = tone_batches("front", 8, 200);
        // replayed frame is dropped, empty batch is registered only
        let replayed = batches[2].clone();
        batches.insert(3, replayed);
        let mut empty = SampleBatch::new("rear", vec![]);
        empty.location = Some("rear_axle".into());
        batches.push(empty);

        let stats = live.with_speed(Some(20.0)).run(ReplaySource::new(batches, 0)).await;
        assert_eq!(stats.batches_received, 10);
        assert_eq!(stats.duplicates_dropped, 1);
        assert_eq!(stats.batches_ingested, 8);
        assert!(stats.heavy_ticks >= 1);
        assert!(stats.diagnostics_sequence >= 1);

        let state = state.read().await;
        assert_eq!(state.status, SystemStatus::Stopped);
        assert_eq!(state.speed_mps, Some(20.0));
        assert_eq!(state.intake.as_ref().map(|i| i.total_ingested_samples), Some(1600));
        assert!(state.latest_snapshot.is_some());
    }

    #[tokio::test]
    async fn test_restart_flushes_buffer() {
        let config = test_config();
        let (live, _state) = live_loop(&config, CancellationToken::new());
        let mut batches = tone_batches("front", 3, 100);
        let mut restarted = tone_batches("front", 1, 100);
        batches[2].seq = Some(5000);
        restarted[0].seq = Some(0);
        batches.extend(restarted);
        let stats = live.run(ReplaySource::new(batches, 0)).await;
        assert_eq!(stats.resets_detected, 1);
        assert_eq!(stats.batches_ingested, 4);
    }

    struct PendingSource;

    #[async_trait]
    impl SampleSource for PendingSource {
        async fn next_batch(&mut self) -> anyhow::Result<SourceEvent> {
            std::future::pending().await
        }

        fn source_name(&self) -> &str {
            "pending"
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop_and_ticks_run() {
        let config = test_config();
        let token = CancellationToken::new();
        let (live, state) = live_loop(&config, token.clone());
        let handle = tokio::spawn(live.run(PendingSource));
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        let stats = handle.await.expect("loop task");
        assert!(stats.heavy_ticks >= 1, "{stats:?}");
        assert!(stats.light_ticks >= 1, "{stats:?}");
        assert_eq!(stats.batches_received, 0);
        assert_eq!(state.read().await.status, SystemStatus::Stopped);
    }

    #[tokio::test]
    async fn test_settings_handle_swaps_live() {
        let config = test_config();
        let (live, _state) = live_loop(&config, CancellationToken::new());
        let handle = live.settings_handle();
        let mut settings = AnalysisSettings::default();
        settings.rim_in = 19.0;
        handle.store(Arc::new(settings));
        assert!((live.settings.load().rim_in - 19.0).abs() < f64::EPSILON);
    }
}
