//! Stateful coordinator of the per-client ring buffers.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::buffer::ClientBuffer;
use super::fft::{medfilt3, AxisBlock, FftProcessor, SpectrumResult};
use super::metrics::ClientMetrics;
use super::payload::{
    AlignmentSummary, DebugSpectrum, FrequencyMismatchWarning, MultiSpectrumPayload, RawSamples, RawStats,
    SelectedPayload, SelectedSpectrum, SpectrumDebug, SpectrumPayload, TopBin, Waveform, FREQUENCY_BIN_MISMATCH,
};
use super::time_align::{analysis_time_range, compute_overlap, round4, TimeAlignmentInfo, TimeRange};
use super::ProcessingError;
use crate::config::defaults::{FREQUENCY_AXIS_TOLERANCE_HZ, MAX_CLIENT_SAMPLE_RATE_HZ};
use crate::config::ProcessingConfig;
use crate::worker_pool::{PoolStats, WorkerPool};

/// Default sample count for [`SignalProcessor::raw_samples`].
pub const DEFAULT_RAW_SAMPLES: usize = 2048;

const DEBUG_TOP_BINS: usize = 10;

/// Intake and analysis counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntakeStats {
    pub total_ingested_samples: u64,
    pub total_compute_calls: u64,
    pub last_compute_duration_s: f64,
    pub last_compute_all_duration_s: f64,
    pub last_ingest_duration_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pool: Option<PoolStats>,
}

#[derive(Debug, Default)]
struct Counters {
    total_ingested_samples: AtomicU64,
    total_compute_calls: AtomicU64,
    last_compute_s: AtomicU64,
    last_compute_all_s: AtomicU64,
    last_ingest_s: AtomicU64,
}

fn store_seconds(slot: &AtomicU64, started: Instant) {
    slot.store(started.elapsed().as_secs_f64().to_bits(), Ordering::Relaxed);
}

fn load_seconds(slot: &AtomicU64) -> f64 {
    f64::from_bits(slot.load(Ordering::Relaxed))
}

/// Buffer state copied out under the lock for one compute.
#[derive(Debug, Clone)]
pub(crate) struct ComputeSnapshot {
    pub(crate) sample_rate_hz: u32,
    pub(crate) ingest_generation: u64,
    pub(crate) time_window: AxisBlock,
    pub(crate) fft_block: Option<AxisBlock>,
}

#[derive(Debug)]
pub(crate) enum SnapshotOutcome {
    NoData,
    Cached(Arc<ClientMetrics>),
    Fresh(ComputeSnapshot),
}

#[derive(Debug)]
pub(crate) struct Analysis {
    pub(crate) metrics: Arc<ClientMetrics>,
    pub(crate) spectrum: Option<Arc<SpectrumResult>>,
}

/// Per-client ring buffers plus FFT analysis and payload assembly.
///
/// One mutex guards every buffer's bookkeeping. It is held only to copy a
/// snapshot in and to commit a result out, never across the FFT.
pub struct SignalProcessor {
    sample_rate_hz: u32,
    waveform_seconds: u32,
    waveform_display_hz: u32,
    capacity: usize,
    accel_scale_g_per_lsb: Option<f64>,
    spike_filter_enabled: bool,
    fft: FftProcessor,
    buffers: Mutex<HashMap<String, ClientBuffer>>,
    worker_pool: Option<Arc<WorkerPool>>,
    epoch: Instant,
    counters: Counters,
}

impl SignalProcessor {
    pub fn new(config: &ProcessingConfig, worker_pool: Option<Arc<WorkerPool>>) -> Result<Self, ProcessingError> {
        let capacity = config.capacity();
        if capacity == 0 {
            return Err(ProcessingError::InvalidCapacity {
                sample_rate_hz: config.sample_rate_hz,
                waveform_seconds: config.waveform_seconds,
            });
        }
        if config.fft_n > capacity {
            return Err(ProcessingError::FftExceedsCapacity {
                fft_n: config.fft_n,
                capacity,
            });
        }
        let fft = FftProcessor::new(config.fft_n, config.spectrum_min_hz, config.spectrum_max_hz)?;

        Ok(Self {
            sample_rate_hz: config.sample_rate_hz,
            waveform_seconds: config.waveform_seconds,
            waveform_display_hz: config.waveform_display_hz,
            capacity,
            accel_scale_g_per_lsb: config.accel_scale_g_per_lsb.filter(|s| s.is_finite() && *s > 0.0),
            spike_filter_enabled: config.spike_filter_enabled,
            fft,
            buffers: Mutex::new(HashMap::new()),
            worker_pool,
            epoch: Instant::now(),
            counters: Counters::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClientBuffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_s(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    const fn rate_of(&self, buf: &ClientBuffer) -> u32 {
        if buf.sample_rate_hz > 0 {
            buf.sample_rate_hz
        } else {
            self.sample_rate_hz
        }
    }

    pub const fn fft_n(&self) -> usize {
        self.fft.fft_n()
    }

    pub const fn waveform_seconds(&self) -> u32 {
        self.waveform_seconds
    }

    /// Client ids with a buffer, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // Buffer management
    // ========================================================================

    /// Append raw `[x, y, z]` counts for `client_id`.
    ///
    /// A reported rate is clamped to [`MAX_CLIENT_SAMPLE_RATE_HZ`] and resizes
    /// the ring to `rate · waveform_seconds`. A zero rate keeps the current one.
    pub fn ingest(&self, client_id: &str, samples: &[[i16; 3]], sample_rate_hz: Option<u32>, t0_us: Option<u64>) {
        let started = Instant::now();
        if samples.is_empty() {
            return;
        }
        let scale = self.accel_scale_g_per_lsb.unwrap_or(1.0);
        let mut rows: Vec<[f64; 3]> = samples
            .iter()
            .map(|s| [f64::from(s[0]) * scale, f64::from(s[1]) * scale, f64::from(s[2]) * scale])
            .collect();
        if self.spike_filter_enabled {
            medfilt3(&mut rows);
        }
        let now_s = self.now_s();

        let written = {
            let mut buffers = self.lock();
            let buf = buffers
                .entry(client_id.to_string())
                .or_insert_with(|| ClientBuffer::new(self.capacity));

            if let Some(requested) = sample_rate_hz.filter(|r| *r > 0) {
                let clamped = requested.clamp(1, MAX_CLIENT_SAMPLE_RATE_HZ);
                if clamped != requested {
                    warn!(
                        client_id,
                        requested,
                        clamped,
                        "Clamped client sample_rate_hz to bound buffer growth"
                    );
                }
                buf.sample_rate_hz = clamped;
                buf.resize(clamped as usize * self.waveform_seconds as usize);
            }
            buf.first_ingest_s.get_or_insert(now_s);
            buf.last_ingest_s = Some(now_s);

            let written = buf.write(&rows);
            match t0_us.filter(|t| *t > 0) {
                Some(t0) => {
                    buf.last_t0_us = t0;
                    buf.samples_since_t0 = written as u64;
                }
                None => buf.samples_since_t0 = buf.samples_since_t0.saturating_add(written as u64),
            }
            buf.ingest_generation += 1;
            buf.invalidate_caches();
            written
        };

        self.counters
            .total_ingested_samples
            .fetch_add(written as u64, Ordering::Relaxed);
        store_seconds(&self.counters.last_ingest_s, started);
    }

    /// Interleaved `x, y, z, x, y, z, ...` counts. A length that is not a
    /// multiple of three is dropped.
    pub fn ingest_interleaved(&self, client_id: &str, raw: &[i16], sample_rate_hz: Option<u32>, t0_us: Option<u64>) {
        if raw.len() % 3 != 0 {
            warn!(client_id, len = raw.len(), "Dropping malformed sample chunk");
            return;
        }
        let rows: Vec<[i16; 3]> = raw.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
        self.ingest(client_id, &rows, sample_rate_hz, t0_us);
    }

    /// Discard all samples of `client_id` after a sensor reset.
    ///
    /// Returns `false` for an unknown client.
    pub fn flush_client_buffer(&self, client_id: &str) -> bool {
        let mut buffers = self.lock();
        let Some(buf) = buffers.get_mut(client_id) else {
            return false;
        };
        buf.flush();
        info!(client_id, "Flushed signal buffer after sensor reset");
        true
    }

    /// Drop every buffer whose id is not in `keep`. Returns the evicted ids.
    pub fn evict_clients(&self, keep: &HashSet<String>) -> Vec<String> {
        let mut buffers = self.lock();
        let stale: Vec<String> = buffers.keys().filter(|id| !keep.contains(*id)).cloned().collect();
        for client_id in &stale {
            buffers.remove(client_id);
            info!(client_id = %client_id, "Evicted client buffer");
        }
        stale
    }

    // ========================================================================
    // Metric computation
    // ========================================================================

    /// Latest metrics of `client_id`, recomputed only if samples arrived
    /// since the last commit. `None` for an unknown or empty buffer.
    pub fn compute_metrics(&self, client_id: &str) -> Option<Arc<ClientMetrics>> {
        let started = Instant::now();
        let snapshot = match self.snapshot(client_id) {
            SnapshotOutcome::NoData => return None,
            SnapshotOutcome::Cached(metrics) => return Some(metrics),
            SnapshotOutcome::Fresh(snapshot) => snapshot,
        };

        let analysis = self.analyze(&snapshot);
        let metrics = Arc::clone(&analysis.metrics);
        if !self.commit(client_id, &snapshot, analysis) {
            debug!(
                client_id,
                generation = snapshot.ingest_generation,
                "Discarded stale compute result"
            );
        }

        store_seconds(&self.counters.last_compute_s, started);
        self.counters.total_compute_calls.fetch_add(1, Ordering::Relaxed);
        Some(metrics)
    }

    pub(crate) fn snapshot(&self, client_id: &str) -> SnapshotOutcome {
        let buffers = self.lock();
        let Some(buf) = buffers.get(client_id) else {
            return SnapshotOutcome::NoData;
        };
        if buf.count == 0 {
            return SnapshotOutcome::NoData;
        }
        let sr = self.rate_of(buf);
        if buf.compute_generation == Some(buf.ingest_generation) && buf.compute_sample_rate_hz == sr {
            if let Some(metrics) = &buf.latest_metrics {
                return SnapshotOutcome::Cached(Arc::clone(metrics));
            }
        }

        let desired = (sr as usize * self.waveform_seconds as usize).max(1);
        let n_time = buf.count.min(buf.capacity).min(desired);
        let fft_n = self.fft.fft_n();
        SnapshotOutcome::Fresh(ComputeSnapshot {
            sample_rate_hz: sr,
            ingest_generation: buf.ingest_generation,
            time_window: buf.latest(n_time),
            fft_block: (buf.count >= fft_n).then(|| buf.latest(fft_n)),
        })
    }

    pub(crate) fn analyze(&self, snapshot: &ComputeSnapshot) -> Analysis {
        let mut metrics = ClientMetrics::from_window(&snapshot.time_window);
        let spectrum = snapshot
            .fft_block
            .as_ref()
            .map(|block| self.fft.analyze(block, snapshot.sample_rate_hz));
        if let Some(spectrum) = &spectrum {
            metrics.apply_spectrum(spectrum);
        }
        Analysis {
            metrics: Arc::new(metrics),
            spectrum: spectrum.map(Arc::new),
        }
    }

    /// Store `analysis` unless a newer ingest or flush has been committed.
    pub(crate) fn commit(&self, client_id: &str, snapshot: &ComputeSnapshot, analysis: Analysis) -> bool {
        let mut buffers = self.lock();
        let Some(buf) = buffers.get_mut(client_id) else {
            return false;
        };
        if buf
            .compute_generation
            .is_some_and(|current| snapshot.ingest_generation < current)
        {
            return false;
        }
        buf.latest_metrics = Some(analysis.metrics);
        buf.latest_spectrum = analysis.spectrum;
        buf.compute_generation = Some(snapshot.ingest_generation);
        buf.compute_sample_rate_hz = snapshot.sample_rate_hz;
        buf.spectrum_generation += 1;
        buf.invalidate_caches();
        true
    }

    /// Compute every client, on the worker pool when there is more than one.
    ///
    /// Clients without data, or whose compute panicked, are left out.
    pub fn compute_all(&self, client_ids: &[String]) -> HashMap<String, Arc<ClientMetrics>> {
        let started = Instant::now();
        let results = match &self.worker_pool {
            Some(pool) if client_ids.len() > 1 => pool
                .map_unordered(|client_id: &String| self.compute_metrics(client_id), client_ids)
                .into_iter()
                .filter_map(|(client_id, metrics)| metrics.map(|m| (client_id, m)))
                .collect(),
            _ => client_ids
                .iter()
                .filter_map(|client_id| {
                    match catch_unwind(AssertUnwindSafe(|| self.compute_metrics(client_id))) {
                        Ok(metrics) => metrics.map(|m| (client_id.clone(), m)),
                        Err(_) => {
                            warn!(client_id = %client_id, "compute_metrics failed, skipping");
                            None
                        }
                    }
                })
                .collect(),
        };
        store_seconds(&self.counters.last_compute_all_s, started);
        results
    }

    // ========================================================================
    // Payloads
    // ========================================================================

    fn spectrum_payload_locked(buf: &mut ClientBuffer) -> Arc<SpectrumPayload> {
        let Some(spectrum) = &buf.latest_spectrum else {
            return Arc::new(SpectrumPayload::default());
        };
        if let Some((generation, payload)) = &buf.cached_spectrum_payload {
            if *generation == buf.spectrum_generation {
                return Arc::clone(payload);
            }
        }
        let [x, y, z] = &spectrum.axes;
        let payload = Arc::new(SpectrumPayload {
            freq: None,
            x: x.clone(),
            y: y.clone(),
            z: z.clone(),
            combined_spectrum_amp_g: spectrum.combined.clone(),
            strength_metrics: Some(spectrum.strength.clone()),
        });
        buf.cached_spectrum_payload = Some((buf.spectrum_generation, Arc::clone(&payload)));
        payload
    }

    /// Latest spectrum of `client_id`, cached per spectrum generation.
    pub fn spectrum_payload(&self, client_id: &str) -> Arc<SpectrumPayload> {
        let mut buffers = self.lock();
        buffers
            .get_mut(client_id)
            .map_or_else(|| Arc::new(SpectrumPayload::default()), Self::spectrum_payload_locked)
    }

    /// Spectra of several clients sharing one frequency axis when possible.
    pub fn multi_spectrum_payload(&self, client_ids: &[String]) -> MultiSpectrumPayload {
        let mut buffers = self.lock();
        let mut payload = MultiSpectrumPayload::default();
        let mut shared_freq: Option<Arc<super::fft::FrequencySlice>> = None;
        let mut per_client_freq = Vec::new();
        let mut mismatch_ids = Vec::new();
        let mut ranges = Vec::new();
        let mut any_synced = false;
        let mut all_synced = true;

        for client_id in client_ids {
            let Some(buf) = buffers.get_mut(client_id) else {
                continue;
            };
            let Some(spectrum) = buf.latest_spectrum.clone() else {
                continue;
            };
            match &shared_freq {
                None => shared_freq = Some(Arc::clone(&spectrum.freq)),
                Some(shared) if !axes_match(&shared.freq, &spectrum.freq.freq) => {
                    mismatch_ids.push(client_id.clone());
                }
                Some(_) => {}
            }
            per_client_freq.push((client_id.clone(), Arc::clone(&spectrum.freq)));
            payload
                .clients
                .insert(client_id.clone(), (*Self::spectrum_payload_locked(buf)).clone());

            let sr = self.rate_of(buf);
            if let Some(range) = analysis_time_range(&buf.timing(sr, self.waveform_seconds)) {
                ranges.push((range.start_s, range.end_s));
                any_synced |= range.synced;
                all_synced &= range.synced;
            }
        }

        if mismatch_ids.is_empty() {
            payload.freq = shared_freq.map(|s| s.freq.clone()).unwrap_or_default();
        } else {
            for (client_id, freq) in per_client_freq {
                if let Some(client) = payload.clients.get_mut(&client_id) {
                    client.freq = Some(freq.freq.clone());
                }
            }
            mismatch_ids.sort();
            warn!(clients = ?mismatch_ids, "Frequency bin mismatch across clients");
            payload.warning = Some(FrequencyMismatchWarning {
                code: FREQUENCY_BIN_MISMATCH,
                message: "Per-client frequency axes returned due to sample-rate mismatch.".to_string(),
                client_ids: mismatch_ids,
            });
        }

        if ranges.len() >= 2 {
            let overlap = compute_overlap(&ranges);
            payload.alignment = Some(AlignmentSummary {
                overlap_ratio: round4(overlap.overlap_ratio),
                aligned: overlap.aligned,
                shared_window_s: round4(overlap.overlap_s),
                sensor_count: ranges.len(),
                clock_synced: all_synced && any_synced,
            });
        }
        payload
    }

    /// Waveform, spectrum and metrics of the focused client.
    pub fn selected_payload(&self, client_id: &str) -> Arc<SelectedPayload> {
        let mut buffers = self.lock();
        let Some(buf) = buffers.get_mut(client_id) else {
            return Arc::new(SelectedPayload::empty(client_id, self.sample_rate_hz));
        };
        if buf.count == 0 {
            return Arc::new(SelectedPayload::empty(client_id, self.sample_rate_hz));
        }
        let sr = self.rate_of(buf);
        let key = (buf.ingest_generation, buf.spectrum_generation, sr);
        if let Some((cached_key, payload)) = &buf.cached_selected_payload {
            if *cached_key == key {
                return Arc::clone(payload);
            }
        }

        let window = buf
            .count
            .min(buf.capacity)
            .min((sr as usize * self.waveform_seconds.max(1) as usize).max(1));
        let raw = buf.latest(window);
        let step = (sr / self.waveform_display_hz.max(1)).max(1) as usize;
        let decimate = |axis: &Vec<f64>| -> Vec<f64> { axis.iter().step_by(step).copied().collect() };
        let [x, y, z] = [decimate(&raw[0]), decimate(&raw[1]), decimate(&raw[2])];
        let points = x.len();
        let dt = step as f64 / f64::from(sr);
        let t = (0..points).map(|i| (i as f64 - (points as f64 - 1.0)) * dt).collect();

        let spectrum = buf.latest_spectrum.as_ref().map_or_else(SelectedSpectrum::default, |s| {
            let [sx, sy, sz] = &s.axes;
            SelectedSpectrum {
                freq: s.freq.freq.clone(),
                x: sx.clone(),
                y: sy.clone(),
                z: sz.clone(),
                combined_spectrum_amp_g: s.combined.clone(),
                strength_metrics: Some(s.strength.clone()),
            }
        });

        let payload = Arc::new(SelectedPayload {
            client_id: client_id.to_string(),
            sample_rate_hz: sr,
            waveform: Some(Waveform { t, x, y, z }),
            spectrum: Some(spectrum),
            metrics: buf.latest_metrics.clone(),
        });
        buf.cached_selected_payload = Some((key, Arc::clone(&payload)));
        payload
    }

    // ========================================================================
    // Accessors & debug
    // ========================================================================

    pub fn latest_sample_xyz(&self, client_id: &str) -> Option<[f64; 3]> {
        self.lock().get(client_id)?.latest_sample()
    }

    /// Rate reported by the client, `None` until one was reported.
    pub fn latest_sample_rate_hz(&self, client_id: &str) -> Option<u32> {
        self.lock().get(client_id).map(|b| b.sample_rate_hz).filter(|r| *r > 0)
    }

    /// Full FFT breakdown of the newest block, computed on demand.
    pub fn debug_spectrum(&self, client_id: &str) -> DebugSpectrum {
        let fft_n = self.fft.fft_n();
        let (sr, block) = {
            let buffers = self.lock();
            match buffers.get(client_id) {
                Some(buf) if buf.count >= fft_n => (self.rate_of(buf), buf.latest(fft_n)),
                other => {
                    return DebugSpectrum::InsufficientSamples {
                        error: "insufficient samples",
                        count: other.map_or(0, |b| b.count),
                        fft_n,
                    };
                }
            }
        };

        let raw_stats = raw_stats(&block);
        let result = self.fft.analyze(&block, sr);
        let mut order: Vec<usize> = (0..result.combined.len()).collect();
        order.sort_by(|a, b| result.combined[*b].total_cmp(&result.combined[*a]));
        let top_bins = order
            .into_iter()
            .take(DEBUG_TOP_BINS)
            .map(|i| TopBin {
                bin: i,
                freq_hz: result.freq.freq[i],
                combined_amp_g: result.combined[i],
                x_amp_g: result.axes[0][i],
                y_amp_g: result.axes[1][i],
                z_amp_g: result.axes[2][i],
            })
            .collect();

        DebugSpectrum::Ready(Box::new(SpectrumDebug {
            client_id: client_id.to_string(),
            sample_rate_hz: sr,
            fft_n,
            fft_scale: self.fft.scale(),
            window: "hann",
            spectrum_min_hz: self.fft.spectrum_min_hz(),
            spectrum_max_hz: self.fft.spectrum_max_hz(),
            freq_bins: result.freq.len(),
            freq_resolution_hz: f64::from(sr) / fft_n as f64,
            raw_stats,
            vibration_strength_db: result.strength.vibration_strength_db,
            top_bins_by_amplitude: top_bins,
            strength_peaks: result.strength.top_peaks.clone(),
            axis_peaks: result.axis_peaks.clone(),
        }))
    }

    /// Newest `n_samples` samples in g. `None` without data.
    pub fn raw_samples(&self, client_id: &str, n_samples: usize) -> Option<RawSamples> {
        let buffers = self.lock();
        let buf = buffers.get(client_id).filter(|b| b.count > 0)?;
        let n = n_samples.min(buf.count);
        let [x, y, z] = buf.latest(n);
        Some(RawSamples {
            client_id: client_id.to_string(),
            sample_rate_hz: self.rate_of(buf),
            n_samples: n,
            x,
            y,
            z,
        })
    }

    /// The subset of `client_ids` that ingested within `max_age_s`.
    pub fn clients_with_recent_data(&self, client_ids: &[String], max_age_s: f64) -> Vec<String> {
        let now = self.now_s();
        let buffers = self.lock();
        client_ids
            .iter()
            .filter(|id| {
                buffers
                    .get(*id)
                    .and_then(|b| b.last_ingest_s)
                    .is_some_and(|last| now - last <= max_age_s)
            })
            .cloned()
            .collect()
    }

    pub fn intake_stats(&self) -> IntakeStats {
        IntakeStats {
            total_ingested_samples: self.counters.total_ingested_samples.load(Ordering::Relaxed),
            total_compute_calls: self.counters.total_compute_calls.load(Ordering::Relaxed),
            last_compute_duration_s: load_seconds(&self.counters.last_compute_s),
            last_compute_all_duration_s: load_seconds(&self.counters.last_compute_all_s),
            last_ingest_duration_s: load_seconds(&self.counters.last_ingest_s),
            worker_pool: self.worker_pool.as_ref().map(|p| p.stats()),
        }
    }

    /// Window overlap across `client_ids`.
    pub fn time_alignment_info(&self, client_ids: &[String]) -> TimeAlignmentInfo {
        let buffers = self.lock();
        let ranges: Vec<(String, Option<TimeRange>)> = client_ids
            .iter()
            .map(|id| {
                let range = buffers
                    .get(id)
                    .and_then(|buf| analysis_time_range(&buf.timing(self.rate_of(buf), self.waveform_seconds)));
                (id.clone(), range)
            })
            .collect();
        TimeAlignmentInfo::from_ranges(ranges)
    }
}

fn axes_match(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= FREQUENCY_AXIS_TOLERANCE_HZ)
}

fn raw_stats(block: &AxisBlock) -> RawStats {
    let mut stats = RawStats {
        mean_g: [0.0; 3],
        std_g: [0.0; 3],
        min_g: [0.0; 3],
        max_g: [0.0; 3],
    };
    for (axis, samples) in block.iter().enumerate() {
        if samples.is_empty() {
            continue;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        stats.mean_g[axis] = mean;
        stats.std_g[axis] = var.sqrt();
        stats.min_g[axis] = samples.iter().copied().fold(f64::INFINITY, f64::min);
        stats.max_g[axis] = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn test_config() -> ProcessingConfig {
        ProcessingConfig {
            sample_rate_hz: 800,
            waveform_seconds: 2,
            fft_n: 1024,
            accel_scale_g_per_lsb: Some(0.001),
            ..ProcessingConfig::default()
        }
    }

    fn tone(freq_hz: f64, amp_lsb: f64, sr: u32, n: usize, phase_offset: usize) -> Vec<[i16; 3]> {
        (0..n)
            .map(|i| {
                let t = (i + phase_offset) as f64 / f64::from(sr);
                let v = (amp_lsb * (2.0 * PI * freq_hz * t).sin()).round() as i16;
                [v, v / 2, 0]
            })
            .collect()
    }

    fn dominant_hz(metrics: &ClientMetrics) -> f64 {
        metrics
            .strength_metrics
            .as_ref()
            .and_then(|s| s.top_peaks.first())
            .map(|p| p.hz)
            .expect("strength peak")
    }

    #[test]
    fn test_constructor_rejects_bad_geometry() {
        let zero = ProcessingConfig {
            waveform_seconds: 0,
            ..test_config()
        };
        assert!(matches!(
            SignalProcessor::new(&zero, None),
            Err(ProcessingError::InvalidCapacity { .. })
        ));

        let oversized = ProcessingConfig {
            fft_n: 4096,
            ..test_config()
        };
        assert!(matches!(
            SignalProcessor::new(&oversized, None),
            Err(ProcessingError::FftExceedsCapacity { fft_n: 4096, capacity: 1600 })
        ));

        let tiny = ProcessingConfig { fft_n: 8, ..test_config() };
        assert!(matches!(
            SignalProcessor::new(&tiny, None),
            Err(ProcessingError::FftTooSmall { .. })
        ));
    }

    #[test]
    fn test_ring_buffer_recency() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(10.0, 1000.0, 800, 2400, 0), Some(800), None);
        let first = processor.compute_metrics("s1").expect("metrics");
        assert!((dominant_hz(&first) - 10.0).abs() < 1.5);

        processor.ingest("s1", &tone(50.0, 1000.0, 800, 2400, 0), Some(800), None);
        let second = processor.compute_metrics("s1").expect("metrics");
        assert!((dominant_hz(&second) - 50.0).abs() < 1.5, "got {}", dominant_hz(&second));
    }

    #[test]
    fn test_compute_is_idempotent_without_ingest() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(25.0, 800.0, 800, 1200, 0), Some(800), None);
        let a = processor.compute_metrics("s1").expect("metrics");
        let generation = processor.lock()["s1"].spectrum_generation();
        let b = processor.compute_metrics("s1").expect("metrics");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(processor.lock()["s1"].spectrum_generation(), generation);
        assert_eq!(processor.intake_stats().total_compute_calls, 1);
    }

    #[test]
    fn test_stale_commit_is_discarded() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(25.0, 800.0, 800, 1200, 0), Some(800), None);
        let SnapshotOutcome::Fresh(snapshot) = processor.snapshot("s1") else {
            panic!("expected a fresh snapshot");
        };
        let advanced = snapshot.ingest_generation + 5;
        processor
            .lock()
            .get_mut("s1")
            .expect("buffer")
            .compute_generation = Some(advanced);

        let analysis = processor.analyze(&snapshot);
        assert!(!processor.commit("s1", &snapshot, analysis));
        let buffers = processor.lock();
        assert_eq!(buffers["s1"].compute_generation(), Some(advanced));
        assert!(buffers["s1"].latest_metrics.is_none());
    }

    #[test]
    fn test_flush_discards_in_flight_compute() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(25.0, 800.0, 800, 1200, 0), Some(800), Some(1_000_000));
        let SnapshotOutcome::Fresh(snapshot) = processor.snapshot("s1") else {
            panic!("expected a fresh snapshot");
        };
        assert!(processor.flush_client_buffer("s1"));
        let analysis = processor.analyze(&snapshot);
        assert!(!processor.commit("s1", &snapshot, analysis));

        assert!(processor.compute_metrics("s1").is_none());
        assert!(processor.latest_sample_xyz("s1").is_none());
        assert!(processor.spectrum_payload("s1").is_empty());
        assert!(!processor.flush_client_buffer("missing"));
    }

    #[test]
    fn test_malformed_and_empty_input_is_dropped() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest_interleaved("s1", &[1, 2, 3, 4], Some(800), None);
        processor.ingest("s2", &[], Some(800), None);
        assert!(processor.client_ids().is_empty());

        processor.ingest_interleaved("s3", &[1000, 2000, 3000], None, None);
        let latest = processor.latest_sample_xyz("s3").expect("sample");
        assert!((latest[2] - 3.0).abs() < 1e-12);
        assert_eq!(processor.latest_sample_rate_hz("s3"), None);
    }

    #[test]
    fn test_client_rate_is_clamped_and_resizes() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(25.0, 800.0, 800, 100, 0), Some(10_000), None);
        assert_eq!(processor.latest_sample_rate_hz("s1"), Some(MAX_CLIENT_SAMPLE_RATE_HZ));
        assert_eq!(processor.lock()["s1"].capacity(), MAX_CLIENT_SAMPLE_RATE_HZ as usize * 2);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let pool = Arc::new(WorkerPool::new(2).expect("pool"));
        let sequential = SignalProcessor::new(&test_config(), None).expect("processor");
        let parallel = SignalProcessor::new(&test_config(), Some(pool)).expect("processor");
        let ids: Vec<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();
        for (i, id) in ids.iter().enumerate() {
            let samples = tone(12.0 + 9.0 * i as f64, 900.0, 800, 1500, i * 7);
            sequential.ingest(id, &samples, Some(800), None);
            parallel.ingest(id, &samples, Some(800), None);
        }
        let seq = sequential.compute_all(&ids);
        let par = parallel.compute_all(&ids);
        assert_eq!(seq.len(), 3);
        for id in &ids {
            assert_eq!(*seq[id], *par[id]);
        }
        assert!(parallel.intake_stats().worker_pool.is_some());
        assert!(sequential.intake_stats().worker_pool.is_none());
    }

    #[test]
    fn test_spectrum_payload_is_cached_per_generation() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(40.0, 800.0, 800, 1200, 0), Some(800), None);
        assert!(processor.spectrum_payload("s1").is_empty());
        processor.compute_metrics("s1");
        let a = processor.spectrum_payload("s1");
        let b = processor.spectrum_payload("s1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.x.len(), a.combined_spectrum_amp_g.len());

        processor.ingest("s1", &tone(40.0, 800.0, 800, 100, 1200), Some(800), None);
        processor.compute_metrics("s1");
        assert!(!Arc::ptr_eq(&a, &processor.spectrum_payload("s1")));
    }

    #[test]
    fn test_multi_payload_flags_frequency_mismatch() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("a", &tone(30.0, 800.0, 800, 1200, 0), Some(800), None);
        processor.ingest("b", &tone(30.0, 800.0, 1000, 1500, 0), Some(1000), None);
        let ids = vec!["a".to_string(), "b".to_string()];
        processor.compute_all(&ids);

        let payload = processor.multi_spectrum_payload(&ids);
        let warning = payload.warning.as_ref().expect("mismatch warning");
        assert_eq!(warning.code, FREQUENCY_BIN_MISMATCH);
        assert_eq!(warning.client_ids, vec!["b"]);
        assert!(payload.freq.is_empty());
        assert!(payload.clients["a"].freq.is_some());
        assert!(payload.clients["b"].freq.is_some());
        let alignment = payload.alignment.expect("alignment");
        assert_eq!(alignment.sensor_count, 2);
        assert!(!alignment.clock_synced);
    }

    #[test]
    fn test_multi_payload_shares_matching_axis() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        let ids = vec!["a".to_string(), "b".to_string(), "ghost".to_string()];
        for id in &ids[..2] {
            processor.ingest(id, &tone(30.0, 800.0, 800, 1200, 0), Some(800), Some(2_000_000));
        }
        processor.compute_all(&ids);
        let payload = processor.multi_spectrum_payload(&ids);
        assert!(payload.warning.is_none());
        assert!(!payload.freq.is_empty());
        assert_eq!(payload.clients.len(), 2);
        assert!(payload.clients["a"].freq.is_none());
        assert!(payload.strength_for("a").is_some());
        assert!(payload.alignment.is_some_and(|a| a.sensor_count == 2 && !a.clock_synced));
        let alignment = payload.alignment.expect("alignment");
        assert!(alignment.aligned);
        assert!(alignment.clock_synced);
    }

    #[test]
    fn test_selected_payload_waveform_axis() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(20.0, 500.0, 800, 600, 0), Some(800), None);
        let payload = processor.selected_payload("s1");
        let waveform = payload.waveform.as_ref().expect("waveform");
        // 600 samples decimated by 800 / 120 = 6
        assert_eq!(waveform.t.len(), 100);
        assert!(waveform.t.last().expect("t").abs() < 1e-12);
        assert!((waveform.t[0] + 99.0 * 6.0 / 800.0).abs() < 1e-9);
        assert!(payload.spectrum.as_ref().expect("spectrum").freq.is_empty());
        assert!(Arc::ptr_eq(&payload, &processor.selected_payload("s1")));

        let unknown = processor.selected_payload("nobody");
        assert!(unknown.waveform.is_none());
        assert_eq!(unknown.sample_rate_hz, 800);
    }

    #[test]
    fn test_debug_and_raw_views() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("s1", &tone(20.0, 500.0, 800, 100, 0), Some(800), None);
        assert!(matches!(
            processor.debug_spectrum("s1"),
            DebugSpectrum::InsufficientSamples { count: 100, fft_n: 1024, .. }
        ));
        let raw = processor.raw_samples("s1", DEFAULT_RAW_SAMPLES).expect("raw");
        assert_eq!(raw.n_samples, 100);
        assert!(processor.raw_samples("nobody", 10).is_none());

        processor.ingest("s1", &tone(20.0, 500.0, 800, 1100, 100), Some(800), None);
        let DebugSpectrum::Ready(debug) = processor.debug_spectrum("s1") else {
            panic!("expected debug spectrum");
        };
        assert_eq!(debug.top_bins_by_amplitude.len(), DEBUG_TOP_BINS);
        assert!((debug.top_bins_by_amplitude[0].freq_hz - 20.0).abs() < 1.0);
        assert!((debug.freq_resolution_hz - 800.0 / 1024.0).abs() < 1e-12);
    }

    #[test]
    fn test_recent_data_eviction_and_alignment() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("a", &tone(20.0, 500.0, 800, 800, 0), Some(800), Some(5_000_000));
        processor.ingest("b", &tone(20.0, 500.0, 800, 800, 0), Some(800), Some(5_000_000));
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(processor.clients_with_recent_data(&ids, 3.0), vec!["a", "b"]);
        assert!(processor.clients_with_recent_data(&ids, -1.0).is_empty());

        let info = processor.time_alignment_info(&ids);
        assert_eq!(info.sensors_excluded, vec!["c"]);
        assert!(info.aligned);
        assert!(info.clock_synced);
        assert!((info.overlap_ratio - 1.0).abs() < 1e-9);

        let keep: HashSet<String> = std::iter::once("a".to_string()).collect();
        assert_eq!(processor.evict_clients(&keep), vec!["b"]);
        assert_eq!(processor.client_ids(), vec!["a"]);
        assert_eq!(processor.intake_stats().total_ingested_samples, 1600);
    }

    #[test]
    fn test_near_max_sensor_clock_does_not_break_payloads() {
        let processor = SignalProcessor::new(&test_config(), None).expect("processor");
        processor.ingest("a", &tone(20.0, 500.0, 800, 1200, 0), Some(800), Some(u64::MAX - 10));
        processor.ingest("b", &tone(20.0, 500.0, 800, 1200, 0), Some(800), Some(1_000_000));
        let ids = vec!["a".to_string(), "b".to_string()];
        processor.compute_all(&ids);

        let payload = processor.multi_spectrum_payload(&ids);
        assert_eq!(payload.clients.len(), 2);
        assert!(payload.strength_for("a").is_some());
        assert!(payload.alignment.is_some_and(|a| a.sensor_count == 2 && !a.clock_synced));

        let info = processor.time_alignment_info(&ids);
        assert_eq!(info.sensors_included, vec!["a", "b"]);
        assert!(!info.per_sensor["a"].synced);
        assert!(info.per_sensor["b"].synced);
        assert!(!info.clock_synced);
    }
}
