//! Connected sensor bookkeeping: identity, sequence tracking and liveness.
//!
//! Every batch passes through [`SensorRegistry::update_from_batch`] before
//! its samples reach the signal processor. The registry detects duplicate
//! frames, sensor restarts (large backward sequence jumps) and dropped
//! frames, and tracks timing jitter between the sensor clock and the
//! nominal sample rate.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::source::SampleBatch;
use crate::config::defaults::{DEDUP_RESTART_GAP, DEDUP_WINDOW, RESET_SEQ_GAP};
use crate::diagnostics::ClientInfo;

/// Smoothing factor of the timing jitter EMA.
const JITTER_EMA_ALPHA: f64 = 0.2;

/// Gaps at or above this are treated as out-of-order, not drops.
const MAX_FORWARD_GAP: u32 = 0x8000_0000;

/// Outcome of registering one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataUpdateResult {
    /// The sensor restarted; its sample buffer should be flushed.
    pub reset_detected: bool,
    /// The frame was already seen and must not be ingested again.
    pub is_duplicate: bool,
}

/// Per-sensor record.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub name: Option<String>,
    pub location: String,
    pub sample_rate_hz: Option<u32>,
    /// Registry clock of the last batch, seconds.
    pub last_seen_s: f64,
    pub frames_total: u64,
    pub frames_dropped: u64,
    pub duplicates_received: u64,
    pub reset_count: u64,
    pub last_reset_s: Option<f64>,
    pub last_seq: Option<u32>,
    pub last_t0_us: Option<u64>,
    /// EMA of batch timing error against the nominal rate, microseconds.
    pub timing_jitter_us: f64,
    /// Accumulated timing error since the last reset, microseconds.
    pub timing_drift_us: f64,
    #[serde(skip)]
    seen_seqs: BTreeSet<u32>,
}

impl ClientRecord {
    fn new(client_id: &str, now_s: f64) -> Self {
        Self {
            client_id: client_id.to_string(),
            name: None,
            location: String::new(),
            sample_rate_hz: None,
            last_seen_s: now_s,
            frames_total: 0,
            frames_dropped: 0,
            duplicates_received: 0,
            reset_count: 0,
            last_reset_s: None,
            last_seq: None,
            last_t0_us: None,
            timing_jitter_us: 0.0,
            timing_drift_us: 0.0,
            seen_seqs: BTreeSet::new(),
        }
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.client_id.clone(),
            name: self.name.clone(),
            location: self.location.clone(),
        }
    }

    /// True when `seq` repeats a recent frame. A repeat far behind the
    /// newest frame means the sensor restarted; the dedup window is cleared
    /// and the frame accepted.
    fn check_duplicate(&mut self, seq: u32) -> bool {
        if !self.seen_seqs.contains(&seq) {
            return false;
        }
        let backward = match self.last_seq {
            Some(last) if last > seq => last - seq,
            _ => 0,
        };
        if backward <= DEDUP_RESTART_GAP {
            self.duplicates_received += 1;
            return true;
        }
        self.seen_seqs.clear();
        false
    }

    fn remember_seq(&mut self, seq: u32) {
        self.seen_seqs.insert(seq);
        if self.seen_seqs.len() > DEDUP_WINDOW {
            if let Some(&max) = self.seen_seqs.last() {
                let floor = max.saturating_sub(DEDUP_WINDOW as u32 - 1);
                self.seen_seqs = self.seen_seqs.split_off(&floor);
            }
        }
    }

    fn update_jitter(&mut self, t0_us: u64, sample_count: usize) {
        let (Some(rate), Some(last_t0)) = (self.sample_rate_hz, self.last_t0_us) else {
            return;
        };
        if rate == 0 || sample_count == 0 || last_t0 > t0_us {
            return;
        }
        let expected_us = sample_count as f64 / f64::from(rate) * 1e6;
        let jitter = (t0_us - last_t0) as f64 - expected_us;
        self.timing_jitter_us = JITTER_EMA_ALPHA * jitter + (1.0 - JITTER_EMA_ALPHA) * self.timing_jitter_us;
        self.timing_drift_us += jitter;
    }

    /// Sequence bookkeeping after a frame was accepted. Returns whether the
    /// sensor restarted.
    fn track_sequence(&mut self, seq: u32, now_s: f64) -> bool {
        let Some(last) = self.last_seq else {
            return false;
        };
        if seq < last && last - seq > RESET_SEQ_GAP {
            self.reset_count += 1;
            self.last_reset_s = Some(now_s);
            self.last_t0_us = None;
            self.timing_jitter_us = 0.0;
            self.timing_drift_us = 0.0;
            self.seen_seqs.clear();
            self.seen_seqs.insert(seq);
            return true;
        }
        let expected = last.wrapping_add(1);
        if seq != expected {
            let gap = seq.wrapping_sub(expected);
            if gap < MAX_FORWARD_GAP {
                self.frames_dropped += u64::from(gap);
            }
        }
        false
    }
}

/// Registry of every sensor seen by this process.
///
/// Not internally synchronized; the live loop owns it.
#[derive(Debug)]
pub struct SensorRegistry {
    clients: BTreeMap<String, ClientRecord>,
    ttl_s: f64,
}

impl SensorRegistry {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            clients: BTreeMap::new(),
            ttl_s: ttl_seconds as f64,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, client_id: &str) -> Option<&ClientRecord> {
        self.clients.get(client_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    pub fn set_name(&mut self, client_id: &str, name: &str, now_s: f64) {
        let record = self.clients.entry(client_id.to_string()).or_insert_with(|| ClientRecord::new(client_id, now_s));
        let name = name.trim();
        record.name = (!name.is_empty()).then(|| name.to_string());
    }

    pub fn set_location(&mut self, client_id: &str, location: &str, now_s: f64) {
        let record = self.clients.entry(client_id.to_string()).or_insert_with(|| ClientRecord::new(client_id, now_s));
        record.location = location.trim().to_string();
    }

    /// Register one batch at registry time `now_s`.
    pub fn update_from_batch(&mut self, batch: &SampleBatch, now_s: f64) -> DataUpdateResult {
        let record = self
            .clients
            .entry(batch.client_id.clone())
            .or_insert_with(|| ClientRecord::new(&batch.client_id, now_s));
        record.last_seen_s = now_s;
        if let Some(name) = batch.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            record.name = Some(name.to_string());
        }
        if let Some(location) = batch.location.as_deref() {
            record.location = location.trim().to_string();
        }
        if let Some(rate) = batch.sample_rate_hz.filter(|r| *r > 0) {
            record.sample_rate_hz = Some(rate);
        }

        let mut result = DataUpdateResult::default();
        if let Some(seq) = batch.seq {
            if record.check_duplicate(seq) {
                result.is_duplicate = true;
                return result;
            }
            record.remember_seq(seq);
        }
        record.frames_total += 1;

        if let Some(t0) = batch.t0_us {
            record.update_jitter(t0, batch.samples.len());
        }
        if let Some(seq) = batch.seq {
            result.reset_detected = record.track_sequence(seq, now_s);
            record.last_seq = Some(seq);
        }
        if batch.t0_us.is_some() {
            record.last_t0_us = batch.t0_us;
        }
        result
    }

    /// Ids seen within the TTL, sorted.
    pub fn active_client_ids(&self, now_s: f64) -> Vec<String> {
        self.clients
            .values()
            .filter(|r| now_s - r.last_seen_s <= self.ttl_s)
            .map(|r| r.client_id.clone())
            .collect()
    }

    /// Identities of the active clients, in id order.
    pub fn client_infos(&self, now_s: f64) -> Vec<ClientInfo> {
        self.clients
            .values()
            .filter(|r| now_s - r.last_seen_s <= self.ttl_s)
            .map(ClientRecord::info)
            .collect()
    }

    /// Drop clients silent for longer than the TTL and return their ids.
    pub fn evict_stale(&mut self, now_s: f64) -> Vec<String> {
        let ttl_s = self.ttl_s;
        let stale: Vec<String> = self
            .clients
            .values()
            .filter(|r| now_s - r.last_seen_s > ttl_s)
            .map(|r| r.client_id.clone())
            .collect();
        for client_id in &stale {
            self.clients.remove(client_id);
        }
        stale
    }

    pub fn remove_client(&mut self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(seq: u32) -> SampleBatch {
        let mut batch = SampleBatch::new("s1", vec![[0, 0, 0]; 100]);
        batch.seq = Some(seq);
        batch
    }

    #[test]
    fn test_recent_repeat_is_duplicate() {
        let mut registry = SensorRegistry::new(120);
        for seq in 0..10 {
            assert_eq!(registry.update_from_batch(&batch(seq), 0.0), DataUpdateResult::default());
        }
        let result = registry.update_from_batch(&batch(7), 0.0);
        assert!(result.is_duplicate);
        let record = registry.get("s1").expect("record");
        assert_eq!(record.duplicates_received, 1);
        assert_eq!(record.frames_total, 10);
        assert_eq!(record.last_seq, Some(9));
    }

    #[test]
    fn test_far_repeat_restarts_dedup_window() {
        let mut registry = SensorRegistry::new(120);
        for seq in 0..20 {
            registry.update_from_batch(&batch(seq), 0.0);
        }
        // seq 2 was seen but is 17 behind: the sensor restarted
        let result = registry.update_from_batch(&batch(2), 0.0);
        assert!(!result.is_duplicate);
        let record = registry.get("s1").expect("record");
        assert_eq!(record.frames_total, 21);
        assert_eq!(record.duplicates_received, 0);
    }

    #[test]
    fn test_large_backward_jump_is_reset() {
        let mut registry = SensorRegistry::new(120);
        registry.update_from_batch(&batch(5000), 0.0);
        let result = registry.update_from_batch(&batch(3), 1.0);
        assert!(result.reset_detected);
        let record = registry.get("s1").expect("record");
        assert_eq!(record.reset_count, 1);
        assert_eq!(record.last_reset_s, Some(1.0));
        assert_eq!(record.frames_dropped, 0);
        // sequence continues from the new origin
        assert!(!registry.update_from_batch(&batch(4), 1.1).reset_detected);
    }

    #[test]
    fn test_forward_gap_counts_drops_across_wrap() {
        let mut registry = SensorRegistry::new(120);
        registry.update_from_batch(&batch(u32::MAX - 1), 0.0);
        registry.update_from_batch(&batch(2), 0.0);
        // expected u32::MAX, got 2: MAX, 0 and 1 were lost
        assert_eq!(registry.get("s1").expect("record").frames_dropped, 3);
        // small backward step is out-of-order, not a drop
        registry.update_from_batch(&batch(1), 0.0);
        assert_eq!(registry.get("s1").expect("record").frames_dropped, 3);
    }

    #[test]
    fn test_dedup_window_is_bounded() {
        let mut registry = SensorRegistry::new(120);
        for seq in 0..500 {
            registry.update_from_batch(&batch(seq), 0.0);
        }
        let record = registry.get("s1").expect("record");
        assert_eq!(record.seen_seqs.len(), DEDUP_WINDOW);
        assert_eq!(record.seen_seqs.first(), Some(&(500 - DEDUP_WINDOW as u32)));
    }

    #[test]
    fn test_jitter_tracks_clock_error() {
        let mut registry = SensorRegistry::new(120);
        let mut first = batch(0);
        first.sample_rate_hz = Some(1000);
        first.t0_us = Some(0);
        registry.update_from_batch(&first, 0.0);
        // 100 samples at 1 kHz = 100 ms, arrived 110 ms later
        let mut second = batch(1);
        second.t0_us = Some(110_000);
        registry.update_from_batch(&second, 0.1);
        let record = registry.get("s1").expect("record");
        assert!((record.timing_drift_us - 10_000.0).abs() < 1e-6);
        assert!((record.timing_jitter_us - 2_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_ttl_filters_and_evicts() {
        let mut registry = SensorRegistry::new(10);
        let mut a = SampleBatch::new("a", vec![]);
        a.name = Some(" Front Left ".into());
        a.location = Some("front_left_wheel".into());
        registry.update_from_batch(&a, 0.0);
        registry.update_from_batch(&SampleBatch::new("b", vec![]), 8.0);

        let infos = registry.client_infos(9.0);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].label(), "Front Left");
        assert_eq!(infos[0].location, "front_left_wheel");

        assert_eq!(registry.active_client_ids(12.0), vec!["b".to_string()]);
        assert_eq!(registry.evict_stale(12.0), vec!["a".to_string()]);
        assert_eq!(registry.len(), 1);
    }
}
