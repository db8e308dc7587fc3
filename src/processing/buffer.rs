//! Per-client ring buffer with generation counters.

use std::sync::Arc;

use super::fft::{AxisBlock, SpectrumResult};
use super::metrics::ClientMetrics;
use super::payload::{SelectedPayload, SpectrumPayload};
use super::time_align::BufferTiming;

/// Cache key of a selected payload: `(ingest_gen, spectrum_gen, sample_rate)`.
pub type SelectedKey = (u64, u64, u32);

/// Circular 3-axis sample store plus the latest analysis of its contents.
///
/// - `ingest_generation` increments on every ingest and flush.
/// - `compute_generation` is the ingest generation the stored metrics
///   reflect (`None` before the first commit).
/// - `spectrum_generation` increments on every commit and keys the
///   spectrum payload cache.
#[derive(Debug, Clone)]
pub struct ClientBuffer {
    pub(crate) data: AxisBlock,
    pub(crate) capacity: usize,
    pub(crate) write_idx: usize,
    pub(crate) count: usize,
    /// Last rate the client reported, 0 if none.
    pub(crate) sample_rate_hz: u32,
    pub(crate) latest_metrics: Option<Arc<ClientMetrics>>,
    pub(crate) latest_spectrum: Option<Arc<SpectrumResult>>,
    pub(crate) first_ingest_s: Option<f64>,
    pub(crate) last_ingest_s: Option<f64>,
    /// Sensor-clock timestamp (µs) of the newest frame.
    pub(crate) last_t0_us: u64,
    /// Samples ingested since `last_t0_us` was recorded.
    pub(crate) samples_since_t0: u64,
    pub(crate) ingest_generation: u64,
    pub(crate) compute_generation: Option<u64>,
    pub(crate) compute_sample_rate_hz: u32,
    pub(crate) spectrum_generation: u64,
    pub(crate) cached_spectrum_payload: Option<(u64, Arc<SpectrumPayload>)>,
    pub(crate) cached_selected_payload: Option<(SelectedKey, Arc<SelectedPayload>)>,
}

impl ClientBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: [vec![0.0; capacity], vec![0.0; capacity], vec![0.0; capacity]],
            capacity,
            write_idx: 0,
            count: 0,
            sample_rate_hz: 0,
            latest_metrics: None,
            latest_spectrum: None,
            first_ingest_s: None,
            last_ingest_s: None,
            last_t0_us: 0,
            samples_since_t0: 0,
            ingest_generation: 0,
            compute_generation: None,
            compute_sample_rate_hz: 0,
            spectrum_generation: 0,
            cached_spectrum_payload: None,
            cached_selected_payload: None,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    pub const fn ingest_generation(&self) -> u64 {
        self.ingest_generation
    }

    pub const fn compute_generation(&self) -> Option<u64> {
        self.compute_generation
    }

    pub const fn spectrum_generation(&self) -> u64 {
        self.spectrum_generation
    }

    pub fn invalidate_caches(&mut self) {
        self.cached_spectrum_payload = None;
        self.cached_selected_payload = None;
    }

    /// Append rows, overwriting the oldest samples once full.
    ///
    /// Only the tail of a chunk longer than the capacity is kept. Returns
    /// the number of rows written.
    pub(crate) fn write(&mut self, rows: &[[f64; 3]]) -> usize {
        let rows = if rows.len() >= self.capacity {
            &rows[rows.len() - self.capacity..]
        } else {
            rows
        };
        for row in rows {
            for (axis, value) in row.iter().enumerate() {
                self.data[axis][self.write_idx] = *value;
            }
            self.write_idx = (self.write_idx + 1) % self.capacity;
        }
        self.count = (self.count + rows.len()).min(self.capacity);
        rows.len()
    }

    /// Copy of the newest `n` samples per axis, oldest first.
    pub(crate) fn latest(&self, n: usize) -> AxisBlock {
        let n = n.min(self.count);
        if n == 0 {
            return Default::default();
        }
        let start = (self.write_idx + self.capacity - n) % self.capacity;
        let copy_axis = |axis: &Vec<f64>| -> Vec<f64> {
            if start + n <= self.capacity {
                axis[start..start + n].to_vec()
            } else {
                let first = self.capacity - start;
                let mut out = Vec::with_capacity(n);
                out.extend_from_slice(&axis[start..]);
                out.extend_from_slice(&axis[..n - first]);
                out
            }
        };
        [copy_axis(&self.data[0]), copy_axis(&self.data[1]), copy_axis(&self.data[2])]
    }

    /// Change capacity, keeping the most recent samples.
    pub(crate) fn resize(&mut self, new_capacity: usize) {
        let new_capacity = new_capacity.max(1);
        if new_capacity == self.capacity {
            return;
        }
        let latest = self.latest(self.count.min(new_capacity));
        let kept = latest[0].len();
        let mut data: AxisBlock = [vec![0.0; new_capacity], vec![0.0; new_capacity], vec![0.0; new_capacity]];
        for (dst, src) in data.iter_mut().zip(latest.iter()) {
            dst[..kept].copy_from_slice(src);
        }
        self.data = data;
        self.capacity = new_capacity;
        self.write_idx = kept % new_capacity;
        self.count = kept;
    }

    /// Newest sample, if any.
    pub(crate) fn latest_sample(&self) -> Option<[f64; 3]> {
        if self.count == 0 {
            return None;
        }
        let idx = (self.write_idx + self.capacity - 1) % self.capacity;
        Some([self.data[0][idx], self.data[1][idx], self.data[2][idx]])
    }

    /// Drop samples and analysis state after a sensor reset.
    ///
    /// Both generations move to the same new value so an in-flight compute
    /// snapshotted before the flush can never commit.
    pub(crate) fn flush(&mut self) {
        for axis in &mut self.data {
            axis.fill(0.0);
        }
        self.write_idx = 0;
        self.count = 0;
        self.first_ingest_s = None;
        self.last_t0_us = 0;
        self.samples_since_t0 = 0;
        self.latest_metrics = None;
        self.latest_spectrum = None;
        self.invalidate_caches();
        self.ingest_generation += 1;
        self.compute_generation = Some(self.ingest_generation);
    }

    pub(crate) const fn timing(&self, sample_rate_hz: u32, waveform_seconds: u32) -> BufferTiming {
        BufferTiming {
            count: self.count,
            capacity: self.capacity,
            sample_rate_hz,
            waveform_seconds,
            last_ingest_s: self.last_ingest_s,
            last_t0_us: self.last_t0_us,
            samples_since_t0: self.samples_since_t0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, n: usize) -> Vec<[f64; 3]> {
        (start..start + n).map(|i| [i as f64, -(i as f64), 0.0]).collect()
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let mut buf = ClientBuffer::new(5);
        buf.write(&ramp(0, 3));
        buf.write(&ramp(3, 4));
        assert_eq!(buf.count(), 5);
        let latest = buf.latest(5);
        assert_eq!(latest[0], vec![2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(latest[1], vec![-2.0, -3.0, -4.0, -5.0, -6.0]);
        assert_eq!(buf.latest_sample(), Some([6.0, -6.0, 0.0]));
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut buf = ClientBuffer::new(4);
        assert_eq!(buf.write(&ramp(0, 10)), 4);
        assert_eq!(buf.latest(4)[0], vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_resize_keeps_latest() {
        let mut buf = ClientBuffer::new(6);
        buf.write(&ramp(0, 6));
        buf.resize(3);
        assert_eq!(buf.capacity(), 3);
        assert_eq!(buf.latest(3)[0], vec![3.0, 4.0, 5.0]);
        buf.resize(8);
        assert_eq!(buf.count(), 3);
        buf.write(&ramp(6, 1));
        assert_eq!(buf.latest(8)[0], vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_flush_moves_both_generations() {
        let mut buf = ClientBuffer::new(4);
        buf.write(&ramp(0, 2));
        buf.ingest_generation = 7;
        buf.flush();
        assert_eq!(buf.count(), 0);
        assert_eq!(buf.ingest_generation(), 8);
        assert_eq!(buf.compute_generation(), Some(8));
        assert!(buf.latest_sample().is_none());
        assert!(buf.latest(4)[0].is_empty());
    }
}
