//! Windowed source x severity matrix of event counts and dwell seconds.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use super::levels::ActiveLevel;
use super::MATRIX_WINDOW_MS;
use crate::orders::MatrixSource;
use crate::strength::StrengthBucket;

/// Upper bound on buffered events of each kind.
const MATRIX_MAX_EVENTS: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatrixCell {
    pub count: u64,
    pub seconds: f64,
    /// Count per contributing sensor label.
    pub contributors: BTreeMap<String, u64>,
}

pub type MatrixTable = BTreeMap<MatrixSource, BTreeMap<StrengthBucket, MatrixCell>>;

#[derive(Debug, Clone)]
struct CountEvent {
    ts_ms: u64,
    source: MatrixSource,
    bucket: StrengthBucket,
    contributor: String,
}

#[derive(Debug, Clone, Copy)]
struct SecondsEvent {
    ts_ms: u64,
    source: MatrixSource,
    bucket: StrengthBucket,
    dt_s: f64,
}

/// Event log plus the table rebuilt from it.
#[derive(Debug, Clone)]
pub struct DwellMatrix {
    table: MatrixTable,
    count_events: VecDeque<CountEvent>,
    seconds_events: VecDeque<SecondsEvent>,
}

impl Default for DwellMatrix {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_table() -> MatrixTable {
    MatrixSource::ALL
        .iter()
        .map(|source| {
            let row = StrengthBucket::ALL
                .iter()
                .rev()
                .map(|bucket| (*bucket, MatrixCell::default()))
                .collect();
            (*source, row)
        })
        .collect()
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T) {
    if queue.len() >= MATRIX_MAX_EVENTS {
        queue.pop_front();
    }
    queue.push_back(item);
}

impl DwellMatrix {
    pub fn new() -> Self {
        Self {
            table: empty_table(),
            count_events: VecDeque::new(),
            seconds_events: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Table as of the last [`rebuild`](Self::rebuild).
    pub const fn table(&self) -> &MatrixTable {
        &self.table
    }

    pub fn cell(&self, source: MatrixSource, bucket: StrengthBucket) -> Option<&MatrixCell> {
        self.table.get(&source)?.get(&bucket)
    }

    pub fn record_count(&mut self, now_ms: u64, source: MatrixSource, bucket: StrengthBucket, contributor: &str) {
        push_bounded(
            &mut self.count_events,
            CountEvent {
                ts_ms: now_ms,
                source,
                bucket,
                contributor: contributor.to_string(),
            },
        );
    }

    pub fn record_many(&mut self, now_ms: u64, sources: &[MatrixSource], bucket: StrengthBucket, contributor: &str) {
        for source in sources {
            self.record_count(now_ms, *source, bucket, contributor);
        }
    }

    /// Credit `dt_s` to the band each active source currently sits in.
    pub fn accumulate_seconds(&mut self, now_ms: u64, dt_s: f64, active_by_source: &BTreeMap<MatrixSource, ActiveLevel>) {
        if dt_s.is_nan() || dt_s <= 0.0 {
            return;
        }
        for (source, level) in active_by_source {
            push_bounded(
                &mut self.seconds_events,
                SecondsEvent {
                    ts_ms: now_ms,
                    source: *source,
                    bucket: level.bucket,
                    dt_s,
                },
            );
        }
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(MATRIX_WINDOW_MS);
        while self.count_events.front().is_some_and(|e| e.ts_ms < cutoff) {
            self.count_events.pop_front();
        }
        while self.seconds_events.front().is_some_and(|e| e.ts_ms < cutoff) {
            self.seconds_events.pop_front();
        }
    }

    /// Drop events older than the window and recompute the table.
    pub fn rebuild(&mut self, now_ms: u64) {
        self.prune(now_ms);
        let mut table = empty_table();
        for event in &self.count_events {
            if let Some(cell) = table.get_mut(&event.source).and_then(|row| row.get_mut(&event.bucket)) {
                cell.count += 1;
                *cell.contributors.entry(event.contributor.clone()).or_insert(0) += 1;
            }
        }
        for event in &self.seconds_events {
            if let Some(cell) = table.get_mut(&event.source).and_then(|row| row.get_mut(&event.bucket)) {
                cell.seconds += event.dt_s;
            }
        }
        self.table = table;
    }
}
