//! Sample source abstraction for accelerometer batch ingestion.
//!
//! Provides a unified trait for reading sample batches from different
//! sources: pre-loaded batches (replay / simulation) and JSON lines on any
//! async reader (stdin in production).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};

/// One batch of raw `[x, y, z]` samples from a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Frame sequence number, wrapping at `u32::MAX`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    /// Sensor-clock timestamp of the first sample in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t0_us: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate_hz: Option<u32>,
    /// Latest resolved vehicle speed, if the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    pub samples: Vec<[i16; 3]>,
}

impl SampleBatch {
    pub fn new(client_id: impl Into<String>, samples: Vec<[i16; 3]>) -> Self {
        Self {
            client_id: client_id.into(),
            name: None,
            location: None,
            seq: None,
            t0_us: None,
            sample_rate_hz: None,
            speed_mps: None,
            samples,
        }
    }
}

/// Events produced by a sample source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A parsed sample batch.
    Batch(SampleBatch),
    /// Source reached end of data.
    Eof,
}

/// Trait abstracting where sample batches come from.
///
/// Implementations handle parsing and pacing internally. The live loop
/// drives a source from its own reader task, so `next_batch` need not be
/// cancel-safe.
#[async_trait]
pub trait SampleSource: Send + 'static {
    /// Read the next batch.
    ///
    /// Returns `SourceEvent::Eof` when no more data is available and `Err`
    /// on unrecoverable I/O errors.
    async fn next_batch(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging (e.g. "replay", "stdin").
    fn source_name(&self) -> &str;
}

// ============================================================================
// Replay Source (pre-loaded / simulated batches)
// ============================================================================

/// Replays pre-loaded batches with an optional inter-batch delay.
pub struct ReplaySource {
    batches: std::vec::IntoIter<SampleBatch>,
    delay_ms: u64,
    yielded_first: bool,
}

impl ReplaySource {
    pub fn new(batches: Vec<SampleBatch>, delay_ms: u64) -> Self {
        Self {
            batches: batches.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }
}

#[async_trait]
impl SampleSource for ReplaySource {
    async fn next_batch(&mut self) -> Result<SourceEvent> {
        // no delay before the first batch
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.batches.next() {
            Some(batch) => {
                self.yielded_first = true;
                Ok(SourceEvent::Batch(batch))
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// JSON Lines Source (one SampleBatch per line)
// ============================================================================

/// Reads JSON-encoded [`SampleBatch`] lines from an async reader.
///
/// Used with the simulator:
/// `simulation --fault wheel | vibesensor --stdin`
pub struct JsonLinesSource<R> {
    reader: R,
    name: &'static str,
    line_buffer: String,
    malformed_lines: u64,
}

/// JSON lines on the process's standard input.
pub type StdinSource = JsonLinesSource<BufReader<Stdin>>;

impl StdinSource {
    pub fn stdin() -> Self {
        JsonLinesSource::new(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, name: &'static str) -> Self {
        Self {
            reader,
            name,
            line_buffer: String::with_capacity(8192),
            malformed_lines: 0,
        }
    }

    /// Lines skipped because they did not parse.
    pub const fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }
}

#[async_trait]
impl<R> SampleSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_batch(&mut self) -> Result<SourceEvent> {
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(SourceEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SampleBatch>(line) {
                Ok(batch) => return Ok(SourceEvent::Batch(batch)),
                Err(e) => {
                    self.malformed_lines += 1;
                    tracing::warn!(source = self.name, error = %e, "Skipping malformed batch line");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        self.name
    }
}
