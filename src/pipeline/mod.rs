//! Live Pipeline Module
//!
//! ## Architecture
//!
//! ```text
//! SampleSource (stdin JSON lines / replay)
//!        │ reader task ──► mpsc
//!        ▼
//! LiveLoop ── SensorRegistry (dedup, restarts, drops, TTL)
//!        │
//!        ├─ batch  ──► SignalProcessor::ingest
//!        ├─ heavy  ──► compute_all + multi_spectrum_payload ──► engine.update(Some)
//!        └─ light  ──► engine.update(None)
//!                               │
//!                               ▼
//!                  Arc<RwLock<LiveState>> (latest snapshot)
//! ```

mod state;
pub mod live_loop;
pub mod registry;
pub mod source;

pub use live_loop::{LiveLoop, LoopStats, SettingsHandle};
pub use registry::{ClientRecord, DataUpdateResult, SensorRegistry};
pub use source::{JsonLinesSource, ReplaySource, SampleBatch, SampleSource, SourceEvent, StdinSource};
pub use state::*;
