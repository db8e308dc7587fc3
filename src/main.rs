//! VibeSensor - live vehicle vibration diagnostics
//!
//! Reads accelerometer batches, runs the live diagnostics loop and reports
//! severity findings as they develop.
//!
//! # Usage
//!
//! ```bash
//! # Built-in simulation with a wheel fault at 90 km/h
//! cargo run --release -- --simulate wheel --speed-kmh 90
//!
//! # JSON-line batches from the simulator or a gateway
//! ./simulation --fault engine | ./vibesensor --stdin
//! ```
//!
//! # Environment Variables
//!
//! - `VIBESENSOR_CONFIG`: Path to the pipeline TOML config
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vibesensor::config::{self, PipelineConfig};
use vibesensor::pipeline::{LiveLoop, LiveState, LoopStats, ReplaySource, SampleSource, StdinSource};
use vibesensor::simulate::{Fault, SimulationConfig, VehicleSimulator};
use vibesensor::{SignalProcessor, WorkerPool};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vibesensor")]
#[command(about = "Real-time multi-sensor vehicle vibration diagnostics")]
#[command(version)]
struct CliArgs {
    /// Pipeline config file (overrides VIBESENSOR_CONFIG and ./vibesensor.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read JSON sample batches from stdin, one per line
    #[arg(long, conflicts_with = "simulate")]
    stdin: bool,

    /// Run the built-in simulator with the given fault (none, wheel, driveshaft, engine)
    #[arg(long, value_name = "FAULT")]
    simulate: Option<Fault>,

    /// Vehicle speed in km/h until batches report one
    #[arg(long, env = "VIBESENSOR_SPEED_KMH")]
    speed_kmh: Option<f64>,

    /// Simulated drive length in seconds
    #[arg(long, default_value = "20")]
    seconds: f64,

    /// Replay speed multiplier for the simulator (0 = no delay)
    #[arg(long, default_value = "1")]
    speed: u64,

    /// Random seed for the simulator
    #[arg(long)]
    seed: Option<u64>,

    /// Seconds between status summaries
    #[arg(long, default_value = "5")]
    report_interval_s: u64,

    /// Write the final diagnostics snapshot as JSON to this path
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Log as JSON lines instead of human-readable text
    #[arg(long)]
    log_json: bool,

    /// Print the effective config as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Clone, Copy)]
enum TaskName {
    LiveLoop,
    StatusReporter,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LiveLoop => write!(f, "LiveLoop"),
            Self::StatusReporter => write!(f, "StatusReporter"),
        }
    }
}

// ============================================================================
// Startup
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(PipelineConfig::load()),
    }
}

fn build_processor(config: &PipelineConfig) -> Result<Arc<SignalProcessor>> {
    let workers = config.processing.worker_threads;
    let pool = if workers > 1 {
        Some(Arc::new(WorkerPool::new(workers).context("Failed to start worker pool")?))
    } else {
        None
    };
    let processor =
        SignalProcessor::new(&config.processing, pool).context("Invalid signal processing config")?;
    Ok(Arc::new(processor))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let pipeline_config = load_config(args.config.as_ref())?;
    if args.print_config {
        print!("{}", pipeline_config.to_toml()?);
        return Ok(());
    }
    config::init(pipeline_config);
    let config = config::get();

    info!(
        fft_n = config.processing.fft_n,
        sample_rate_hz = config.processing.sample_rate_hz,
        heavy_tick_ms = config.diagnostics.heavy_tick_ms,
        light_tick_ms = config.diagnostics.light_tick_ms,
        "VibeSensor starting"
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let speed_mps = args.speed_kmh.map(|kmh| kmh / 3.6);
    let state = Arc::new(RwLock::new(LiveState::default()));

    if args.stdin {
        info!("Input: stdin (JSON sample batches)");
        run_pipeline(StdinSource::stdin(), config, speed_mps, &args, state, cancel_token).await?;
    } else {
        let fault = args.simulate.unwrap_or_default();
        let sim_config = SimulationConfig {
            speed_kmh: args.speed_kmh.unwrap_or(80.0),
            seconds: args.seconds,
            sample_rate_hz: config.processing.sample_rate_hz,
            fault,
            seed: args.seed,
            ..SimulationConfig::default()
        };
        let simulator = VehicleSimulator::new(sim_config, &config.vehicle).context("Invalid simulation")?;
        let round_ms = simulator.batch_period_ms();
        let sensors = simulator.sensor_count() as u64;
        let delay_ms = if args.speed == 0 { 0 } else { round_ms / sensors.max(1) / args.speed };
        info!(
            fault = %fault,
            fault_hz = ?simulator.fault_hz(),
            batches = simulator.total_batches(),
            delay_ms,
            "Input: built-in simulator"
        );
        let source = ReplaySource::new(simulator.collect(), delay_ms);
        let speed_mps = speed_mps.or(Some(80.0 / 3.6));
        run_pipeline(source, config, speed_mps, &args, state, cancel_token).await?;
    }

    info!("VibeSensor shutdown complete");
    Ok(())
}

// ============================================================================
// Pipeline Runner
// ============================================================================

/// Run the live loop with any sample source, plus the status reporter.
async fn run_pipeline<S: SampleSource>(
    source: S,
    config: &PipelineConfig,
    speed_mps: Option<f64>,
    args: &CliArgs,
    state: Arc<RwLock<LiveState>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let processor = build_processor(config)?;
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: live loop; cancels everything else when the source ends
    let loop_cancel = cancel_token.clone();
    let live = LiveLoop::new(Arc::clone(&processor), Arc::clone(&state), config, cancel_token.child_token())
        .with_speed(speed_mps);
    task_set.spawn(async move {
        let stats = live.run(source).await;
        log_final_stats(&stats);
        loop_cancel.cancel();
        Ok(TaskName::LiveLoop)
    });

    // Task 2: periodic status summary
    spawn_status_reporter(
        &mut task_set,
        Arc::clone(&state),
        Duration::from_secs(args.report_interval_s.max(1)),
        cancel_token.clone(),
    );

    run_supervisor(&mut task_set, cancel_token).await?;

    if let Some(path) = &args.output {
        write_snapshot(&state, path).await?;
    }
    Ok(())
}

fn spawn_status_reporter(
    task_set: &mut JoinSet<Result<TaskName>>,
    state: Arc<RwLock<LiveState>>,
    every: Duration,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => return Ok(TaskName::StatusReporter),
                _ = interval.tick() => {
                    let state = state.read().await;
                    let top = state.latest_snapshot.as_ref().and_then(|s| s.top_finding.as_ref());
                    info!(
                        status = %state.status,
                        clients = state.active_clients,
                        batches = state.batches_ingested,
                        heavy_ticks = state.heavy_ticks,
                        phase = ?state.latest_snapshot.as_ref().map(|s| s.driving_phase),
                        top_finding = top.map_or("-", |f| f.finding_id.as_str()),
                        top_message = top.map_or("", |f| f.message.as_str()),
                        "Status"
                    );
                }
            }
        }
    });
}

/// Monitor tasks until all complete; a failed task cancels the rest.
async fn run_supervisor(task_set: &mut JoinSet<Result<TaskName>>, cancel_token: CancellationToken) -> Result<()> {
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!(task = %task_name, "Task completed"),
            Ok(Err(e)) => {
                error!(error = %e, "Task failed");
                cancel_token.cancel();
                return Err(e);
            }
            Err(e) => {
                error!(error = %e, "Task panicked");
                cancel_token.cancel();
                return Err(anyhow::anyhow!("Task panicked: {e}"));
            }
        }
    }
    Ok(())
}

fn log_final_stats(stats: &LoopStats) {
    info!(
        batches_received = stats.batches_received,
        batches_ingested = stats.batches_ingested,
        duplicates = stats.duplicates_dropped,
        resets = stats.resets_detected,
        evicted = stats.clients_evicted,
        diagnostics_sequence = stats.diagnostics_sequence,
        "Final loop statistics"
    );
}

async fn write_snapshot(state: &Arc<RwLock<LiveState>>, path: &PathBuf) -> Result<()> {
    let state = state.read().await;
    let Some(snapshot) = &state.latest_snapshot else {
        warn!("No diagnostics snapshot produced, nothing written");
        return Ok(());
    };
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
    info!(path = %path.display(), "Wrote final diagnostics snapshot");
    Ok(())
}
