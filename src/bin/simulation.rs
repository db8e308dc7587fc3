//! Vehicle Vibration Simulation
//!
//! Generates accelerometer sample batches for four wheel-corner sensors as
//! JSON lines, optionally with a rotating-order fault:
//! - wheel imbalance (1× wheel order)
//! - driveshaft imbalance (1× driveshaft order)
//! - engine (1× engine order)
//!
//! # Usage
//! ```bash
//! ./simulation --fault wheel --speed-kmh 90 --seconds 30 | ./vibesensor --stdin
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufWriter, Write};
use std::time::Duration;

use vibesensor::config::PipelineConfig;
use vibesensor::simulate::{Fault, SimulatedSensor, SimulationConfig, VehicleSimulator};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vibesensor-simulation")]
#[command(about = "Accelerometer batch simulation for VibeSensor testing")]
#[command(version = "1.0")]
struct Args {
    /// Injected fault: none, wheel, driveshaft or engine
    #[arg(short, long, default_value = "none")]
    fault: Fault,

    /// Constant vehicle speed in km/h
    #[arg(long, default_value = "80")]
    speed_kmh: f64,

    /// Simulated duration in seconds
    #[arg(short, long, default_value = "10")]
    seconds: f64,

    /// Sensor sample rate in Hz
    #[arg(long, default_value = "800")]
    sample_rate: u32,

    /// Samples per batch
    #[arg(long, default_value = "200")]
    batch_samples: usize,

    /// Number of sensors (1-4, wheel corners in FL, FR, RL, RR order)
    #[arg(long, default_value = "4", value_parser = clap::value_parser!(u32).range(1..=4))]
    sensors: u32,

    /// Sensor index nearest the fault
    #[arg(long, default_value = "0")]
    fault_sensor: usize,

    /// Emit in real time instead of as fast as possible
    #[arg(long)]
    realtime: bool,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Suppress the run summary on stderr
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // car settings come from the same config the pipeline reads
    let settings = PipelineConfig::load().vehicle;
    let mut sensors = SimulatedSensor::four_corners();
    sensors.truncate(args.sensors as usize);

    let config = SimulationConfig {
        sensors,
        speed_kmh: args.speed_kmh,
        seconds: args.seconds,
        sample_rate_hz: args.sample_rate,
        batch_samples: args.batch_samples,
        fault: args.fault,
        fault_sensor: args.fault_sensor,
        seed: args.seed,
        ..SimulationConfig::default()
    };
    let simulator = VehicleSimulator::new(config, &settings).context("Invalid simulation parameters")?;

    if !args.quiet {
        eprintln!("{}", "=".repeat(60));
        eprintln!("VIBESENSOR SIMULATION");
        eprintln!("  Speed: {:.1} km/h for {:.1} s", args.speed_kmh, args.seconds);
        eprintln!("  Sensors: {} at {} Hz, {} samples/batch", args.sensors, args.sample_rate, args.batch_samples);
        match simulator.fault_hz() {
            Some(hz) => eprintln!("  Fault: {} at {:.2} Hz on sensor {}", args.fault, hz, args.fault_sensor),
            None => eprintln!("  Fault: none"),
        }
        if let Some(seed) = args.seed {
            eprintln!("  Random seed: {seed}");
        }
        eprintln!("  Batches: {}", simulator.total_batches());
        eprintln!("{}", "=".repeat(60));
    }

    let round = Duration::from_millis(simulator.batch_period_ms());
    let per_round = simulator.sensor_count();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (i, batch) in simulator.enumerate() {
        serde_json::to_writer(&mut out, &batch)?;
        out.write_all(b"\n")?;
        if args.realtime && (i + 1) % per_round == 0 {
            out.flush()?;
            std::thread::sleep(round);
        }
    }
    out.flush()?;
    Ok(())
}
