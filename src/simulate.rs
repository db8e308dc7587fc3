//! Synthetic accelerometer data for a car driving at constant speed.
//!
//! Each sensor sees Gaussian road noise. An optional fault adds a sinusoid
//! at the wheel, driveshaft or engine order for the configured speed, at
//! full amplitude on the faulted sensor and attenuated on the others.
//!
//! ```ignore
//! let mut sim = VehicleSimulator::new(SimulationConfig::default(), &settings)?;
//! for batch in sim.by_ref().take(40) {
//!     println!("{}", serde_json::to_string(&batch)?);
//! }
//! ```

use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::orders::{vehicle_orders_hz, AnalysisSettings};
use crate::pipeline::SampleBatch;

/// Share of the fault amplitude seen by sensors away from the fault.
const FAULT_COUPLING: f64 = 0.35;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("simulation needs at least one sensor")]
    NoSensors,
    #[error("invalid sample rate {0} Hz")]
    InvalidSampleRate(u32),
    #[error("batch size must be at least 1 sample")]
    EmptyBatch,
    #[error("invalid noise: {0}")]
    Noise(#[from] rand_distr::NormalError),
    #[error("no {0} order frequency at {1:.1} km/h with these car settings")]
    NoOrderFrequency(Fault, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fault {
    #[default]
    None,
    Wheel,
    Driveshaft,
    Engine,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Wheel => "wheel",
            Self::Driveshaft => "driveshaft",
            Self::Engine => "engine",
        })
    }
}

impl FromStr for Fault {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "wheel" => Ok(Self::Wheel),
            "driveshaft" | "shaft" => Ok(Self::Driveshaft),
            "engine" => Ok(Self::Engine),
            other => Err(format!("unknown fault '{other}' (expected none, wheel, driveshaft or engine)")),
        }
    }
}

/// One simulated sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedSensor {
    pub client_id: String,
    pub name: String,
    pub location: String,
}

impl SimulatedSensor {
    fn corner(id: &str, name: &str, location: &str) -> Self {
        Self {
            client_id: id.to_string(),
            name: name.to_string(),
            location: location.to_string(),
        }
    }

    /// The four wheel-corner sensors of a typical install.
    pub fn four_corners() -> Vec<Self> {
        vec![
            Self::corner("fl", "Front Left", "front_left_wheel"),
            Self::corner("fr", "Front Right", "front_right_wheel"),
            Self::corner("rl", "Rear Left", "rear_left_wheel"),
            Self::corner("rr", "Rear Right", "rear_right_wheel"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub sensors: Vec<SimulatedSensor>,
    pub speed_kmh: f64,
    pub seconds: f64,
    pub sample_rate_hz: u32,
    /// Samples per emitted batch.
    pub batch_samples: usize,
    pub fault: Fault,
    /// Index into `sensors` of the sensor nearest the fault.
    pub fault_sensor: usize,
    pub fault_amp_lsb: f64,
    pub noise_lsb: f64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sensors: SimulatedSensor::four_corners(),
            speed_kmh: 80.0,
            seconds: 10.0,
            sample_rate_hz: 800,
            batch_samples: 200,
            fault: Fault::None,
            fault_sensor: 0,
            fault_amp_lsb: 600.0,
            noise_lsb: 12.0,
            seed: None,
        }
    }
}

/// Iterator of interleaved per-sensor batches, one round per batch period.
pub struct VehicleSimulator {
    config: SimulationConfig,
    fault_hz: Option<f64>,
    rng: StdRng,
    noise: Normal<f64>,
    round: u64,
    rounds: u64,
    next_sensor: usize,
}

impl VehicleSimulator {
    pub fn new(config: SimulationConfig, settings: &AnalysisSettings) -> Result<Self, SimulationError> {
        if config.sensors.is_empty() {
            return Err(SimulationError::NoSensors);
        }
        if config.sample_rate_hz == 0 {
            return Err(SimulationError::InvalidSampleRate(config.sample_rate_hz));
        }
        if config.batch_samples == 0 {
            return Err(SimulationError::EmptyBatch);
        }
        let noise = Normal::new(0.0, config.noise_lsb.max(0.0))?;

        let orders = vehicle_orders_hz(Some(config.speed_kmh / 3.6), settings);
        let fault_hz = match config.fault {
            Fault::None => None,
            fault => {
                let hz = orders.map(|o| match fault {
                    Fault::Wheel => o.wheel_hz,
                    Fault::Driveshaft => o.drive_hz,
                    Fault::Engine | Fault::None => o.engine_hz,
                });
                Some(hz.ok_or(SimulationError::NoOrderFrequency(fault, config.speed_kmh))?)
            }
        };

        let rng = match config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let batch_s = config.batch_samples as f64 / f64::from(config.sample_rate_hz);
        let rounds = (config.seconds.max(0.0) / batch_s).ceil() as u64;
        Ok(Self {
            config,
            fault_hz,
            rng,
            noise,
            round: 0,
            rounds,
            next_sensor: 0,
        })
    }

    /// Frequency of the injected fault, if any.
    pub const fn fault_hz(&self) -> Option<f64> {
        self.fault_hz
    }

    /// Total batches this simulator yields.
    pub fn total_batches(&self) -> u64 {
        self.rounds * self.config.sensors.len() as u64
    }

    pub fn sensor_count(&self) -> usize {
        self.config.sensors.len()
    }

    /// Real time covered by one round of batches, in milliseconds.
    pub fn batch_period_ms(&self) -> u64 {
        (self.config.batch_samples as u64 * 1000) / u64::from(self.config.sample_rate_hz)
    }

    fn batch_for(&mut self, sensor_index: usize) -> SampleBatch {
        let sr = f64::from(self.config.sample_rate_hz);
        let first = self.round * self.config.batch_samples as u64;
        let amp = match self.fault_hz {
            Some(_) if sensor_index == self.config.fault_sensor => self.config.fault_amp_lsb,
            Some(_) => self.config.fault_amp_lsb * FAULT_COUPLING,
            None => 0.0,
        };
        // per-sensor phase so the corners are not perfectly coherent
        let phase = sensor_index as f64 * 0.7;
        let mut samples = Vec::with_capacity(self.config.batch_samples);
        for i in 0..self.config.batch_samples as u64 {
            let t = (first + i) as f64 / sr;
            let tone = self.fault_hz.map_or(0.0, |hz| amp * (2.0 * PI * hz * t + phase).sin());
            let x = tone + self.noise.sample(&mut self.rng);
            let y = 0.6 * tone + self.noise.sample(&mut self.rng);
            // gravity on z, 1 g at 0.5 mg/LSB
            let z = 2048.0 + 0.3 * tone + self.noise.sample(&mut self.rng);
            samples.push([clamp_lsb(x), clamp_lsb(y), clamp_lsb(z)]);
        }

        let sensor = &self.config.sensors[sensor_index];
        let mut batch = SampleBatch::new(sensor.client_id.clone(), samples);
        batch.name = Some(sensor.name.clone());
        batch.location = Some(sensor.location.clone());
        batch.seq = Some(self.round as u32);
        batch.t0_us = Some(first * 1_000_000 / u64::from(self.config.sample_rate_hz));
        batch.sample_rate_hz = Some(self.config.sample_rate_hz);
        batch.speed_mps = Some(self.config.speed_kmh / 3.6);
        batch
    }
}

fn clamp_lsb(v: f64) -> i16 {
    v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

impl Iterator for VehicleSimulator {
    type Item = SampleBatch;

    fn next(&mut self) -> Option<SampleBatch> {
        if self.round >= self.rounds {
            return None;
        }
        let batch = self.batch_for(self.next_sensor);
        self.next_sensor += 1;
        if self.next_sensor == self.config.sensors.len() {
            self.next_sensor = 0;
            self.round += 1;
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(fault: Fault) -> SimulationConfig {
        SimulationConfig {
            fault,
            seconds: 1.0,
            seed: Some(7),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_batches_interleave_sensors_with_sequence() {
        let sim = VehicleSimulator::new(seeded(Fault::None), &AnalysisSettings::default()).expect("simulator");
        assert_eq!(sim.total_batches(), 16);
        assert_eq!(sim.batch_period_ms(), 250);
        let batches: Vec<SampleBatch> = sim.collect();
        assert_eq!(batches.len(), 16);
        assert_eq!(batches[0].client_id, "fl");
        assert_eq!(batches[3].client_id, "rr");
        assert_eq!(batches[4].seq, Some(1));
        assert_eq!(batches[4].t0_us, Some(250_000));
        assert!(batches.iter().all(|b| b.samples.len() == 200));
    }

    #[test]
    fn test_same_seed_is_reproducible() {
        let settings = AnalysisSettings::default();
        let a: Vec<SampleBatch> = VehicleSimulator::new(seeded(Fault::Wheel), &settings).expect("sim").collect();
        let b: Vec<SampleBatch> = VehicleSimulator::new(seeded(Fault::Wheel), &settings).expect("sim").collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fault_uses_order_frequency() {
        let settings = AnalysisSettings::default();
        let sim = VehicleSimulator::new(seeded(Fault::Wheel), &settings).expect("simulator");
        let orders = vehicle_orders_hz(Some(80.0 / 3.6), &settings).expect("orders");
        assert_eq!(sim.fault_hz(), Some(orders.wheel_hz));

        let stopped = SimulationConfig {
            speed_kmh: 0.0,
            ..seeded(Fault::Engine)
        };
        assert!(matches!(
            VehicleSimulator::new(stopped, &settings),
            Err(SimulationError::NoOrderFrequency(Fault::Engine, _))
        ));
        assert_eq!("Shaft".parse::<Fault>(), Ok(Fault::Driveshaft));
        assert!("brakes".parse::<Fault>().is_err());
    }
}
