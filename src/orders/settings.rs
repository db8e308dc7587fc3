//! Car geometry and order-band analysis settings.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info};

fn default_tire_width_mm() -> f64 {
    285.0
}
fn default_tire_aspect_pct() -> f64 {
    30.0
}
fn default_rim_in() -> f64 {
    21.0
}
fn default_final_drive_ratio() -> f64 {
    3.08
}
fn default_current_gear_ratio() -> f64 {
    0.64
}
fn default_tire_deflection_factor() -> f64 {
    1.0
}
fn default_wheel_bandwidth_pct() -> f64 {
    6.0
}
fn default_driveshaft_bandwidth_pct() -> f64 {
    5.6
}
fn default_engine_bandwidth_pct() -> f64 {
    6.2
}
fn default_speed_uncertainty_pct() -> f64 {
    0.6
}
fn default_tire_diameter_uncertainty_pct() -> f64 {
    1.2
}
fn default_final_drive_uncertainty_pct() -> f64 {
    0.2
}
fn default_gear_uncertainty_pct() -> f64 {
    0.5
}
fn default_min_abs_band_hz() -> f64 {
    0.4
}
fn default_max_band_half_width_pct() -> f64 {
    8.0
}

/// Vehicle geometry plus the tolerances used to match peaks to orders.
///
/// Percentages are expressed as percent (6.0 = 6 %).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default = "default_tire_width_mm")]
    pub tire_width_mm: f64,
    #[serde(default = "default_tire_aspect_pct")]
    pub tire_aspect_pct: f64,
    #[serde(default = "default_rim_in")]
    pub rim_in: f64,
    #[serde(default = "default_final_drive_ratio")]
    pub final_drive_ratio: f64,
    #[serde(default = "default_current_gear_ratio")]
    pub current_gear_ratio: f64,
    /// Rolling circumference relative to the unloaded tire (1.0 = no deflection).
    #[serde(default = "default_tire_deflection_factor")]
    pub tire_deflection_factor: f64,
    #[serde(default = "default_wheel_bandwidth_pct")]
    pub wheel_bandwidth_pct: f64,
    #[serde(default = "default_driveshaft_bandwidth_pct")]
    pub driveshaft_bandwidth_pct: f64,
    #[serde(default = "default_engine_bandwidth_pct")]
    pub engine_bandwidth_pct: f64,
    #[serde(default = "default_speed_uncertainty_pct")]
    pub speed_uncertainty_pct: f64,
    #[serde(default = "default_tire_diameter_uncertainty_pct")]
    pub tire_diameter_uncertainty_pct: f64,
    #[serde(default = "default_final_drive_uncertainty_pct")]
    pub final_drive_uncertainty_pct: f64,
    #[serde(default = "default_gear_uncertainty_pct")]
    pub gear_uncertainty_pct: f64,
    #[serde(default = "default_min_abs_band_hz")]
    pub min_abs_band_hz: f64,
    #[serde(default = "default_max_band_half_width_pct")]
    pub max_band_half_width_pct: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            tire_width_mm: default_tire_width_mm(),
            tire_aspect_pct: default_tire_aspect_pct(),
            rim_in: default_rim_in(),
            final_drive_ratio: default_final_drive_ratio(),
            current_gear_ratio: default_current_gear_ratio(),
            tire_deflection_factor: default_tire_deflection_factor(),
            wheel_bandwidth_pct: default_wheel_bandwidth_pct(),
            driveshaft_bandwidth_pct: default_driveshaft_bandwidth_pct(),
            engine_bandwidth_pct: default_engine_bandwidth_pct(),
            speed_uncertainty_pct: default_speed_uncertainty_pct(),
            tire_diameter_uncertainty_pct: default_tire_diameter_uncertainty_pct(),
            final_drive_uncertainty_pct: default_final_drive_uncertainty_pct(),
            gear_uncertainty_pct: default_gear_uncertainty_pct(),
            min_abs_band_hz: default_min_abs_band_hz(),
            max_band_half_width_pct: default_max_band_half_width_pct(),
        }
    }
}

impl AnalysisSettings {
    /// Clamp every field into its physical range and replace non-finite
    /// values with the defaults.
    #[must_use]
    pub fn sanitize(mut self) -> Self {
        let defaults = Self::default();
        let fields: [(&str, &mut f64, f64, f64, f64); 15] = [
            ("tire_width_mm", &mut self.tire_width_mm, defaults.tire_width_mm, 100.0, 500.0),
            ("tire_aspect_pct", &mut self.tire_aspect_pct, defaults.tire_aspect_pct, 10.0, 90.0),
            ("rim_in", &mut self.rim_in, defaults.rim_in, 10.0, 30.0),
            ("final_drive_ratio", &mut self.final_drive_ratio, defaults.final_drive_ratio, 0.1, 20.0),
            ("current_gear_ratio", &mut self.current_gear_ratio, defaults.current_gear_ratio, 0.1, 20.0),
            (
                "tire_deflection_factor",
                &mut self.tire_deflection_factor,
                defaults.tire_deflection_factor,
                0.8,
                1.0,
            ),
            ("wheel_bandwidth_pct", &mut self.wheel_bandwidth_pct, defaults.wheel_bandwidth_pct, 0.1, 100.0),
            (
                "driveshaft_bandwidth_pct",
                &mut self.driveshaft_bandwidth_pct,
                defaults.driveshaft_bandwidth_pct,
                0.1,
                100.0,
            ),
            ("engine_bandwidth_pct", &mut self.engine_bandwidth_pct, defaults.engine_bandwidth_pct, 0.1, 100.0),
            ("speed_uncertainty_pct", &mut self.speed_uncertainty_pct, defaults.speed_uncertainty_pct, 0.0, 100.0),
            (
                "tire_diameter_uncertainty_pct",
                &mut self.tire_diameter_uncertainty_pct,
                defaults.tire_diameter_uncertainty_pct,
                0.0,
                100.0,
            ),
            (
                "final_drive_uncertainty_pct",
                &mut self.final_drive_uncertainty_pct,
                defaults.final_drive_uncertainty_pct,
                0.0,
                100.0,
            ),
            ("gear_uncertainty_pct", &mut self.gear_uncertainty_pct, defaults.gear_uncertainty_pct, 0.0, 100.0),
            ("min_abs_band_hz", &mut self.min_abs_band_hz, defaults.min_abs_band_hz, 0.0, 500.0),
            (
                "max_band_half_width_pct",
                &mut self.max_band_half_width_pct,
                defaults.max_band_half_width_pct,
                0.1,
                100.0,
            ),
        ];
        for (name, value, default, lower, upper) in fields {
            if !value.is_finite() {
                debug!(setting = name, "Replacing non-finite analysis setting with default");
                *value = default;
                continue;
            }
            let bounded = value.clamp(lower, upper);
            if (bounded - *value).abs() > f64::EPSILON {
                info!(setting = name, from = *value, to = bounded, "Clamped analysis setting");
                *value = bounded;
            }
        }
        self
    }

    /// Physical rolling circumference of the tire in metres.
    ///
    /// `None` when the geometry is non-finite or non-positive.
    pub fn tire_circumference_m(&self) -> Option<f64> {
        let (width, aspect, rim) = (self.tire_width_mm, self.tire_aspect_pct, self.rim_in);
        if ![width, aspect, rim].iter().all(|v| v.is_finite() && *v > 0.0) {
            return None;
        }
        let sidewall_mm = width * (aspect / 100.0);
        let diameter_m = 2.0f64.mul_add(sidewall_mm, rim * 25.4) / 1000.0;
        let factor = if self.tire_deflection_factor.is_finite() && self.tire_deflection_factor > 0.0 {
            self.tire_deflection_factor
        } else {
            1.0
        };
        let circumference = diameter_m * PI * factor;
        (circumference.is_finite() && circumference > 0.0).then_some(circumference)
    }
}
