//! Vehicle Order Classifier
//!
//! Derives the rotational-order frequencies of the wheel, driveshaft and
//! engine from road speed and car geometry, and matches spectral peaks
//! against their 1× and 2× multiples.
//!
//! ## Architecture
//!
//! ```text
//! speed (m/s) + AnalysisSettings
//!        │
//!        ▼
//! vehicle_orders_hz()  ──►  VehicleOrders { wheel, drive, engine, uncertainties }
//!        │
//!        ▼
//! classify_peak_hz()   ──►  PeakClassification { class, suspected_source, ... }
//! ```
//!
//! Orders are recomputed on every call and never cached across speed changes.

mod settings;

pub use settings::AnalysisSettings;

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Second-harmonic multiplier.
pub const HARMONIC_2X: f64 = 2.0;

/// Lower bound of the body/road resonance band (Hz).
pub const ROAD_RESONANCE_MIN_HZ: f64 = 0.5;

/// Upper bound of the body/road resonance band (Hz).
pub const ROAD_RESONANCE_MAX_HZ: f64 = 12.0;

/// Minimum relative distance under which two orders are treated as one.
pub const MIN_OVERLAP_TOLERANCE: f64 = 0.03;

/// Guard against division by a zero reference frequency.
pub const FREQUENCY_EPSILON_HZ: f64 = 1e-6;

/// Candidate orders at or below this frequency are ignored.
const MIN_CANDIDATE_HZ: f64 = 0.2;

/// Lower bound on the relative half-width cap.
const MIN_HALF_WIDTH_REL: f64 = 0.005;

// ============================================================================
// Classes and sources
// ============================================================================

/// Peak classification relative to vehicle orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderClass {
    #[serde(rename = "wheel1")]
    Wheel1,
    #[serde(rename = "wheel2")]
    Wheel2,
    #[serde(rename = "wheel2_eng1")]
    Wheel2Eng1,
    #[serde(rename = "shaft1")]
    Shaft1,
    #[serde(rename = "shaft_eng1")]
    ShaftEng1,
    #[serde(rename = "eng1")]
    Eng1,
    #[serde(rename = "eng2")]
    Eng2,
    #[serde(rename = "road")]
    Road,
    #[serde(rename = "other")]
    Other,
}

impl OrderClass {
    pub const fn key(self) -> &'static str {
        match self {
            Self::Wheel1 => "wheel1",
            Self::Wheel2 => "wheel2",
            Self::Wheel2Eng1 => "wheel2_eng1",
            Self::Shaft1 => "shaft1",
            Self::ShaftEng1 => "shaft_eng1",
            Self::Eng1 => "eng1",
            Self::Eng2 => "eng2",
            Self::Road => "road",
            Self::Other => "other",
        }
    }

    /// Human-readable order label, `None` for non-order classes.
    pub const fn order_label(self) -> Option<&'static str> {
        match self {
            Self::Wheel1 => Some("1x wheel order"),
            Self::Wheel2 => Some("2x wheel order"),
            Self::Wheel2Eng1 => Some("2x wheel / 1x engine order"),
            Self::ShaftEng1 => Some("1x driveshaft/engine order"),
            Self::Shaft1 => Some("1x driveshaft order"),
            Self::Eng1 => Some("1x engine order"),
            Self::Eng2 => Some("2x engine order"),
            Self::Road | Self::Other => None,
        }
    }

    pub const fn suspected_source(self) -> &'static str {
        match self {
            Self::Wheel1 | Self::Wheel2 | Self::Wheel2Eng1 => "wheel/tire",
            Self::Shaft1 | Self::ShaftEng1 => "driveline",
            Self::Eng1 | Self::Eng2 => "engine",
            Self::Road => "body resonance",
            Self::Other => "unknown",
        }
    }

    /// Dwell-matrix sources this class contributes to.
    pub const fn sources(self) -> &'static [MatrixSource] {
        match self {
            Self::Wheel2Eng1 => &[MatrixSource::Wheel, MatrixSource::Engine],
            Self::ShaftEng1 => &[MatrixSource::Driveshaft, MatrixSource::Engine],
            Self::Eng1 | Self::Eng2 => &[MatrixSource::Engine],
            Self::Shaft1 => &[MatrixSource::Driveshaft],
            Self::Wheel1 | Self::Wheel2 => &[MatrixSource::Wheel],
            Self::Road | Self::Other => &[MatrixSource::Other],
        }
    }

    /// True when the peak matched a rotational order.
    pub const fn is_order(self) -> bool {
        !matches!(self, Self::Road | Self::Other)
    }
}

impl fmt::Display for OrderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Source rows of the dwell matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixSource {
    Engine,
    Driveshaft,
    Wheel,
    Other,
}

impl MatrixSource {
    pub const ALL: [Self; 4] = [Self::Engine, Self::Driveshaft, Self::Wheel, Self::Other];

    pub const fn key(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Driveshaft => "driveshaft",
            Self::Wheel => "wheel",
            Self::Other => "other",
        }
    }
}

// ============================================================================
// Order frequencies
// ============================================================================

/// Order frequencies and their relative (fractional) uncertainties.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VehicleOrders {
    pub wheel_hz: f64,
    pub drive_hz: f64,
    pub engine_hz: f64,
    pub wheel_uncertainty: f64,
    pub drive_uncertainty: f64,
    pub engine_uncertainty: f64,
}

/// Root-sum-square of the positive parts.
pub fn combined_relative_uncertainty(parts: &[f64]) -> f64 {
    parts
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| p * p)
        .sum::<f64>()
        .sqrt()
}

/// Wheel, driveshaft and engine frequencies for a road speed.
///
/// Returns `None` for a missing, non-finite or non-positive speed and for
/// settings that do not describe a physical drivetrain.
pub fn vehicle_orders_hz(speed_mps: Option<f64>, settings: &AnalysisSettings) -> Option<VehicleOrders> {
    let speed = speed_mps.filter(|s| s.is_finite() && *s > 0.0)?;
    let circumference = settings.tire_circumference_m()?;
    let final_drive = settings.final_drive_ratio;
    let gear = settings.current_gear_ratio;
    if !(final_drive.is_finite() && final_drive > 0.0 && gear.is_finite() && gear > 0.0) {
        return None;
    }

    let wheel_hz = speed / circumference;
    let drive_hz = wheel_hz * final_drive;
    let engine_hz = drive_hz * gear;
    if ![wheel_hz, drive_hz, engine_hz].iter().all(|v| v.is_finite() && *v > 0.0) {
        return None;
    }

    let pct = |v: f64| v.max(0.0) / 100.0;
    let wheel_uncertainty = combined_relative_uncertainty(&[
        pct(settings.speed_uncertainty_pct),
        pct(settings.tire_diameter_uncertainty_pct),
    ]);
    let drive_uncertainty =
        combined_relative_uncertainty(&[wheel_uncertainty, pct(settings.final_drive_uncertainty_pct)]);
    let engine_uncertainty =
        combined_relative_uncertainty(&[drive_uncertainty, pct(settings.gear_uncertainty_pct)]);

    Some(VehicleOrders {
        wheel_hz,
        drive_hz,
        engine_hz,
        wheel_uncertainty,
        drive_uncertainty,
        engine_uncertainty,
    })
}

/// Relative half-width of the match band around an order.
///
/// The bandwidth/uncertainty term is floored by `min_abs_band_hz` converted
/// to a relative bound and capped at `max_band_half_width_pct`.
pub fn tolerance_for_order(
    base_bandwidth_pct: f64,
    order_hz: f64,
    uncertainty: f64,
    min_abs_band_hz: f64,
    max_band_half_width_pct: f64,
) -> f64 {
    if order_hz <= 0.0 {
        return 0.0;
    }
    let base_half_rel = base_bandwidth_pct.max(0.0) / 200.0;
    let abs_floor = min_abs_band_hz.max(0.0) / order_hz.max(1.0);
    let max_half_rel = MIN_HALF_WIDTH_REL.max(max_band_half_width_pct / 100.0);
    let combined = base_half_rel.hypot(uncertainty);
    max_half_rel.min(combined.max(abs_floor))
}

// ============================================================================
// Classification
// ============================================================================

/// Outcome of matching one peak frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakClassification {
    pub class: OrderClass,
    pub suspected_source: &'static str,
    pub order_label: Option<&'static str>,
    pub matched_hz: Option<f64>,
    pub rel_error: Option<f64>,
    pub tolerance: Option<f64>,
}

impl PeakClassification {
    fn unmatched(class: OrderClass) -> Self {
        Self {
            class,
            suspected_source: class.suspected_source(),
            order_label: None,
            matched_hz: None,
            rel_error: None,
            tolerance: None,
        }
    }
}

struct Candidate {
    hz: f64,
    tol: f64,
    class: OrderClass,
}

fn order_candidates(orders: &VehicleOrders, settings: &AnalysisSettings) -> Vec<Candidate> {
    let tol = |bandwidth: f64, hz: f64, unc: f64| {
        tolerance_for_order(
            bandwidth,
            hz,
            unc,
            settings.min_abs_band_hz,
            settings.max_band_half_width_pct,
        )
    };
    let wheel_tol = tol(settings.wheel_bandwidth_pct, orders.wheel_hz, orders.wheel_uncertainty);
    let drive_tol = tol(settings.driveshaft_bandwidth_pct, orders.drive_hz, orders.drive_uncertainty);
    let engine_tol = tol(settings.engine_bandwidth_pct, orders.engine_hz, orders.engine_uncertainty);
    let engine_ref = orders.engine_hz.max(FREQUENCY_EPSILON_HZ);

    let mut candidates = vec![Candidate {
        hz: orders.wheel_hz,
        tol: wheel_tol,
        class: OrderClass::Wheel1,
    }];

    // 2× wheel landing on 1× engine is reported as one shared class.
    let wheel_2x = orders.wheel_hz * HARMONIC_2X;
    let wheel2_overlap =
        MIN_OVERLAP_TOLERANCE.max(orders.wheel_uncertainty + orders.engine_uncertainty);
    if (wheel_2x - orders.engine_hz).abs() / engine_ref < wheel2_overlap {
        candidates.push(Candidate {
            hz: wheel_2x,
            tol: wheel_tol.max(engine_tol),
            class: OrderClass::Wheel2Eng1,
        });
    } else {
        candidates.push(Candidate {
            hz: wheel_2x,
            tol: wheel_tol,
            class: OrderClass::Wheel2,
        });
    }

    let shaft_overlap =
        MIN_OVERLAP_TOLERANCE.max(orders.drive_uncertainty + orders.engine_uncertainty);
    if (orders.drive_hz - orders.engine_hz).abs() / engine_ref < shaft_overlap {
        candidates.push(Candidate {
            hz: orders.drive_hz,
            tol: drive_tol.max(engine_tol),
            class: OrderClass::ShaftEng1,
        });
    } else {
        candidates.push(Candidate {
            hz: orders.drive_hz,
            tol: drive_tol,
            class: OrderClass::Shaft1,
        });
        candidates.push(Candidate {
            hz: orders.engine_hz,
            tol: engine_tol,
            class: OrderClass::Eng1,
        });
    }

    candidates.push(Candidate {
        hz: orders.engine_hz * HARMONIC_2X,
        tol: engine_tol,
        class: OrderClass::Eng2,
    });
    candidates
}

/// Classify a peak frequency against the vehicle orders at `speed_mps`.
///
/// The nearest in-tolerance order wins; on an exact tie the earlier
/// candidate (wheel, then driveshaft/engine, then engine) is kept. Peaks
/// matching no order fall back to `road` inside the resonance band and
/// `other` elsewhere. An invalid speed skips order matching entirely.
pub fn classify_peak_hz(
    peak_hz: f64,
    speed_mps: Option<f64>,
    settings: &AnalysisSettings,
) -> PeakClassification {
    if let Some(orders) = vehicle_orders_hz(speed_mps, settings) {
        let mut best: Option<(Candidate, f64)> = None;
        for candidate in order_candidates(&orders, settings) {
            if candidate.hz <= MIN_CANDIDATE_HZ {
                continue;
            }
            let rel_err = (peak_hz - candidate.hz).abs() / candidate.hz;
            let better = best.as_ref().map_or(true, |(_, err)| rel_err < *err);
            if rel_err <= candidate.tol && better {
                best = Some((candidate, rel_err));
            }
        }
        if let Some((candidate, rel_err)) = best {
            return PeakClassification {
                class: candidate.class,
                suspected_source: candidate.class.suspected_source(),
                order_label: candidate.class.order_label(),
                matched_hz: Some(candidate.hz),
                rel_error: Some(rel_err),
                tolerance: Some(candidate.tol),
            };
        }
    }

    if (ROAD_RESONANCE_MIN_HZ..=ROAD_RESONANCE_MAX_HZ).contains(&peak_hz) {
        PeakClassification::unmatched(OrderClass::Road)
    } else {
        PeakClassification::unmatched(OrderClass::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> AnalysisSettings {
        AnalysisSettings::default()
    }

    #[test]
    fn test_orders_from_speed() {
        let settings = defaults();
        let orders = vehicle_orders_hz(Some(30.0), &settings).expect("valid speed");
        let circumference = settings.tire_circumference_m().expect("circumference");
        assert!((orders.wheel_hz - 30.0 / circumference).abs() < 1e-9);
        assert!((orders.drive_hz - orders.wheel_hz * 3.08).abs() < 1e-9);
        assert!((orders.engine_hz - orders.drive_hz * 0.64).abs() < 1e-9);
        let expected_wheel_unc = (0.006f64).hypot(0.012);
        assert!((orders.wheel_uncertainty - expected_wheel_unc).abs() < 1e-12);
    }

    #[test]
    fn test_orders_reject_invalid_speed() {
        let settings = defaults();
        assert!(vehicle_orders_hz(None, &settings).is_none());
        assert!(vehicle_orders_hz(Some(0.0), &settings).is_none());
        assert!(vehicle_orders_hz(Some(-4.0), &settings).is_none());
        assert!(vehicle_orders_hz(Some(f64::NAN), &settings).is_none());
        assert!(vehicle_orders_hz(Some(f64::INFINITY), &settings).is_none());
    }

    #[test]
    fn test_deflection_factor_raises_wheel_hz() {
        let rigid = defaults();
        let deflected = AnalysisSettings {
            tire_deflection_factor: 0.97,
            ..defaults()
        };
        let a = vehicle_orders_hz(Some(30.0), &rigid).expect("orders");
        let b = vehicle_orders_hz(Some(30.0), &deflected).expect("orders");
        assert!((b.wheel_hz / a.wheel_hz - 1.0 / 0.97).abs() < 1e-9);
    }

    #[test]
    fn test_tolerance_bounds() {
        // Narrow bandwidth at a low order hits the absolute floor.
        let tol = tolerance_for_order(1.0, 2.0, 0.0, 0.4, 50.0);
        assert!((tol - 0.2).abs() < 1e-12);
        // Wide bandwidth is capped at the half-width limit.
        let tol = tolerance_for_order(100.0, 50.0, 0.1, 0.4, 8.0);
        assert!((tol - 0.08).abs() < 1e-12);
        assert!(tolerance_for_order(6.0, 0.0, 0.0, 0.4, 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_classify_near_wheel_order() {
        let settings = defaults();
        let orders = vehicle_orders_hz(Some(30.0), &settings).expect("orders");
        let result = classify_peak_hz(orders.wheel_hz * 1.02, Some(30.0), &settings);
        assert_eq!(result.class, OrderClass::Wheel1);
        assert_eq!(result.suspected_source, "wheel/tire");
        assert_eq!(result.order_label, Some("1x wheel order"));
        assert!(result.rel_error.expect("matched") <= result.tolerance.expect("matched"));
    }

    #[test]
    fn test_classify_road_and_other() {
        let settings = defaults();
        let road = classify_peak_hz(1.5, Some(30.0), &settings);
        assert_eq!(road.class, OrderClass::Road);
        assert_eq!(road.suspected_source, "body resonance");
        let low = classify_peak_hz(0.4, Some(30.0), &settings);
        assert_eq!(low.class, OrderClass::Other);
        assert_eq!(low.suspected_source, "unknown");
    }

    #[test]
    fn test_classify_without_speed_falls_back() {
        let settings = defaults();
        assert_eq!(classify_peak_hz(5.0, None, &settings).class, OrderClass::Road);
        assert_eq!(classify_peak_hz(60.0, Some(f64::NAN), &settings).class, OrderClass::Other);
    }

    #[test]
    fn test_classify_engine_orders() {
        let settings = defaults();
        let orders = vehicle_orders_hz(Some(30.0), &settings).expect("orders");
        let eng = classify_peak_hz(orders.engine_hz, Some(30.0), &settings);
        assert!(matches!(eng.class, OrderClass::Eng1 | OrderClass::ShaftEng1 | OrderClass::Wheel2Eng1));
        let eng2 = classify_peak_hz(orders.engine_hz * 2.0, Some(30.0), &settings);
        assert_eq!(eng2.class, OrderClass::Eng2);
        assert_eq!(eng2.suspected_source, "engine");
    }

    #[test]
    fn test_overlapping_shaft_and_engine_merge() {
        let settings = AnalysisSettings {
            current_gear_ratio: 1.0,
            ..defaults()
        };
        let orders = vehicle_orders_hz(Some(25.0), &settings).expect("orders");
        let result = classify_peak_hz(orders.drive_hz, Some(25.0), &settings);
        assert_eq!(result.class, OrderClass::ShaftEng1);
        assert_eq!(result.class.sources(), &[MatrixSource::Driveshaft, MatrixSource::Engine]);
    }

    #[test]
    fn test_class_keys_serialize() {
        let json = serde_json::to_string(&OrderClass::Wheel2Eng1).expect("serialize");
        assert_eq!(json, "\"wheel2_eng1\"");
        assert_eq!(OrderClass::ShaftEng1.key(), "shaft_eng1");
    }
}
