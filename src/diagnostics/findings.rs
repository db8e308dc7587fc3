//! Live findings ranked the same way as post-drive findings.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::levels::{ActiveLevel, LocationLevel};
use crate::orders::{MatrixSource, OrderClass};
use crate::strength::StrengthBucket;

/// Confidence step used when ranking; closer confidences tie and fall
/// back to the ranking score.
pub const CONFIDENCE_QUANTUM: f64 = 0.02;

pub const REFERENCE_PREFIX: &str = "REF_";
pub const INFORMATIONAL_PREFIX: &str = "INFO_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Missing reference data (e.g. no speed), not a fault.
    Reference,
    Diagnostic,
    /// Non-order content such as body resonance.
    Informational,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveFinding {
    pub finding_id: String,
    pub kind: FindingKind,
    pub message: String,
    pub source: Option<MatrixSource>,
    pub suspected_source: Option<&'static str>,
    #[serde(rename = "class_key")]
    pub class: Option<OrderClass>,
    pub order_label: Option<&'static str>,
    pub severity: Option<StrengthBucket>,
    pub strength_db: Option<f64>,
    pub peak_hz: Option<f64>,
    pub sensor_label: Option<String>,
    pub sensor_location: Option<String>,
    #[serde(rename = "confidence_0_to_1")]
    pub confidence: f64,
    pub ranking_score: f64,
}

impl LiveFinding {
    fn reference(id: &str, message: &str) -> Self {
        Self {
            finding_id: format!("{REFERENCE_PREFIX}{id}"),
            kind: FindingKind::Reference,
            message: message.to_string(),
            source: None,
            suspected_source: None,
            class: None,
            order_label: None,
            severity: None,
            strength_db: None,
            peak_hz: None,
            sensor_label: None,
            sensor_location: None,
            confidence: 1.0,
            ranking_score: 0.0,
        }
    }

    pub fn is_ranked(&self) -> bool {
        !self.finding_id.starts_with(REFERENCE_PREFIX) && !self.finding_id.starts_with(INFORMATIONAL_PREFIX)
    }
}

fn quantised_confidence(confidence: f64) -> f64 {
    let confidence = if confidence.is_finite() { confidence } else { 0.0 };
    (confidence / CONFIDENCE_QUANTUM).round() * CONFIDENCE_QUANTUM
}

/// Descending order on `(quantised confidence, ranking score)`.
pub fn compare_findings(a: &LiveFinding, b: &LiveFinding) -> Ordering {
    let score = |f: &LiveFinding| if f.ranking_score.is_finite() { f.ranking_score } else { 0.0 };
    quantised_confidence(b.confidence)
        .total_cmp(&quantised_confidence(a.confidence))
        .then_with(|| score(b).total_cmp(&score(a)))
}

/// Confidence from band height plus location agreement, capped at 1.
fn level_confidence(level: &ActiveLevel, by_location: &BTreeMap<String, LocationLevel>) -> f64 {
    let band = 0.3 + 0.1 * level.bucket.rank() as f64;
    let agreement = by_location
        .values()
        .filter(|loc| loc.class == level.class && loc.bucket == level.bucket)
        .map(|loc| loc.agreement_count)
        .max()
        .unwrap_or(1);
    (band + 0.1 * agreement.saturating_sub(1) as f64).min(1.0)
}

/// Findings for the current active levels.
///
/// Reference findings come first, then diagnostic findings (ids `F001`...)
/// and informational ones, each group ranked with [`compare_findings`].
pub fn build_live_findings(
    by_source: &BTreeMap<MatrixSource, ActiveLevel>,
    by_location: &BTreeMap<String, LocationLevel>,
    speed_known: bool,
) -> Vec<LiveFinding> {
    let mut references = Vec::new();
    if !speed_known {
        references.push(LiveFinding::reference(
            "SPEED",
            "Vehicle speed unavailable; order matching disabled",
        ));
    }

    let mut diagnostic = Vec::new();
    let mut informational = Vec::new();
    for (source, level) in by_source {
        let finding = LiveFinding {
            finding_id: String::new(),
            kind: FindingKind::Diagnostic,
            message: format!(
                "{} vibration at {:.1} Hz ({})",
                level.class.suspected_source(),
                level.peak_hz,
                level.bucket
            ),
            source: Some(*source),
            suspected_source: Some(level.class.suspected_source()),
            class: Some(level.class),
            order_label: level.class.order_label(),
            severity: Some(level.bucket),
            strength_db: Some(level.strength_db),
            peak_hz: Some(level.peak_hz),
            sensor_label: Some(level.sensor_label.clone()),
            sensor_location: Some(level.sensor_location.clone()).filter(|l| !l.is_empty()),
            confidence: level_confidence(level, by_location),
            ranking_score: level.strength_db,
        };
        if level.class.is_order() {
            diagnostic.push(finding);
        } else {
            informational.push(LiveFinding {
                finding_id: format!("{INFORMATIONAL_PREFIX}{}", level.class.key().to_uppercase()),
                kind: FindingKind::Informational,
                ..finding
            });
        }
    }

    diagnostic.sort_by(compare_findings);
    informational.sort_by(compare_findings);
    for (i, finding) in diagnostic.iter_mut().enumerate() {
        finding.finding_id = format!("F{:03}", i + 1);
    }

    references.into_iter().chain(diagnostic).chain(informational).collect()
}

/// First ranked finding, else the first finding of any kind.
pub fn select_top_finding(findings: &[LiveFinding]) -> Option<&LiveFinding> {
    findings.iter().find(|f| f.is_ranked()).or_else(|| findings.first())
}
