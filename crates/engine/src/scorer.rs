//! Trust score computation.
//!
//! Starts at the base score and subtracts a fixed penalty per anomaly flag
//! by severity, clamped to [0, 100]. Deterministic and explainable: the
//! score depends on feature values only through the flags.

use common::types::Severity;

use crate::anomaly::AnomalyResult;

pub const BASE_SCORE: f64 = 100.0;
pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

/// Deduction per anomaly severity.
pub fn severity_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 25.0,
        Severity::High => 15.0,
        Severity::Medium => 8.0,
        Severity::Low => 3.0,
    }
}

/// Compute a trust score (0–100) from anomaly flags.
pub fn compute_trust_score(anomaly_result: &AnomalyResult) -> f64 {
    let mut score = BASE_SCORE;
    for flag in &anomaly_result.flags {
        score -= severity_penalty(flag.severity);
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}
