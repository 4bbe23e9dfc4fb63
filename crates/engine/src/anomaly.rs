//! Rule-based anomaly detection for wallet behavior.
//!
//! Flags burst transactions, suspicious velocity, and fresh-wallet high
//! value. Fully explainable: each flag has a rule name, severity, and a
//! details map with the thresholds and observed values that justified it.
//! No ML; thresholds come from config.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use common::types::Severity;

use crate::features::FeatureVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    BurstTransactions,
    SuspiciousVelocity,
    FreshWalletHighValue,
}

impl AnomalyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BurstTransactions => "burst_transactions",
            Self::SuspiciousVelocity => "suspicious_velocity",
            Self::FreshWalletHighValue => "fresh_wallet_high_value",
        }
    }
}

/// Single explainable anomaly flag. Serialized verbatim into score metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFlag {
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub severity: Severity,
    /// Human-readable explanation of why this was flagged.
    pub message: String,
    /// Rule identifier for logging and tuning.
    pub rule_name: String,
    /// Thresholds and observed values; for auditing and explainability.
    pub details: serde_json::Value,
}

/// Result of rule-based anomaly detection for one wallet.
#[derive(Debug, Clone)]
pub struct AnomalyResult {
    pub wallet: String,
    pub flags: Vec<AnomalyFlag>,
    pub is_anomalous: bool,
}

impl AnomalyResult {
    pub fn max_severity(&self) -> Option<Severity> {
        self.flags.iter().map(|f| f.severity).max()
    }

    pub fn flags_json(&self) -> Vec<serde_json::Value> {
        self.flags
            .iter()
            .filter_map(|f| serde_json::to_value(f).ok())
            .collect()
    }
}

/// Configurable thresholds for anomaly rules. SOL or counts per day.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub burst_critical_per_day: f64,
    pub burst_high_per_day: f64,
    pub burst_medium_per_day: f64,

    pub velocity_critical_sol_per_day: f64,
    pub velocity_high_sol_per_day: f64,
    pub velocity_medium_sol_per_day: f64,

    /// Max tx count to consider a wallet "fresh".
    pub fresh_wallet_max_tx_count: u32,
    /// Min SOL (total or avg per tx) to flag at all when fresh.
    pub fresh_wallet_min_sol: f64,
    pub fresh_wallet_high_sol: f64,
    pub fresh_wallet_critical_sol: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            burst_critical_per_day: 100.0,
            burst_high_per_day: 50.0,
            burst_medium_per_day: 20.0,
            velocity_critical_sol_per_day: 500.0,
            velocity_high_sol_per_day: 200.0,
            velocity_medium_sol_per_day: 50.0,
            fresh_wallet_max_tx_count: 5,
            fresh_wallet_min_sol: 10.0,
            fresh_wallet_high_sol: 50.0,
            fresh_wallet_critical_sol: 100.0,
        }
    }
}

fn check_burst(features: &FeatureVector, config: &AnomalyConfig) -> Option<AnomalyFlag> {
    let freq = features.tx_frequency?;
    if features.tx_count < 2 {
        return None;
    }
    let (severity, threshold) = if freq >= config.burst_critical_per_day {
        (Severity::Critical, config.burst_critical_per_day)
    } else if freq >= config.burst_high_per_day {
        (Severity::High, config.burst_high_per_day)
    } else if freq >= config.burst_medium_per_day {
        (Severity::Medium, config.burst_medium_per_day)
    } else {
        return None;
    };
    Some(AnomalyFlag {
        kind: AnomalyType::BurstTransactions,
        severity,
        message: format!(
            "Burst activity: {freq:.1} transactions per day (threshold: {threshold})"
        ),
        rule_name: "burst_tx_frequency_per_day".to_string(),
        details: json!({
            "tx_frequency_per_day": freq,
            "threshold": threshold,
            "tx_count": features.tx_count,
            "time_span_days": features.time_span_days,
        }),
    })
}

fn check_suspicious_velocity(
    features: &FeatureVector,
    config: &AnomalyConfig,
) -> Option<AnomalyFlag> {
    let vel = features.velocity_sol_per_day?;
    let (severity, threshold) = if vel >= config.velocity_critical_sol_per_day {
        (Severity::Critical, config.velocity_critical_sol_per_day)
    } else if vel >= config.velocity_high_sol_per_day {
        (Severity::High, config.velocity_high_sol_per_day)
    } else if vel >= config.velocity_medium_sol_per_day {
        (Severity::Medium, config.velocity_medium_sol_per_day)
    } else {
        return None;
    };
    Some(AnomalyFlag {
        kind: AnomalyType::SuspiciousVelocity,
        severity,
        message: format!(
            "Suspicious velocity: {vel:.2} SOL/day (threshold: {threshold} SOL/day)"
        ),
        rule_name: "suspicious_velocity_sol_per_day".to_string(),
        details: json!({
            "velocity_sol_per_day": vel,
            "threshold": threshold,
            "total_volume_sol": features.total_volume_sol,
            "time_span_days": features.time_span_days,
        }),
    })
}

fn check_fresh_wallet_high_value(
    features: &FeatureVector,
    config: &AnomalyConfig,
) -> Option<AnomalyFlag> {
    if features.tx_count == 0 || features.tx_count > config.fresh_wallet_max_tx_count {
        return None;
    }
    let value_sol = features
        .total_volume_sol
        .max(features.avg_transaction_value_sol);
    if value_sol < config.fresh_wallet_min_sol {
        return None;
    }
    let (severity, threshold) = if value_sol >= config.fresh_wallet_critical_sol {
        (Severity::Critical, config.fresh_wallet_critical_sol)
    } else if value_sol >= config.fresh_wallet_high_sol {
        (Severity::High, config.fresh_wallet_high_sol)
    } else {
        (Severity::Medium, config.fresh_wallet_min_sol)
    };
    Some(AnomalyFlag {
        kind: AnomalyType::FreshWalletHighValue,
        severity,
        message: format!(
            "Fresh wallet ({} txs) moving high value: {value_sol:.2} SOL (threshold: {threshold} SOL)",
            features.tx_count
        ),
        rule_name: "fresh_wallet_high_value".to_string(),
        details: json!({
            "tx_count": features.tx_count,
            "total_volume_sol": features.total_volume_sol,
            "avg_transaction_value_sol": features.avg_transaction_value_sol,
            "value_used_sol": value_sol,
            "fresh_wallet_max_tx_count": config.fresh_wallet_max_tx_count,
            "threshold": threshold,
        }),
    })
}

type Rule = fn(&FeatureVector, &AnomalyConfig) -> Option<AnomalyFlag>;

const RULES: [(&str, Rule); 3] = [
    ("burst_tx_frequency_per_day", check_burst),
    ("suspicious_velocity_sol_per_day", check_suspicious_velocity),
    ("fresh_wallet_high_value", check_fresh_wallet_high_value),
];

/// Run all anomaly rules on a feature vector.
///
/// Rules are independent: at most one flag per rule per run, and a rule
/// that panics is logged and skipped — the analysis never fails because of
/// one rule.
pub fn detect_anomalies(features: &FeatureVector, config: &AnomalyConfig) -> AnomalyResult {
    let mut flags = Vec::new();
    for (name, rule) in RULES {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            rule(features, config)
        }));
        match outcome {
            Ok(Some(flag)) => flags.push(flag),
            Ok(None) => {}
            Err(_) => {
                warn!(rule = name, wallet = %features.wallet, "anomaly rule panicked; skipped");
            }
        }
    }
    AnomalyResult {
        wallet: features.wallet.clone(),
        is_anomalous: !flags.is_empty(),
        flags,
    }
}
