//! Per-wallet escalation state machine.
//!
//! Alerts and anomalies accumulate points; clean periods decay or reset
//! them. The accumulated score maps to a stage (normal | warning |
//! critical) which is mirrored into the tracked wallet's scheduling tier.

use anyhow::Result;
use rusqlite::Connection;
use serde_json::json;
use tracing::{info, warn};

use common::store::{self, EscalationStateRow};
use common::types::RiskStage;

use crate::anomaly::AnomalyResult;

#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Window of accumulated alerts considered "recent".
    pub window_recent_sec: i64,
    /// Time-cluster window: many alerts inside it escalate faster.
    pub window_cluster_sec: i64,
    /// Clean for this long since the last alert → decay.
    pub window_clean_reduce_sec: i64,
    /// Clean for this long overall → full reset.
    pub window_clean_reset_sec: i64,
    /// Stage bands: score <= normal_max → normal, <= warning_max → warning.
    pub score_normal_max: f64,
    pub score_warning_max: f64,
    pub score_cap: f64,
    pub points_per_flag: f64,
    pub points_repeated: f64,
    pub points_multiple_types: f64,
    pub points_cluster: f64,
    pub decay_per_clean: f64,
    /// Alerts inside the cluster window that count as time-clustered.
    pub cluster_alert_count: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            window_recent_sec: 86_400 * 2,
            window_cluster_sec: 3_600,
            window_clean_reduce_sec: 86_400,
            window_clean_reset_sec: 86_400 * 2,
            score_normal_max: 30.0,
            score_warning_max: 60.0,
            score_cap: 100.0,
            points_per_flag: 6.0,
            points_repeated: 8.0,
            points_multiple_types: 12.0,
            points_cluster: 15.0,
            decay_per_clean: 12.0,
            cluster_alert_count: 3,
        }
    }
}

fn score_to_stage(score: f64, config: &EscalationConfig) -> RiskStage {
    if score <= config.score_normal_max {
        RiskStage::Normal
    } else if score <= config.score_warning_max {
        RiskStage::Warning
    } else {
        RiskStage::Critical
    }
}

/// Infer an anomaly-type key from an alert's reason/severity, for matching
/// recent alerts against current anomaly kinds.
fn anomaly_type_from_reason(reason: &str, severity: &str) -> String {
    let r = reason.to_ascii_lowercase();
    let s = severity.to_ascii_lowercase();
    if r.contains("burst") || r.contains("transaction frequency") {
        return "burst_transactions".to_string();
    }
    if r.contains("velocity") {
        return "suspicious_velocity".to_string();
    }
    if r.contains("fresh") || r.contains("high value") {
        return "fresh_wallet_high_value".to_string();
    }
    if r.contains("trust score") || s == "risk_score" {
        return "risk_score".to_string();
    }
    format!("other_{s}")
}

/// Run the escalation state machine for one analysis: load state and
/// recent alerts, apply the rules, persist, mirror the stage into the
/// tracked wallet's priority, and return the stage.
pub fn update_escalation(
    conn: &Connection,
    wallet: &str,
    anomaly_result: &AnomalyResult,
    config: &EscalationConfig,
    now_ts: i64,
) -> Result<RiskStage> {
    let since = now_ts - config.window_recent_sec;

    let current_types: std::collections::BTreeSet<String> = anomaly_result
        .flags
        .iter()
        .map(|f| f.kind.as_str().to_string())
        .collect();
    let current_flag_count = anomaly_result.flags.len();

    let state = store::escalation_state(conn, wallet)?;
    let (mut risk_stage, mut escalation_score, mut last_alert_ts, mut last_clean_ts) = match &state
    {
        Some(s) => (
            s.risk_stage,
            s.escalation_score,
            s.last_alert_ts,
            s.last_clean_ts,
        ),
        None => (RiskStage::Normal, 0.0, None, Some(now_ts)),
    };

    let recent_alerts = store::alerts_for_wallet(conn, wallet, Some(since), Some(now_ts), 200)?;
    let recent_types: std::collections::BTreeSet<String> = recent_alerts
        .iter()
        .map(|a| anomaly_type_from_reason(&a.reason, &a.severity))
        .collect();
    let repeated: Vec<&String> = current_types.intersection(&recent_types).collect();
    let all_types_count = current_types.union(&recent_types).count();
    let cluster_since = now_ts - config.window_cluster_sec;
    let cluster_count = recent_alerts
        .iter()
        .filter(|a| a.created_at >= cluster_since)
        .count();

    if !anomaly_result.is_anomalous && recent_alerts.is_empty() {
        // Clean cycle with no recent alerts: decay, or reset after a long
        // clean period.
        if last_clean_ts.is_some_and(|ts| now_ts - ts >= config.window_clean_reset_sec) {
            escalation_score = 0.0;
            risk_stage = RiskStage::Normal;
            last_clean_ts = Some(now_ts);
            last_alert_ts = None;
        } else {
            last_clean_ts = Some(now_ts);
            if last_alert_ts.is_some_and(|ts| now_ts - ts >= config.window_clean_reduce_sec) {
                escalation_score = (escalation_score - config.decay_per_clean).max(0.0);
                risk_stage = score_to_stage(escalation_score, config);
            }
        }
    } else {
        if anomaly_result.is_anomalous {
            last_alert_ts = Some(now_ts);
        }
        if !anomaly_result.is_anomalous
            && last_clean_ts.is_some_and(|ts| now_ts - ts >= config.window_clean_reduce_sec)
        {
            escalation_score = (escalation_score - config.decay_per_clean).max(0.0);
        }

        escalation_score += current_flag_count as f64 * config.points_per_flag;

        if !repeated.is_empty() {
            escalation_score += repeated.len() as f64 * config.points_repeated;
        }
        if all_types_count >= 2 {
            escalation_score += config.points_multiple_types;
        }
        if cluster_count >= config.cluster_alert_count {
            escalation_score += config.points_cluster;
        }

        escalation_score = escalation_score.min(config.score_cap);
        risk_stage = score_to_stage(escalation_score, config);
    }

    let state_json = json!({
        "current_anomaly_types": current_types,
        "recent_alert_count": recent_alerts.len(),
        "reasons": {
            "repeated": !repeated.is_empty(),
            "multiple_types": all_types_count >= 2,
            "time_cluster": cluster_count >= config.cluster_alert_count,
        },
    })
    .to_string();

    store::upsert_escalation_state(
        conn,
        &EscalationStateRow {
            wallet: wallet.to_string(),
            risk_stage,
            escalation_score,
            last_alert_ts,
            last_clean_ts,
            state_json: Some(state_json),
        },
    )?;

    // Mirror the stage into the scheduling tier; failure here must not
    // lose the state update.
    if let Err(e) = store::set_wallet_priority(conn, wallet, risk_stage.to_priority()) {
        warn!(wallet, error = %e, "escalation priority mirror failed");
    }

    info!(
        wallet,
        risk_stage = risk_stage.as_str(),
        escalation_score,
        current_flags = current_flag_count,
        "escalation updated"
    );
    Ok(risk_stage)
}
