//! Alert engine: thresholds, anomaly-to-alert mapping, cooldown dedup.
//!
//! Two triggers per analysis: a trust score under the threshold emits a
//! `risk_score` alert, and every anomaly flag at or above the minimum
//! severity emits an alert with the flag's severity and message. Duplicate
//! `(wallet, severity, reason)` tuples are suppressed inside the cooldown.

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

use common::store;
use common::types::Severity;

use crate::anomaly::AnomalyResult;

/// Severity label for score-threshold alerts.
pub const RISK_SCORE_SEVERITY: &str = "risk_score";
const MAX_REASON_LENGTH: usize = 500;

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Trigger a risk_score alert when the trust score is below this.
    pub trust_score_alert_below: f64,
    /// Only emit alerts for anomaly flags with severity >= this.
    pub anomaly_severity_min: Severity,
    /// Don't store a duplicate (wallet, severity, reason) within this window.
    pub cooldown_sec: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            trust_score_alert_below: 50.0,
            anomaly_severity_min: Severity::Medium,
            cooldown_sec: 3600,
        }
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_REASON_LENGTH {
        return reason.to_string();
    }
    let mut cut = MAX_REASON_LENGTH - 3;
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &reason[..cut])
}

/// Evaluate risk and store alerts with cooldown dedup. Returns the number
/// of new alerts stored.
pub fn evaluate_and_store_alerts(
    conn: &Connection,
    wallet: &str,
    trust_score: f64,
    anomaly_result: &AnomalyResult,
    config: &AlertConfig,
    now_ts: i64,
) -> Result<u64> {
    let since = now_ts - config.cooldown_sec;
    let mut stored = 0_u64;

    if trust_score < config.trust_score_alert_below {
        let reason = truncate_reason(&format!(
            "Trust score below threshold: {trust_score:.1} < {}",
            config.trust_score_alert_below
        ));
        if !store::has_recent_alert(conn, wallet, RISK_SCORE_SEVERITY, &reason, since)? {
            store::insert_alert(conn, wallet, RISK_SCORE_SEVERITY, &reason, now_ts)?;
            stored += 1;
            info!(
                wallet,
                severity = RISK_SCORE_SEVERITY,
                reason = %reason,
                trust_score,
                "alert stored"
            );
        }
    }

    for flag in &anomaly_result.flags {
        if flag.severity < config.anomaly_severity_min {
            continue;
        }
        let severity = flag.severity.as_str();
        let reason = truncate_reason(&flag.message);
        if store::has_recent_alert(conn, wallet, severity, &reason, since)? {
            continue;
        }
        store::insert_alert(conn, wallet, severity, &reason, now_ts)?;
        stored += 1;
        info!(
            wallet,
            severity,
            reason = %reason,
            anomaly_type = flag.kind.as_str(),
            "alert stored"
        );
    }

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AnomalyFlag, AnomalyType};
    use common::db::Database;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db
    }

    fn flag(severity: Severity, message: &str) -> AnomalyFlag {
        AnomalyFlag {
            kind: AnomalyType::BurstTransactions,
            severity,
            message: message.into(),
            rule_name: "burst_tx_frequency_per_day".into(),
            details: serde_json::json!({}),
        }
    }

    fn result_with(flags: Vec<AnomalyFlag>) -> AnomalyResult {
        AnomalyResult {
            wallet: "w".into(),
            is_anomalous: !flags.is_empty(),
            flags,
        }
    }

    #[test]
    fn test_low_score_emits_risk_score_alert() {
        let db = test_db();
        let cfg = AlertConfig::default();
        let stored =
            evaluate_and_store_alerts(&db.conn, "w", 42.0, &result_with(vec![]), &cfg, 1000)
                .unwrap();
        assert_eq!(stored, 1);

        let alerts = store::alerts_for_wallet(&db.conn, "w", None, None, 10).unwrap();
        assert_eq!(alerts[0].severity, RISK_SCORE_SEVERITY);
        assert!(alerts[0].reason.contains("42.0 < 50"));
    }

    #[test]
    fn test_score_at_threshold_does_not_alert() {
        let db = test_db();
        let cfg = AlertConfig::default();
        let stored =
            evaluate_and_store_alerts(&db.conn, "w", 50.0, &result_with(vec![]), &cfg, 1000)
                .unwrap();
        assert_eq!(stored, 0);
    }

    #[test]
    fn test_anomaly_severity_floor() {
        let db = test_db();
        let cfg = AlertConfig::default();
        let result = result_with(vec![
            flag(Severity::Low, "low noise"),
            flag(Severity::Medium, "medium signal"),
            flag(Severity::Critical, "critical burst"),
        ]);
        let stored = evaluate_and_store_alerts(&db.conn, "w", 90.0, &result, &cfg, 1000).unwrap();
        assert_eq!(stored, 2); // low is filtered

        let alerts = store::alerts_for_wallet(&db.conn, "w", None, None, 10).unwrap();
        let severities: Vec<&str> = alerts.iter().map(|a| a.severity.as_str()).collect();
        assert!(severities.contains(&"medium"));
        assert!(severities.contains(&"critical"));
        assert!(!severities.contains(&"low"));
    }

    #[test]
    fn test_cooldown_dedup_within_window() {
        let db = test_db();
        let cfg = AlertConfig::default();
        let result = result_with(vec![flag(Severity::High, "same reason")]);

        let first = evaluate_and_store_alerts(&db.conn, "w", 90.0, &result, &cfg, 1000).unwrap();
        assert_eq!(first, 1);
        // Identical inputs inside the cooldown: nothing new.
        let second = evaluate_and_store_alerts(&db.conn, "w", 90.0, &result, &cfg, 2000).unwrap();
        assert_eq!(second, 0);
        // Past the cooldown the same alert may fire again.
        let third =
            evaluate_and_store_alerts(&db.conn, "w", 90.0, &result, &cfg, 1000 + 3601).unwrap();
        assert_eq!(third, 1);
    }

    #[test]
    fn test_different_reason_not_deduplicated() {
        let db = test_db();
        let cfg = AlertConfig::default();
        evaluate_and_store_alerts(
            &db.conn,
            "w",
            90.0,
            &result_with(vec![flag(Severity::High, "reason one")]),
            &cfg,
            1000,
        )
        .unwrap();
        let stored = evaluate_and_store_alerts(
            &db.conn,
            "w",
            90.0,
            &result_with(vec![flag(Severity::High, "reason two")]),
            &cfg,
            1001,
        )
        .unwrap();
        assert_eq!(stored, 1);
    }

    #[test]
    fn test_reason_truncated_to_500() {
        let db = test_db();
        let cfg = AlertConfig::default();
        let long = "x".repeat(600);
        let result = result_with(vec![flag(Severity::High, &long)]);
        evaluate_and_store_alerts(&db.conn, "w", 90.0, &result, &cfg, 1000).unwrap();

        let alerts = store::alerts_for_wallet(&db.conn, "w", None, None, 10).unwrap();
        assert_eq!(alerts[0].reason.len(), 500);
        assert!(alerts[0].reason.ends_with("..."));
    }
}
