//! Entity reputation: long-lived, cluster-level reputation that evolves
//! with recent behavior weighted over old.
//!
//! Entity = cluster (1:1). The score decays toward neutral 50 over time,
//! then takes anomaly, alert-severity and spread penalties. Wallets inherit
//! a bounded modifier from their entity's reputation.

use anyhow::Result;
use rusqlite::Connection;
use serde_json::json;
use tracing::info;

use common::store::{self, AlertRow, EntityProfileRow};
use common::types::{ScoreMetadata, Severity};

pub const REASON_CLUSTER_CONTAMINATION: &str = "cluster_contamination";
pub const REASON_REPEATED_ANOMALIES: &str = "repeated_anomalies";
pub const REASON_BEHAVIOR_RECOVERY: &str = "behavior_recovery";

const SECONDS_PER_DAY: i64 = 86_400;
const NEUTRAL_SCORE: f64 = 50.0;
const DECAY_DAYS_HALFLIFE: f64 = 90.0;
const ANOMALY_WEIGHT: f64 = 4.0;
const CLUSTER_SPREAD_PENALTY_FACTOR: f64 = 0.5;
const ENTITY_MODIFIER_SCALE: f64 = 0.2;
const ENTITY_MODIFIER_CAP: f64 = 10.0;
const RECENT_WINDOW_DAYS: i64 = 7;
const RISK_HISTORY_MAX: usize = 100;
const ALERTS_PER_MEMBER_LIMIT: usize = 50;

/// Pull the previous score toward neutral; half-life 90 days.
fn time_decay(prev_score: f64, days_since: f64) -> f64 {
    if days_since <= 0.0 {
        return prev_score;
    }
    let decay = 0.5_f64.powf(days_since / DECAY_DAYS_HALFLIFE);
    NEUTRAL_SCORE + (prev_score - NEUTRAL_SCORE) * decay
}

fn severity_multiplier(severity: &str) -> f64 {
    match Severity::parse(severity) {
        Some(Severity::Critical) => 6.0,
        Some(Severity::High) => 4.0,
        Some(Severity::Medium) => 2.0,
        Some(Severity::Low) | None => 1.0,
    }
}

/// Severity-weighted penalty over alerts inside the recent window.
fn alert_penalty(alerts: &[AlertRow], now_ts: i64) -> f64 {
    let window_start = now_ts - RECENT_WINDOW_DAYS * SECONDS_PER_DAY;
    alerts
        .iter()
        .filter(|a| a.created_at >= window_start)
        .map(|a| severity_multiplier(&a.severity))
        .sum()
}

/// Extra penalty when risk is spread across many members.
fn spread_penalty(risky_count: usize, member_count: usize) -> f64 {
    if member_count < 2 {
        return 0.0;
    }
    let ratio = risky_count as f64 / member_count as f64;
    ratio * member_count as f64 * CLUSTER_SPREAD_PENALTY_FACTOR
}

/// Update the entity (cluster) reputation from recent anomalies and alerts.
/// Persists the profile and appends a history snapshot; returns the profile.
#[allow(clippy::too_many_arguments)]
pub fn update_entity_reputation(
    conn: &Connection,
    entity_id: i64,
    cluster_id: i64,
    member_count: usize,
    anomaly_count: usize,
    risky_count: usize,
    alerts: &[AlertRow],
    now_ts: i64,
) -> Result<EntityProfileRow> {
    let existing = store::entity_profile(conn, entity_id)?;
    let (prev_score, prev_updated, risk_history_json) = match &existing {
        Some(p) => (p.reputation_score, p.last_updated, p.risk_history_json.clone()),
        None => (NEUTRAL_SCORE, now_ts - 365 * SECONDS_PER_DAY, None),
    };

    let days_since = (now_ts - prev_updated) as f64 / SECONDS_PER_DAY as f64;
    let decayed = time_decay(prev_score, days_since);

    let anomaly_pen = anomaly_count as f64 * ANOMALY_WEIGHT;
    let alert_pen = alert_penalty(alerts, now_ts);
    let member_count = if member_count < 1 {
        risky_count.max(1)
    } else {
        member_count
    };
    let spread_pen = spread_penalty(risky_count, member_count);

    let raw = decayed - anomaly_pen - alert_pen - spread_pen;
    let reputation_score = ((raw.clamp(0.0, 100.0)) * 100.0).round() / 100.0;

    let mut reason_tags: Vec<&str> = Vec::new();
    if risky_count > 0 && member_count > 0 {
        reason_tags.push(REASON_CLUSTER_CONTAMINATION);
    }
    if anomaly_count >= 2 {
        reason_tags.push(REASON_REPEATED_ANOMALIES);
    }
    if anomaly_count == 0 && alert_pen == 0.0 && prev_score < 70.0 && reputation_score >= 70.0 {
        reason_tags.push(REASON_BEHAVIOR_RECOVERY);
    }

    let new_decay = (1.0 - (days_since / DECAY_DAYS_HALFLIFE) * 0.1).clamp(0.5, 1.0);

    let snapshot = json!({
        "at": now_ts,
        "reputation_score": reputation_score,
        "anomaly_count": anomaly_count,
        "alert_penalty": alert_pen,
        "spread_penalty": spread_pen,
        "reason_tags": reason_tags,
    });
    let mut risk_history: Vec<serde_json::Value> = risk_history_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    risk_history.push(snapshot);
    if risk_history.len() > RISK_HISTORY_MAX {
        let excess = risk_history.len() - RISK_HISTORY_MAX;
        risk_history.drain(..excess);
    }

    let reason_tags_json = serde_json::to_string(&reason_tags)?;
    let profile = EntityProfileRow {
        entity_id,
        cluster_id,
        reputation_score,
        risk_history_json: Some(serde_json::to_string(&risk_history)?),
        last_updated: now_ts,
        decay_factor: new_decay,
        reason_tags_json: reason_tags_json.clone(),
    };
    store::upsert_entity_profile(conn, &profile)?;
    store::insert_entity_history(conn, entity_id, reputation_score, &reason_tags_json, now_ts)?;

    info!(
        entity_id,
        cluster_id,
        reputation_score,
        reason_tags = ?reason_tags,
        "entity reputation updated"
    );
    Ok(profile)
}

/// Gather anomalies and alerts for a cluster's members, then update the
/// entity reputation. entity_id = cluster_id. Call after cluster risk.
pub fn update_entity_reputation_from_cluster(
    conn: &Connection,
    cluster_id: i64,
    now_ts: i64,
) -> Result<Option<EntityProfileRow>> {
    let members = store::cluster_members(conn, cluster_id)?;
    if members.is_empty() {
        return Ok(None);
    }
    let since = now_ts - RECENT_WINDOW_DAYS * SECONDS_PER_DAY;
    let latest = store::latest_trust_scores_for(conn, &members)?;

    let mut anomaly_count = 0_usize;
    let mut alerts = Vec::new();
    for w in &members {
        if let Some(rec) = latest.get(w) {
            let anomalous = rec.computed_at >= since
                && ScoreMetadata::parse(rec.metadata_json.as_deref())
                    .is_some_and(|m| m.is_anomalous);
            if anomalous {
                anomaly_count += 1;
            }
        }
        alerts.extend(alerts_for_member(conn, w, since)?);
    }

    let profile = update_entity_reputation(
        conn,
        cluster_id,
        cluster_id,
        members.len(),
        anomaly_count,
        anomaly_count,
        &alerts,
        now_ts,
    )?;
    Ok(Some(profile))
}

fn alerts_for_member(conn: &Connection, wallet: &str, since: i64) -> Result<Vec<AlertRow>> {
    store::alerts_for_wallet(conn, wallet, Some(since), None, ALERTS_PER_MEMBER_LIMIT)
}

/// Modifier a wallet inherits from its entity's reputation:
/// `(entity_score − 50) × 0.2`, clamped to ±10. Zero when unclustered.
pub fn entity_reputation_modifier(conn: &Connection, wallet: &str) -> Result<f64> {
    let Some(cluster) = store::cluster_for_wallet(conn, wallet)? else {
        return Ok(0.0);
    };
    let Some(profile) = store::entity_profile_by_cluster(conn, cluster.id)? else {
        return Ok(0.0);
    };
    let delta = (profile.reputation_score - NEUTRAL_SCORE) * ENTITY_MODIFIER_SCALE;
    Ok(delta.clamp(-ENTITY_MODIFIER_CAP, ENTITY_MODIFIER_CAP))
}

/// Score after the entity modifier, clamped to [0, 100].
pub fn apply_entity_modifier(conn: &Connection, wallet: &str, score_after_cluster: f64) -> Result<f64> {
    let modifier = entity_reputation_modifier(conn, wallet)?;
    Ok((score_after_cluster + modifier).clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db
    }

    fn alert(severity: &str, created_at: i64) -> AlertRow {
        AlertRow {
            created_at,
            severity: severity.into(),
            reason: "r".into(),
        }
    }

    #[test]
    fn test_time_decay_half_life() {
        // After exactly one half-life the distance to neutral halves.
        let decayed = time_decay(90.0, 90.0);
        assert!((decayed - 70.0).abs() < 1e-9);
        // No time passed: unchanged.
        assert!((time_decay(90.0, 0.0) - 90.0).abs() < 1e-9);
        // Low scores decay upward toward neutral.
        let decayed = time_decay(10.0, 90.0);
        assert!((decayed - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_alert_penalty_severity_weighted_and_windowed() {
        let now = 1_000_000;
        let recent = now - 100;
        let stale = now - 10 * 86_400;
        let alerts = vec![
            alert("critical", recent), // 6
            alert("high", recent),     // 4
            alert("medium", recent),   // 2
            alert("low", recent),      // 1
            alert("risk_score", recent), // unknown → 1
            alert("critical", stale),  // outside window
        ];
        assert!((alert_penalty(&alerts, now) - 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_spread_penalty() {
        assert!((spread_penalty(2, 4) - 1.0).abs() < 1e-9); // 0.5 × 4 × 0.5
        assert!((spread_penalty(1, 1) - 0.0).abs() < 1e-9); // singleton: none
    }

    #[test]
    fn test_fresh_entity_starts_at_neutral_and_penalizes() {
        let db = test_db();
        // No prior profile: prev=50 decayed stays 50; two anomalies → −8.
        let profile =
            update_entity_reputation(&db.conn, 1, 1, 3, 2, 2, &[], 1_000_000).unwrap();
        // spread = (2/3) × 3 × 0.5 = 1 → 50 − 8 − 1 = 41
        assert!((profile.reputation_score - 41.0).abs() < 1e-9);
        assert!(profile
            .reason_tags_json
            .contains(REASON_REPEATED_ANOMALIES));
        assert!(profile
            .reason_tags_json
            .contains(REASON_CLUSTER_CONTAMINATION));
    }

    #[test]
    fn test_reputation_bounds_hold() {
        let db = test_db();
        let alerts: Vec<AlertRow> = (0..50).map(|i| alert("critical", 1_000_000 - i)).collect();
        let profile =
            update_entity_reputation(&db.conn, 2, 2, 4, 4, 4, &alerts, 1_000_000).unwrap();
        assert!(profile.reputation_score >= 0.0);
        assert!((0.5..=1.0).contains(&profile.decay_factor));
    }

    #[test]
    fn test_clean_update_decays_toward_neutral_without_recovery_tag() {
        let db = test_db();
        store::upsert_entity_profile(
            &db.conn,
            &EntityProfileRow {
                entity_id: 5,
                cluster_id: 5,
                reputation_score: 20.0,
                risk_history_json: None,
                last_updated: 0,
                decay_factor: 1.0,
                reason_tags_json: "[]".into(),
            },
        )
        .unwrap();
        // One half-life clean: 50 + (20 − 50) × 0.5 = 35.
        let p = update_entity_reputation(&db.conn, 5, 5, 2, 0, 0, &[], 90 * 86_400).unwrap();
        assert!((p.reputation_score - 35.0).abs() < 1e-9);
        // Recovery requires crossing 70, which neutral decay never does
        // from below; no tag on a plain clean update.
        assert!(!p.reason_tags_json.contains(REASON_BEHAVIOR_RECOVERY));
        assert_eq!(p.reason_tags_json, "[]");
    }

    #[test]
    fn test_risk_history_trimmed() {
        let db = test_db();
        for i in 0..110 {
            update_entity_reputation(&db.conn, 6, 6, 2, 0, 0, &[], 1_000 + i).unwrap();
        }
        let profile = store::entity_profile(&db.conn, 6).unwrap().unwrap();
        let history: Vec<serde_json::Value> =
            serde_json::from_str(profile.risk_history_json.as_deref().unwrap()).unwrap();
        assert_eq!(history.len(), 100);
        // Oldest snapshots were dropped.
        assert_eq!(history[0]["at"], 1_000 + 10);
    }

    #[test]
    fn test_modifier_clamped_and_zero_when_unclustered() {
        let db = test_db();
        assert!((entity_reputation_modifier(&db.conn, "free").unwrap() - 0.0).abs() < 1e-9);

        let id = store::insert_cluster(&db.conn, 0.5, "[]").unwrap();
        store::insert_cluster_member(&db.conn, id, "m").unwrap();
        store::insert_cluster_member(&db.conn, id, "n").unwrap();
        store::upsert_entity_profile(
            &db.conn,
            &EntityProfileRow {
                entity_id: id,
                cluster_id: id,
                reputation_score: 100.0,
                risk_history_json: None,
                last_updated: 0,
                decay_factor: 1.0,
                reason_tags_json: "[]".into(),
            },
        )
        .unwrap();
        // (100 − 50) × 0.2 = 10: exactly at the cap.
        assert!((entity_reputation_modifier(&db.conn, "m").unwrap() - 10.0).abs() < 1e-9);

        store::upsert_entity_profile(
            &db.conn,
            &EntityProfileRow {
                entity_id: id,
                cluster_id: id,
                reputation_score: 0.0,
                risk_history_json: None,
                last_updated: 0,
                decay_factor: 1.0,
                reason_tags_json: "[]".into(),
            },
        )
        .unwrap();
        assert!((entity_reputation_modifier(&db.conn, "m").unwrap() + 10.0).abs() < 1e-9);

        let adjusted = apply_entity_modifier(&db.conn, "m", 5.0).unwrap();
        assert!((adjusted - 0.0).abs() < 1e-9); // clamped at the floor
    }

    #[test]
    fn test_from_cluster_counts_recent_anomalies() {
        let db = test_db();
        let id = store::insert_cluster(&db.conn, 0.5, "[]").unwrap();
        let now = 1_000_000;
        for (w, anomalous, computed_at) in [
            ("a", true, now - 100),            // recent anomalous
            ("b", true, now - 30 * 86_400),    // anomalous but stale
            ("c", false, now - 100),           // recent clean
        ] {
            store::insert_cluster_member(&db.conn, id, w).unwrap();
            let meta = serde_json::json!({
                "anomaly_flags": [],
                "is_anomalous": anomalous,
                "tx_count": 1
            })
            .to_string();
            store::insert_trust_score(&db.conn, w, 60.0, computed_at, Some(&meta)).unwrap();
        }

        let profile = update_entity_reputation_from_cluster(&db.conn, id, now)
            .unwrap()
            .unwrap();
        // One recent anomaly: 50 − 4 − spread((1/3)·3·0.5 = 0.5) = 45.5
        assert!((profile.reputation_score - 45.5).abs() < 1e-9,
            "score={}", profile.reputation_score);

        let history = store::entity_history(&db.conn, id, 10).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_from_cluster_empty_is_none() {
        let db = test_db();
        assert!(update_entity_reputation_from_cluster(&db.conn, 99, 0)
            .unwrap()
            .is_none());
    }
}
