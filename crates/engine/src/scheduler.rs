//! Wallet scheduling: which wallets to analyze next.
//!
//! Two modes, selected by config. "priority" ranks every tracked wallet by
//! a deterministic 3-key sort (tier rank, rule-based urgency, staleness).
//! "rotation" analyzes critical wallets every cycle and lower tiers on a
//! deterministic cadence. Both cap the batch size.

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use common::store;
use common::types::{Priority, ScoreMetadata, Severity};

/// Rule-based urgency tiers; higher analyzes first.
const TIER_ESCALATION: f64 = 1000.0;
const TIER_HIGH_RISK: f64 = 800.0;
const TIER_RECENT_ANOMALY: f64 = 600.0;
const TIER_NEW: f64 = 500.0;
const TIER_NORMAL: f64 = 200.0;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub trust_score_high_risk_below: f64,
    /// First seen within this window still counts as "new" for priority.
    pub new_wallet_max_age_sec: i64,
    /// Max tracked wallets considered per batch selection.
    pub max_candidates: usize,
    pub cycle_interval_sec: f64,
    pub max_wallets_per_cycle: usize,
    pub watchlist_every_n_cycles: u64,
    pub normal_every_n_cycles: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            trust_score_high_risk_below: 40.0,
            new_wallet_max_age_sec: 86_400 * 7,
            max_candidates: 10_000,
            cycle_interval_sec: 30.0,
            max_wallets_per_cycle: 2000,
            watchlist_every_n_cycles: 2,
            normal_every_n_cycles: 4,
        }
    }
}

/// One scheduled wallet with its explainable ranking inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledWallet {
    pub wallet: String,
    pub tier_rank: u8,
    pub priority_score: f64,
    /// Last computed_at; 0 when never scored (oldest possible).
    pub last_computed_at: i64,
    pub reason: &'static str,
}

fn compute_priority_score(
    latest: Option<&store::TrustScoreRecord>,
    first_seen: Option<i64>,
    now_ts: i64,
    config: &SchedulerConfig,
) -> (f64, &'static str) {
    let score_val = latest.map(|r| r.score);
    let metadata = latest.and_then(|r| ScoreMetadata::parse(r.metadata_json.as_deref()));
    let max_severity = metadata.as_ref().and_then(ScoreMetadata::max_severity);
    let is_anomalous = metadata.as_ref().is_some_and(|m| m.is_anomalous);

    // 1. Severe anomaly in the last run: immediate re-scan.
    if matches!(max_severity, Some(Severity::Critical | Severity::High)) {
        return (
            TIER_ESCALATION + (100.0 - score_val.unwrap_or(0.0)),
            "escalation_severe_anomaly",
        );
    }
    // 2. Trust score under the risk threshold.
    if let Some(score) = score_val {
        if score < config.trust_score_high_risk_below {
            return (
                TIER_HIGH_RISK + (config.trust_score_high_risk_below - score),
                "high_risk_low_score",
            );
        }
    }
    // 3. Any anomaly in the last run (medium/low).
    if is_anomalous && max_severity.is_some() {
        return (TIER_RECENT_ANOMALY, "recent_anomaly");
    }
    // 4. Never scored, or first seen recently.
    if latest.is_none() {
        return (TIER_NEW, "new_no_score");
    }
    if first_seen.is_some_and(|fs| now_ts - fs <= config.new_wallet_max_age_sec) {
        return (TIER_NEW - 1.0, "new_recent_first_seen");
    }
    // 5. Base: lower trust score = higher urgency.
    let sub = 100.0 - score_val.unwrap_or(100.0).min(100.0);
    (TIER_NORMAL + sub, "normal")
}

/// Rule-priority batch: ranked by `(tier_rank, priority_score, staleness)`
/// descending (staler first on the last key).
pub fn next_batch(
    conn: &Connection,
    limit: usize,
    now_ts: i64,
    config: &SchedulerConfig,
) -> Result<Vec<ScheduledWallet>> {
    let candidates = store::tracked_wallet_addresses(conn, config.max_candidates)?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let priorities = store::wallet_priorities_for(conn, &candidates)?;
    let latest_scores = store::latest_trust_scores_for(conn, &candidates)?;
    let profiles = store::wallet_profiles_for(conn, &candidates)?;

    let mut scored: Vec<ScheduledWallet> = candidates
        .into_iter()
        .map(|wallet| {
            let tier = priorities.get(&wallet).copied().unwrap_or(Priority::Normal);
            let latest = latest_scores.get(&wallet);
            let first_seen = profiles.get(&wallet).map(|p| p.first_seen_at);
            let (priority_score, reason) =
                compute_priority_score(latest, first_seen, now_ts, config);
            ScheduledWallet {
                tier_rank: tier.rank(),
                priority_score,
                last_computed_at: latest.map_or(0, |r| r.computed_at),
                reason,
                wallet,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.tier_rank
            .cmp(&a.tier_rank)
            .then(
                b.priority_score
                    .partial_cmp(&a.priority_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            // Older last_computed_at first.
            .then(a.last_computed_at.cmp(&b.last_computed_at))
    });
    scored.truncate(limit);

    if !scored.is_empty() {
        debug!(
            batch_size = scored.len(),
            top_reasons = ?scored.iter().take(5).map(|s| s.reason).collect::<Vec<_>>(),
            "scheduler batch selected"
        );
    }
    Ok(scored)
}

/// Deterministic rotation: critical every cycle, watchlist every
/// `watchlist_every_n_cycles`, normal every `normal_every_n_cycles`, each
/// lower tier also gated on elapsed time since its last analysis.
pub fn select_wallets_for_cycle(
    conn: &Connection,
    cycle_number: u64,
    now_ts: i64,
    config: &SchedulerConfig,
) -> Result<Vec<String>> {
    let rows = store::tracked_wallets(conn, 50_000)?;
    let interval = config.cycle_interval_sec.max(1.0);
    let watchlist_min_elapsed = (config.watchlist_every_n_cycles as f64 * interval) as i64;
    let normal_min_elapsed = (config.normal_every_n_cycles as f64 * interval) as i64;

    let include_watchlist =
        config.watchlist_every_n_cycles > 0 && cycle_number % config.watchlist_every_n_cycles == 0;
    let include_normal =
        config.normal_every_n_cycles > 0 && cycle_number % config.normal_every_n_cycles == 0;

    let mut critical = Vec::new();
    let mut watchlist = Vec::new();
    let mut normal = Vec::new();

    for row in rows {
        let elapsed = match row.last_analyzed_at {
            Some(ts) if ts > 0 => now_ts - ts,
            _ => i64::MAX,
        };
        match row.priority {
            Priority::Critical => critical.push(row.wallet),
            Priority::Watchlist => {
                if include_watchlist && elapsed >= watchlist_min_elapsed {
                    watchlist.push(row.wallet);
                }
            }
            Priority::Normal => {
                if include_normal && elapsed >= normal_min_elapsed {
                    normal.push(row.wallet);
                }
            }
        }
    }

    critical.sort();
    watchlist.sort();
    normal.sort();

    let mut selected = critical;
    selected.extend(watchlist);
    selected.extend(normal);
    selected.truncate(config.max_wallets_per_cycle);
    Ok(selected)
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

    fn cfg() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn score_with_meta(
        conn: &Connection,
        wallet: &str,
        score: f64,
        computed_at: i64,
        severity: Option<&str>,
    ) {
        let meta = severity.map(|s| {
            serde_json::json!({
                "anomaly_flags": [{"rule_name": "burst_tx_frequency_per_day", "severity": s}],
                "is_anomalous": true,
                "tx_count": 5
            })
            .to_string()
        });
        store::insert_trust_score(conn, wallet, score, computed_at, meta.as_deref()).unwrap();
    }

    #[test]
    fn test_priority_rules_first_match_wins() {
        let db = test_db();
        let now = 1_000_000;
        let c = cfg();

        // Severe anomaly beats everything.
        score_with_meta(&db.conn, "severe", 80.0, now, Some("critical"));
        let latest = store::latest_trust_score(&db.conn, "severe").unwrap();
        let (p, reason) = compute_priority_score(latest.as_ref(), None, now, &c);
        assert_eq!(reason, "escalation_severe_anomaly");
        assert!((p - 1020.0).abs() < 1e-9);

        // Low score without severe anomaly.
        score_with_meta(&db.conn, "lowscore", 30.0, now, None);
        let latest = store::latest_trust_score(&db.conn, "lowscore").unwrap();
        let (p, reason) = compute_priority_score(latest.as_ref(), None, now, &c);
        assert_eq!(reason, "high_risk_low_score");
        assert!((p - 810.0).abs() < 1e-9);

        // Medium anomaly, decent score.
        score_with_meta(&db.conn, "medium", 92.0, now, Some("medium"));
        let latest = store::latest_trust_score(&db.conn, "medium").unwrap();
        let (p, reason) = compute_priority_score(latest.as_ref(), None, now, &c);
        assert_eq!(reason, "recent_anomaly");
        assert!((p - 600.0).abs() < 1e-9);

        // Never scored.
        let (p, reason) = compute_priority_score(None, None, now, &c);
        assert_eq!(reason, "new_no_score");
        assert!((p - 500.0).abs() < 1e-9);

        // Scored, but first seen recently.
        score_with_meta(&db.conn, "young", 95.0, now, None);
        let latest = store::latest_trust_score(&db.conn, "young").unwrap();
        let (p, reason) =
            compute_priority_score(latest.as_ref(), Some(now - 86_400), now, &c);
        assert_eq!(reason, "new_recent_first_seen");
        assert!((p - 499.0).abs() < 1e-9);

        // Plain normal: lower score ranks higher.
        score_with_meta(&db.conn, "plain", 90.0, now, None);
        let latest = store::latest_trust_score(&db.conn, "plain").unwrap();
        let (p, reason) =
            compute_priority_score(latest.as_ref(), Some(now - 86_400 * 30), now, &c);
        assert_eq!(reason, "normal");
        assert!((p - 210.0).abs() < 1e-9);
    }

    #[test]
    fn test_batch_sorted_by_three_keys() {
        let db = test_db();
        let now = 1_000_000;
        let c = cfg();

        // Tier critical beats tier normal even with lower urgency.
        store::track_wallet(&db.conn, "crit_tier", Priority::Critical).unwrap();
        score_with_meta(&db.conn, "crit_tier", 95.0, now - 50, None);

        store::track_wallet(&db.conn, "urgent_normal", Priority::Normal).unwrap();
        score_with_meta(&db.conn, "urgent_normal", 10.0, now - 10, Some("critical"));

        // Two equal-urgency wallets differ in staleness.
        store::track_wallet(&db.conn, "stale", Priority::Normal).unwrap();
        score_with_meta(&db.conn, "stale", 90.0, now - 5000, None);
        store::track_wallet(&db.conn, "fresh", Priority::Normal).unwrap();
        score_with_meta(&db.conn, "fresh", 90.0, now - 10, None);

        let batch = next_batch(&db.conn, 10, now, &c).unwrap();
        let order: Vec<&str> = batch.iter().map(|s| s.wallet.as_str()).collect();
        assert_eq!(order[0], "crit_tier");
        assert_eq!(order[1], "urgent_normal");
        // stale before fresh at equal priority.
        let stale_pos = order.iter().position(|w| *w == "stale").unwrap();
        let fresh_pos = order.iter().position(|w| *w == "fresh").unwrap();
        assert!(stale_pos < fresh_pos);

        // Invariant: tier_rank non-increasing, then priority_score
        // non-increasing, then staleness non-increasing.
        for pair in batch.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.tier_rank >= b.tier_rank);
            if a.tier_rank == b.tier_rank {
                assert!(a.priority_score >= b.priority_score);
                if (a.priority_score - b.priority_score).abs() < 1e-9 {
                    assert!(a.last_computed_at <= b.last_computed_at);
                }
            }
        }
    }

    #[test]
    fn test_batch_limit_applies() {
        let db = test_db();
        for i in 0..10 {
            store::track_wallet(&db.conn, &format!("w{i}"), Priority::Normal).unwrap();
        }
        let batch = next_batch(&db.conn, 3, 1_000, &cfg()).unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_rotation_critical_every_cycle() {
        let db = test_db();
        let now = 1_000_000;
        store::track_wallet(&db.conn, "c1", Priority::Critical).unwrap();
        store::track_wallet(&db.conn, "w1", Priority::Watchlist).unwrap();
        store::track_wallet(&db.conn, "n1", Priority::Normal).unwrap();

        let c = cfg();
        // Cycle 1: odd — only critical.
        let sel = select_wallets_for_cycle(&db.conn, 1, now, &c).unwrap();
        assert_eq!(sel, vec!["c1"]);
        // Cycle 2: watchlist joins (never analyzed → infinite elapsed).
        let sel = select_wallets_for_cycle(&db.conn, 2, now, &c).unwrap();
        assert_eq!(sel, vec!["c1", "w1"]);
        // Cycle 4: all tiers.
        let sel = select_wallets_for_cycle(&db.conn, 4, now, &c).unwrap();
        assert_eq!(sel, vec!["c1", "w1", "n1"]);
    }

    #[test]
    fn test_rotation_respects_recency_gate() {
        let db = test_db();
        let now = 1_000_000;
        store::track_wallet(&db.conn, "w1", Priority::Watchlist).unwrap();
        // Analyzed 10s ago; watchlist gate is 2 × 30s.
        store::set_last_analyzed(&db.conn, "w1", now - 10).unwrap();

        let c = cfg();
        let sel = select_wallets_for_cycle(&db.conn, 2, now, &c).unwrap();
        assert!(sel.is_empty());

        // 61s later the gate opens.
        store::set_last_analyzed(&db.conn, "w1", now - 61).unwrap();
        let sel = select_wallets_for_cycle(&db.conn, 2, now, &c).unwrap();
        assert_eq!(sel, vec!["w1"]);
    }

    #[test]
    fn test_rotation_hard_cap() {
        let db = test_db();
        for i in 0..30 {
            store::track_wallet(&db.conn, &format!("c{i:02}"), Priority::Critical).unwrap();
        }
        let mut c = cfg();
        c.max_wallets_per_cycle = 10;
        let sel = select_wallets_for_cycle(&db.conn, 1, 1_000, &c).unwrap();
        assert_eq!(sel.len(), 10);
    }
}
