//! Reputation memory: historical trust intelligence per wallet.
//!
//! Rolling 7d/30d averages, volatility (population stddev over 30d), a
//! deterministic trend classification, and a decay factor over inactivity.
//! Pure statistics over the score timeline; no ML.

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use common::store::{self, ReputationStateRow};
use common::types::Trend;

const SECONDS_PER_DAY: i64 = 86_400;
/// Score delta vs the rolling average that flips the trend.
const TREND_DELTA_THRESHOLD: f64 = 3.0;
/// After 90 days inactive the decay factor bottoms out at 0.5.
const DECAY_DAYS: f64 = 90.0;
const DECAY_MAX: f64 = 0.5;
const MIN_SCORES_FOR_VOLATILITY: usize = 2;
const TIMELINE_LIMIT: usize = 10_000;

fn rolling_scores(
    conn: &Connection,
    wallet: &str,
    now_ts: i64,
    window_days: i64,
) -> Result<Vec<f64>> {
    let since = now_ts - window_days * SECONDS_PER_DAY;
    let timeline =
        store::trust_score_timeline(conn, wallet, Some(since), Some(now_ts), TIMELINE_LIMIT)?;
    Ok(timeline.iter().map(|r| r.score).collect())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn pstdev(values: &[f64]) -> f64 {
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Decay factor in [0.5, 1]: 1 = fully active, linear decline over 90 days
/// of inactivity.
fn decay_factor(last_computed_at: Option<i64>, now_ts: i64) -> f64 {
    let Some(last) = last_computed_at else {
        return 1.0;
    };
    let days_inactive = (now_ts - last) as f64 / SECONDS_PER_DAY as f64;
    if days_inactive <= 0.0 {
        return 1.0;
    }
    if days_inactive >= DECAY_DAYS {
        return 1.0 - DECAY_MAX;
    }
    1.0 - (days_inactive / DECAY_DAYS) * DECAY_MAX
}

/// Trend vs avg_30d (falling back to avg_7d): ±3 points flips it.
fn classify_trend(current_score: f64, avg_30d: Option<f64>, avg_7d: Option<f64>) -> Trend {
    let Some(reference) = avg_30d.or(avg_7d) else {
        return Trend::Stable;
    };
    let delta = current_score - reference;
    if delta >= TREND_DELTA_THRESHOLD {
        Trend::Improving
    } else if delta <= -TREND_DELTA_THRESHOLD {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

/// Recompute the reputation state from the score timeline and persist it.
/// Assumes the caller already appended `new_score` to the timeline.
pub fn update_reputation(
    conn: &Connection,
    wallet: &str,
    new_score: f64,
    now_ts: i64,
) -> Result<ReputationStateRow> {
    let scores_7d = rolling_scores(conn, wallet, now_ts, 7)?;
    let scores_30d = rolling_scores(conn, wallet, now_ts, 30)?;

    let avg_7d = (!scores_7d.is_empty()).then(|| mean(&scores_7d));
    let avg_30d = (!scores_30d.is_empty()).then(|| mean(&scores_30d));
    let volatility =
        (scores_30d.len() >= MIN_SCORES_FOR_VOLATILITY).then(|| pstdev(&scores_30d));

    let trend = classify_trend(new_score, avg_30d, avg_7d);

    let last_computed = store::trust_score_timeline(conn, wallet, None, Some(now_ts), 1)?
        .first()
        .map(|r| r.computed_at);
    let decay = decay_factor(last_computed, now_ts);

    let state = ReputationStateRow {
        wallet: wallet.to_string(),
        current_score: new_score,
        avg_7d,
        avg_30d,
        trend,
        volatility,
        decay_factor: decay,
    };
    store::upsert_reputation_state(conn, &state)?;
    debug!(
        wallet,
        current_score = new_score,
        trend = trend.as_str(),
        decay_factor = decay,
        "reputation updated"
    );
    Ok(state)
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

    const DAY: i64 = 86_400;

    #[test]
    fn test_averages_respect_windows() {
        let db = test_db();
        let now = 100 * DAY;
        store::insert_trust_score(&db.conn, "w", 90.0, now - 2 * DAY, None).unwrap();
        store::insert_trust_score(&db.conn, "w", 70.0, now - 20 * DAY, None).unwrap();
        store::insert_trust_score(&db.conn, "w", 10.0, now - 60 * DAY, None).unwrap(); // too old

        let state = update_reputation(&db.conn, "w", 90.0, now).unwrap();
        assert_eq!(state.avg_7d, Some(90.0));
        assert_eq!(state.avg_30d, Some(80.0));
    }

    #[test]
    fn test_volatility_needs_two_samples() {
        let db = test_db();
        let now = 100 * DAY;
        store::insert_trust_score(&db.conn, "w", 80.0, now - DAY, None).unwrap();
        let state = update_reputation(&db.conn, "w", 80.0, now).unwrap();
        assert!(state.volatility.is_none());

        store::insert_trust_score(&db.conn, "w", 60.0, now - 2 * DAY, None).unwrap();
        let state = update_reputation(&db.conn, "w", 80.0, now).unwrap();
        // pstdev of [80, 60] = 10.
        assert!((state.volatility.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_trend_classification() {
        assert_eq!(classify_trend(80.0, Some(75.0), None), Trend::Improving);
        assert_eq!(classify_trend(70.0, Some(75.0), None), Trend::Degrading);
        assert_eq!(classify_trend(76.0, Some(75.0), None), Trend::Stable);
        // Falls back to avg_7d when 30d is absent.
        assert_eq!(classify_trend(80.0, None, Some(70.0)), Trend::Improving);
        assert_eq!(classify_trend(80.0, None, None), Trend::Stable);
    }

    #[test]
    fn test_decay_factor_linear_and_bounded() {
        let now = 1_000 * DAY;
        assert!((decay_factor(None, now) - 1.0).abs() < 1e-9);
        assert!((decay_factor(Some(now), now) - 1.0).abs() < 1e-9);
        // 45 days inactive: 1 − (45/90) × 0.5 = 0.75.
        assert!((decay_factor(Some(now - 45 * DAY), now) - 0.75).abs() < 1e-9);
        // Floor at 0.5 past 90 days.
        assert!((decay_factor(Some(now - 200 * DAY), now) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_state_persisted() {
        let db = test_db();
        let now = 100 * DAY;
        store::insert_trust_score(&db.conn, "w", 85.0, now, None).unwrap();
        update_reputation(&db.conn, "w", 85.0, now).unwrap();

        let loaded = store::reputation_state(&db.conn, "w").unwrap().unwrap();
        assert!((loaded.current_score - 85.0).abs() < 1e-9);
        assert!((loaded.decay_factor - 1.0).abs() < 1e-9);
    }
}
