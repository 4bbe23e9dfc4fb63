//! Typed queries over the SQLite store.
//!
//! Every table has a record struct and all SQL lives here; callers never
//! touch raw rows. Functions are synchronous over `&Connection` so they
//! compose inside one `AsyncDb::call` closure (the whole per-wallet
//! analysis runs as a single unit of work on the DB thread).

use std::collections::HashMap;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

use crate::types::{ParsedTransaction, Priority, RiskStage, Trend};

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub wallet: String,
    pub signature: String,
    pub sender: String,
    pub receiver: String,
    pub amount_lamports: u64,
    pub timestamp: Option<i64>,
    pub slot: Option<u64>,
}

impl TransactionRecord {
    pub fn to_parsed(&self) -> ParsedTransaction {
        ParsedTransaction {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            amount_lamports: self.amount_lamports,
            timestamp: self.timestamp,
            signature: Some(self.signature.clone()),
            slot: self.slot,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrustScoreRecord {
    pub wallet: String,
    pub score: f64,
    pub computed_at: i64,
    pub metadata_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletProfile {
    pub wallet: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub profile_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedWalletRow {
    pub wallet: String,
    pub priority: Priority,
    pub last_analyzed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRow {
    pub created_at: i64,
    pub severity: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub sender: String,
    pub receiver: String,
    pub tx_count: u64,
    pub total_volume_lamports: u64,
    pub last_seen_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRow {
    pub id: i64,
    pub confidence_score: f64,
    pub reason_tags_json: String,
    pub cluster_risk: Option<f64>,
    pub risk_updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityProfileRow {
    pub entity_id: i64,
    pub cluster_id: i64,
    pub reputation_score: f64,
    pub risk_history_json: Option<String>,
    pub last_updated: i64,
    pub decay_factor: f64,
    pub reason_tags_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationStateRow {
    pub wallet: String,
    pub risk_stage: RiskStage,
    pub escalation_score: f64,
    pub last_alert_ts: Option<i64>,
    pub last_clean_ts: Option<i64>,
    pub state_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReputationStateRow {
    pub wallet: String,
    pub current_score: f64,
    pub avg_7d: Option<f64>,
    pub avg_30d: Option<f64>,
    pub trend: Trend,
    pub volatility: Option<f64>,
    pub decay_factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollingStatsRow {
    pub wallet: String,
    pub window_days: u32,
    pub period_end_ts: i64,
    pub volume_lamports: u64,
    pub tx_count: u64,
    pub anomaly_count: u64,
    pub avg_trust_score: Option<f64>,
    pub alert_count: u64,
}

// ---------------------------------------------------------------- transactions

/// Insert parsed transactions for a wallet. `(wallet, signature)` uniqueness
/// silently drops duplicates; rows without a signature are skipped.
/// Returns the number of rows actually inserted.
pub fn insert_parsed_transactions(
    conn: &Connection,
    wallet: &str,
    txs: &[ParsedTransaction],
) -> Result<u64> {
    let mut inserted = 0_u64;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO transactions
            (wallet, signature, sender, receiver, amount_lamports, timestamp, slot)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for tx in txs {
        let Some(signature) = tx.signature.as_deref() else {
            continue;
        };
        let changed = stmt.execute(rusqlite::params![
            wallet,
            signature,
            tx.sender,
            tx.receiver,
            tx.amount_lamports as i64,
            tx.timestamp,
            tx.slot.map(|s| s as i64),
        ])?;
        inserted += changed as u64;
    }
    Ok(inserted)
}

/// Most recent history slice for a wallet, newest first.
pub fn transaction_history(
    conn: &Connection,
    wallet: &str,
    limit: usize,
) -> Result<Vec<TransactionRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT wallet, signature, sender, receiver, amount_lamports, timestamp, slot
         FROM transactions
         WHERE wallet = ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![wallet, limit as i64], |row| {
        Ok(TransactionRecord {
            wallet: row.get(0)?,
            signature: row.get(1)?,
            sender: row.get(2)?,
            receiver: row.get(3)?,
            amount_lamports: row.get::<_, i64>(4)? as u64,
            timestamp: row.get(5)?,
            slot: row.get::<_, Option<i64>>(6)?.map(|s| s as u64),
        })
    })?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

pub fn transaction_count(conn: &Connection, wallet: &str) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE wallet = ?1",
        [wallet],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

// -------------------------------------------------------------------- profiles

/// Upsert a wallet profile keeping the seen-range monotonic:
/// first_seen only shrinks, last_seen only grows.
pub fn upsert_wallet_profile(conn: &Connection, profile: &WalletProfile) -> Result<()> {
    conn.execute(
        "INSERT INTO wallet_profiles (wallet, first_seen_at, last_seen_at, profile_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(wallet) DO UPDATE SET
            first_seen_at = MIN(first_seen_at, excluded.first_seen_at),
            last_seen_at = MAX(last_seen_at, excluded.last_seen_at),
            profile_json = COALESCE(excluded.profile_json, profile_json),
            updated_at = datetime('now')",
        rusqlite::params![
            profile.wallet,
            profile.first_seen_at,
            profile.last_seen_at,
            profile.profile_json,
        ],
    )?;
    Ok(())
}

pub fn wallet_profile(conn: &Connection, wallet: &str) -> Result<Option<WalletProfile>> {
    let row = conn
        .query_row(
            "SELECT wallet, first_seen_at, last_seen_at, profile_json
             FROM wallet_profiles WHERE wallet = ?1",
            [wallet],
            |row| {
                Ok(WalletProfile {
                    wallet: row.get(0)?,
                    first_seen_at: row.get(1)?,
                    last_seen_at: row.get(2)?,
                    profile_json: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn wallet_profiles_for(
    conn: &Connection,
    wallets: &[String],
) -> Result<HashMap<String, WalletProfile>> {
    let mut out = HashMap::new();
    for w in wallets {
        if let Some(p) = wallet_profile(conn, w)? {
            out.insert(w.clone(), p);
        }
    }
    Ok(out)
}

// ------------------------------------------------------------- tracked wallets

/// Register a wallet for monitoring. Returns true if newly inserted.
pub fn track_wallet(conn: &Connection, wallet: &str, priority: Priority) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO tracked_wallets (wallet, priority) VALUES (?1, ?2)",
        rusqlite::params![wallet, priority.as_str()],
    )?;
    Ok(changed > 0)
}

pub fn is_tracked(conn: &Connection, wallet: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tracked_wallets WHERE wallet = ?1",
        [wallet],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn tracked_wallet_addresses(conn: &Connection, limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT wallet FROM tracked_wallets ORDER BY created_at ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| row.get(0))?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

pub fn tracked_wallets(conn: &Connection, limit: usize) -> Result<Vec<TrackedWalletRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT wallet, priority, last_analyzed_at
         FROM tracked_wallets ORDER BY created_at ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<i64>>(2)?,
        ))
    })?;
    Ok(rows
        .filter_map(std::result::Result::ok)
        .map(|(wallet, priority, last_analyzed_at)| TrackedWalletRow {
            wallet,
            priority: Priority::parse(&priority),
            last_analyzed_at,
        })
        .collect())
}

pub fn set_wallet_priority(conn: &Connection, wallet: &str, priority: Priority) -> Result<()> {
    conn.execute(
        "UPDATE tracked_wallets SET priority = ?2 WHERE wallet = ?1",
        rusqlite::params![wallet, priority.as_str()],
    )?;
    Ok(())
}

pub fn set_last_analyzed(conn: &Connection, wallet: &str, analyzed_at: i64) -> Result<()> {
    conn.execute(
        "UPDATE tracked_wallets SET last_analyzed_at = ?2 WHERE wallet = ?1",
        rusqlite::params![wallet, analyzed_at],
    )?;
    Ok(())
}

pub fn wallet_priorities_for(
    conn: &Connection,
    wallets: &[String],
) -> Result<HashMap<String, Priority>> {
    let mut out = HashMap::new();
    let mut stmt =
        conn.prepare_cached("SELECT priority FROM tracked_wallets WHERE wallet = ?1")?;
    for w in wallets {
        let p: Option<String> = stmt.query_row([w.as_str()], |row| row.get(0)).optional()?;
        if let Some(p) = p {
            out.insert(w.clone(), Priority::parse(&p));
        }
    }
    Ok(out)
}

/// Priority for one wallet; untracked wallets read as `Normal`.
pub fn wallet_priority(conn: &Connection, wallet: &str) -> Result<Priority> {
    let p: Option<String> = conn
        .query_row(
            "SELECT priority FROM tracked_wallets WHERE wallet = ?1",
            [wallet],
            |row| row.get(0),
        )
        .optional()?;
    Ok(p.map_or(Priority::Normal, |s| Priority::parse(&s)))
}

// ---------------------------------------------------------------- trust scores

pub fn insert_trust_score(
    conn: &Connection,
    wallet: &str,
    score: f64,
    computed_at: i64,
    metadata_json: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO trust_scores (wallet, score, computed_at, metadata_json)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![wallet, score, computed_at, metadata_json],
    )?;
    Ok(())
}

/// Latest score for a wallet. Consumers must tolerate equal `computed_at`
/// from concurrent writers, so ties break on the larger rowid.
pub fn latest_trust_score(conn: &Connection, wallet: &str) -> Result<Option<TrustScoreRecord>> {
    let row = conn
        .query_row(
            "SELECT wallet, score, computed_at, metadata_json
             FROM trust_scores
             WHERE wallet = ?1
             ORDER BY computed_at DESC, id DESC
             LIMIT 1",
            [wallet],
            |row| {
                Ok(TrustScoreRecord {
                    wallet: row.get(0)?,
                    score: row.get(1)?,
                    computed_at: row.get(2)?,
                    metadata_json: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn latest_trust_scores_for(
    conn: &Connection,
    wallets: &[String],
) -> Result<HashMap<String, TrustScoreRecord>> {
    let mut out = HashMap::new();
    for w in wallets {
        if let Some(rec) = latest_trust_score(conn, w)? {
            out.insert(w.clone(), rec);
        }
    }
    Ok(out)
}

/// Score timeline for a wallet, newest first, optionally bounded.
pub fn trust_score_timeline(
    conn: &Connection,
    wallet: &str,
    since: Option<i64>,
    until: Option<i64>,
    limit: usize,
) -> Result<Vec<TrustScoreRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT wallet, score, computed_at, metadata_json
         FROM trust_scores
         WHERE wallet = ?1
           AND computed_at >= COALESCE(?2, computed_at)
           AND computed_at <= COALESCE(?3, computed_at)
         ORDER BY computed_at DESC, id DESC
         LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![wallet, since, until, limit as i64],
        |row| {
            Ok(TrustScoreRecord {
                wallet: row.get(0)?,
                score: row.get(1)?,
                computed_at: row.get(2)?,
                metadata_json: row.get(3)?,
            })
        },
    )?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

// ---------------------------------------------------------------------- alerts

pub fn insert_alert(
    conn: &Connection,
    wallet: &str,
    severity: &str,
    reason: &str,
    created_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO alerts (wallet, severity, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![wallet, severity, reason, created_at],
    )?;
    Ok(())
}

/// Cooldown probe: is there an identical `(wallet, severity, reason)` at or
/// after `since`?
pub fn has_recent_alert(
    conn: &Connection,
    wallet: &str,
    severity: &str,
    reason: &str,
    since: i64,
) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM alerts
         WHERE wallet = ?1 AND severity = ?2 AND reason = ?3 AND created_at >= ?4",
        rusqlite::params![wallet, severity, reason, since],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn alerts_for_wallet(
    conn: &Connection,
    wallet: &str,
    since: Option<i64>,
    until: Option<i64>,
    limit: usize,
) -> Result<Vec<AlertRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT created_at, severity, reason
         FROM alerts
         WHERE wallet = ?1
           AND created_at >= COALESCE(?2, created_at)
           AND created_at <= COALESCE(?3, created_at)
         ORDER BY created_at DESC, id DESC
         LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![wallet, since, until, limit as i64],
        |row| {
            Ok(AlertRow {
                created_at: row.get(0)?,
                severity: row.get(1)?,
                reason: row.get(2)?,
            })
        },
    )?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

// ----------------------------------------------------------------------- graph

/// Upsert a directed edge. Self-edges are rejected (no-op, returns false).
pub fn upsert_graph_edge(
    conn: &Connection,
    sender: &str,
    receiver: &str,
    amount_lamports: u64,
    timestamp: i64,
) -> Result<bool> {
    if sender.is_empty() || receiver.is_empty() || sender == receiver {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO wallet_graph_edges
            (sender, receiver, tx_count, total_volume_lamports, last_seen_timestamp)
         VALUES (?1, ?2, 1, ?3, ?4)
         ON CONFLICT(sender, receiver) DO UPDATE SET
            tx_count = tx_count + 1,
            total_volume_lamports = total_volume_lamports + excluded.total_volume_lamports,
            last_seen_timestamp = MAX(last_seen_timestamp, excluded.last_seen_timestamp)",
        rusqlite::params![sender, receiver, amount_lamports as i64, timestamp],
    )?;
    Ok(true)
}

/// Distinct addresses adjacent to `wallet` in either direction.
pub fn graph_adjacent(conn: &Connection, wallet: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT receiver AS other FROM wallet_graph_edges WHERE sender = ?1
         UNION
         SELECT sender AS other FROM wallet_graph_edges WHERE receiver = ?1",
    )?;
    let rows = stmt.query_map([wallet], |row| row.get(0))?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

pub fn graph_edge(conn: &Connection, sender: &str, receiver: &str) -> Result<Option<GraphEdge>> {
    let row = conn
        .query_row(
            "SELECT sender, receiver, tx_count, total_volume_lamports, last_seen_timestamp
             FROM wallet_graph_edges WHERE sender = ?1 AND receiver = ?2",
            rusqlite::params![sender, receiver],
            map_graph_edge,
        )
        .optional()?;
    Ok(row)
}

/// All edges, newest-first by last_seen, bounded for the cluster engine.
pub fn graph_edges_all(conn: &Connection, limit: usize) -> Result<Vec<GraphEdge>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sender, receiver, tx_count, total_volume_lamports, last_seen_timestamp
         FROM wallet_graph_edges
         ORDER BY last_seen_timestamp DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], map_graph_edge)?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

fn map_graph_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
    Ok(GraphEdge {
        sender: row.get(0)?,
        receiver: row.get(1)?,
        tx_count: row.get::<_, i64>(2)? as u64,
        total_volume_lamports: row.get::<_, i64>(3)? as u64,
        last_seen_timestamp: row.get(4)?,
    })
}

// -------------------------------------------------------------------- clusters

/// Clear all clusters and members ahead of a full rebuild.
pub fn delete_all_clusters(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM wallet_cluster_members", [])?;
    conn.execute("DELETE FROM wallet_clusters", [])?;
    Ok(())
}

pub fn insert_cluster(conn: &Connection, confidence: f64, reason_tags_json: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO wallet_clusters (confidence_score, reason_tags_json) VALUES (?1, ?2)",
        rusqlite::params![confidence, reason_tags_json],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_cluster_member(conn: &Connection, cluster_id: i64, wallet: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO wallet_cluster_members (cluster_id, wallet) VALUES (?1, ?2)",
        rusqlite::params![cluster_id, wallet],
    )?;
    Ok(())
}

pub fn cluster_members(conn: &Connection, cluster_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT wallet FROM wallet_cluster_members WHERE cluster_id = ?1 ORDER BY wallet",
    )?;
    let rows = stmt.query_map([cluster_id], |row| row.get(0))?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

pub fn cluster_for_wallet(conn: &Connection, wallet: &str) -> Result<Option<ClusterRow>> {
    let row = conn
        .query_row(
            "SELECT c.id, c.confidence_score, c.reason_tags_json, c.cluster_risk, c.risk_updated_at
             FROM wallet_clusters c
             JOIN wallet_cluster_members m ON m.cluster_id = c.id
             WHERE m.wallet = ?1
             ORDER BY c.id DESC
             LIMIT 1",
            [wallet],
            map_cluster_row,
        )
        .optional()?;
    Ok(row)
}

pub fn cluster_by_id(conn: &Connection, cluster_id: i64) -> Result<Option<ClusterRow>> {
    let row = conn
        .query_row(
            "SELECT id, confidence_score, reason_tags_json, cluster_risk, risk_updated_at
             FROM wallet_clusters WHERE id = ?1",
            [cluster_id],
            map_cluster_row,
        )
        .optional()?;
    Ok(row)
}

pub fn cluster_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM wallet_clusters ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

pub fn clusters_all(conn: &Connection, limit: usize) -> Result<Vec<ClusterRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, confidence_score, reason_tags_json, cluster_risk, risk_updated_at
         FROM wallet_clusters ORDER BY id LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], map_cluster_row)?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

pub fn update_cluster_risk(
    conn: &Connection,
    cluster_id: i64,
    risk: f64,
    updated_at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE wallet_clusters
         SET cluster_risk = ?2, risk_updated_at = ?3, updated_at = datetime('now')
         WHERE id = ?1",
        rusqlite::params![cluster_id, risk, updated_at],
    )?;
    Ok(())
}

fn map_cluster_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClusterRow> {
    Ok(ClusterRow {
        id: row.get(0)?,
        confidence_score: row.get(1)?,
        reason_tags_json: row.get(2)?,
        cluster_risk: row.get(3)?,
        risk_updated_at: row.get(4)?,
    })
}

// ------------------------------------------------------------ entity profiles

pub fn entity_profile(conn: &Connection, entity_id: i64) -> Result<Option<EntityProfileRow>> {
    let row = conn
        .query_row(
            "SELECT entity_id, cluster_id, reputation_score, risk_history_json,
                    last_updated, decay_factor, reason_tags_json
             FROM entity_profiles WHERE entity_id = ?1",
            [entity_id],
            map_entity_row,
        )
        .optional()?;
    Ok(row)
}

pub fn entity_profile_by_cluster(
    conn: &Connection,
    cluster_id: i64,
) -> Result<Option<EntityProfileRow>> {
    let row = conn
        .query_row(
            "SELECT entity_id, cluster_id, reputation_score, risk_history_json,
                    last_updated, decay_factor, reason_tags_json
             FROM entity_profiles WHERE cluster_id = ?1",
            [cluster_id],
            map_entity_row,
        )
        .optional()?;
    Ok(row)
}

pub fn upsert_entity_profile(conn: &Connection, profile: &EntityProfileRow) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_profiles
            (entity_id, cluster_id, reputation_score, risk_history_json,
             last_updated, decay_factor, reason_tags_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(entity_id) DO UPDATE SET
            cluster_id = excluded.cluster_id,
            reputation_score = excluded.reputation_score,
            risk_history_json = excluded.risk_history_json,
            last_updated = excluded.last_updated,
            decay_factor = excluded.decay_factor,
            reason_tags_json = excluded.reason_tags_json",
        rusqlite::params![
            profile.entity_id,
            profile.cluster_id,
            profile.reputation_score,
            profile.risk_history_json,
            profile.last_updated,
            profile.decay_factor,
            profile.reason_tags_json,
        ],
    )?;
    Ok(())
}

pub fn insert_entity_history(
    conn: &Connection,
    entity_id: i64,
    reputation_score: f64,
    reason_tags_json: &str,
    snapshot_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_reputation_history
            (entity_id, reputation_score, reason_tags_json, snapshot_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![entity_id, reputation_score, reason_tags_json, snapshot_at],
    )?;
    Ok(())
}

/// (reputation_score, snapshot_at) pairs, newest first.
pub fn entity_history(conn: &Connection, entity_id: i64, limit: usize) -> Result<Vec<(f64, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT reputation_score, snapshot_at
         FROM entity_reputation_history
         WHERE entity_id = ?1
         ORDER BY snapshot_at DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![entity_id, limit as i64], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    Ok(rows.filter_map(std::result::Result::ok).collect())
}

fn map_entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityProfileRow> {
    Ok(EntityProfileRow {
        entity_id: row.get(0)?,
        cluster_id: row.get(1)?,
        reputation_score: row.get(2)?,
        risk_history_json: row.get(3)?,
        last_updated: row.get(4)?,
        decay_factor: row.get(5)?,
        reason_tags_json: row.get(6)?,
    })
}

// ------------------------------------------------------------------ escalation

pub fn escalation_state(conn: &Connection, wallet: &str) -> Result<Option<EscalationStateRow>> {
    let row = conn
        .query_row(
            "SELECT wallet, risk_stage, escalation_score, last_alert_ts, last_clean_ts, state_json
             FROM wallet_escalation_state WHERE wallet = ?1",
            [wallet],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(
        |(wallet, stage, escalation_score, last_alert_ts, last_clean_ts, state_json)| {
            EscalationStateRow {
                wallet,
                risk_stage: RiskStage::parse(&stage),
                escalation_score,
                last_alert_ts,
                last_clean_ts,
                state_json,
            }
        },
    ))
}

pub fn upsert_escalation_state(conn: &Connection, state: &EscalationStateRow) -> Result<()> {
    conn.execute(
        "INSERT INTO wallet_escalation_state
            (wallet, risk_stage, escalation_score, last_alert_ts, last_clean_ts, state_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
         ON CONFLICT(wallet) DO UPDATE SET
            risk_stage = excluded.risk_stage,
            escalation_score = excluded.escalation_score,
            last_alert_ts = excluded.last_alert_ts,
            last_clean_ts = excluded.last_clean_ts,
            state_json = excluded.state_json,
            updated_at = datetime('now')",
        rusqlite::params![
            state.wallet,
            state.risk_stage.as_str(),
            state.escalation_score,
            state.last_alert_ts,
            state.last_clean_ts,
            state.state_json,
        ],
    )?;
    Ok(())
}

// ------------------------------------------------------------------ reputation

pub fn reputation_state(conn: &Connection, wallet: &str) -> Result<Option<ReputationStateRow>> {
    let row = conn
        .query_row(
            "SELECT wallet, current_score, avg_7d, avg_30d, trend, volatility, decay_factor
             FROM wallet_reputation_state WHERE wallet = ?1",
            [wallet],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(
        |(wallet, current_score, avg_7d, avg_30d, trend, volatility, decay_factor)| {
            ReputationStateRow {
                wallet,
                current_score,
                avg_7d,
                avg_30d,
                trend: Trend::parse(&trend),
                volatility,
                decay_factor,
            }
        },
    ))
}

pub fn upsert_reputation_state(conn: &Connection, state: &ReputationStateRow) -> Result<()> {
    conn.execute(
        "INSERT INTO wallet_reputation_state
            (wallet, current_score, avg_7d, avg_30d, trend, volatility, decay_factor, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
         ON CONFLICT(wallet) DO UPDATE SET
            current_score = excluded.current_score,
            avg_7d = excluded.avg_7d,
            avg_30d = excluded.avg_30d,
            trend = excluded.trend,
            volatility = excluded.volatility,
            decay_factor = excluded.decay_factor,
            updated_at = datetime('now')",
        rusqlite::params![
            state.wallet,
            state.current_score,
            state.avg_7d,
            state.avg_30d,
            state.trend.as_str(),
            state.volatility,
            state.decay_factor,
        ],
    )?;
    Ok(())
}

// --------------------------------------------------------------- rolling stats

pub fn upsert_rolling_stats(conn: &Connection, stats: &RollingStatsRow) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO wallet_rolling_stats
            (wallet, window_days, period_end_ts, volume_lamports, tx_count,
             anomaly_count, avg_trust_score, alert_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            stats.wallet,
            stats.window_days,
            stats.period_end_ts,
            stats.volume_lamports as i64,
            stats.tx_count as i64,
            stats.anomaly_count as i64,
            stats.avg_trust_score,
            stats.alert_count as i64,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db
    }

    fn tx(sender: &str, receiver: &str, amount: u64, ts: i64, sig: &str) -> ParsedTransaction {
        ParsedTransaction {
            sender: sender.into(),
            receiver: receiver.into(),
            amount_lamports: amount,
            timestamp: Some(ts),
            signature: Some(sig.into()),
            slot: Some(1),
        }
    }

    #[test]
    fn test_transaction_insert_dedups_by_wallet_signature() {
        let db = test_db();
        let txs = vec![
            tx("a", "b", 100, 1, "sig1"),
            tx("a", "b", 100, 1, "sig1"), // duplicate
            tx("a", "b", 200, 2, "sig2"),
        ];
        let inserted = insert_parsed_transactions(&db.conn, "w", &txs).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(transaction_count(&db.conn, "w").unwrap(), 2);

        // Re-ingesting the same multiset changes nothing.
        let inserted = insert_parsed_transactions(&db.conn, "w", &txs).unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(transaction_count(&db.conn, "w").unwrap(), 2);
    }

    #[test]
    fn test_transaction_without_signature_skipped() {
        let db = test_db();
        let mut t = tx("a", "b", 100, 1, "sig1");
        t.signature = None;
        let inserted = insert_parsed_transactions(&db.conn, "w", &[t]).unwrap();
        assert_eq!(inserted, 0);
    }

    #[test]
    fn test_transaction_history_newest_first() {
        let db = test_db();
        let txs = vec![
            tx("a", "b", 1, 100, "s1"),
            tx("a", "b", 2, 300, "s3"),
            tx("a", "b", 3, 200, "s2"),
        ];
        insert_parsed_transactions(&db.conn, "w", &txs).unwrap();
        let history = transaction_history(&db.conn, "w", 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].signature, "s3");
        assert_eq!(history[1].signature, "s2");
        assert_eq!(history[2].signature, "s1");

        let limited = transaction_history(&db.conn, "w", 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_graph_edge_upsert_counts_and_monotonic_last_seen() {
        let db = test_db();
        assert!(upsert_graph_edge(&db.conn, "a", "b", 100, 10).unwrap());
        assert!(upsert_graph_edge(&db.conn, "a", "b", 50, 30).unwrap());
        assert!(upsert_graph_edge(&db.conn, "a", "b", 25, 20).unwrap()); // older ts

        let edge = graph_edge(&db.conn, "a", "b").unwrap().unwrap();
        assert_eq!(edge.tx_count, 3);
        assert_eq!(edge.total_volume_lamports, 175);
        assert_eq!(edge.last_seen_timestamp, 30); // max of supplied timestamps
    }

    #[test]
    fn test_graph_edge_rejects_self_edge() {
        let db = test_db();
        assert!(!upsert_graph_edge(&db.conn, "a", "a", 100, 10).unwrap());
        assert!(graph_edge(&db.conn, "a", "a").unwrap().is_none());
    }

    #[test]
    fn test_graph_adjacent_union_of_directions() {
        let db = test_db();
        upsert_graph_edge(&db.conn, "w", "out1", 1, 1).unwrap();
        upsert_graph_edge(&db.conn, "in1", "w", 1, 1).unwrap();
        upsert_graph_edge(&db.conn, "x", "y", 1, 1).unwrap();

        let mut adj = graph_adjacent(&db.conn, "w").unwrap();
        adj.sort();
        assert_eq!(adj, vec!["in1", "out1"]);
    }

    #[test]
    fn test_graph_edges_all_newest_first_with_limit() {
        let db = test_db();
        upsert_graph_edge(&db.conn, "a", "b", 1, 10).unwrap();
        upsert_graph_edge(&db.conn, "c", "d", 1, 30).unwrap();
        upsert_graph_edge(&db.conn, "e", "f", 1, 20).unwrap();

        let edges = graph_edges_all(&db.conn, 2).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].sender, "c");
        assert_eq!(edges[1].sender, "e");
    }

    #[test]
    fn test_latest_trust_score_picks_max_computed_at() {
        let db = test_db();
        insert_trust_score(&db.conn, "w", 80.0, 100, None).unwrap();
        insert_trust_score(&db.conn, "w", 60.0, 300, None).unwrap();
        insert_trust_score(&db.conn, "w", 70.0, 200, None).unwrap();

        let latest = latest_trust_score(&db.conn, "w").unwrap().unwrap();
        assert!((latest.score - 60.0).abs() < f64::EPSILON);
        assert_eq!(latest.computed_at, 300);
    }

    #[test]
    fn test_latest_trust_score_tie_breaks_on_rowid() {
        let db = test_db();
        insert_trust_score(&db.conn, "w", 80.0, 100, None).unwrap();
        insert_trust_score(&db.conn, "w", 60.0, 100, None).unwrap();

        let latest = latest_trust_score(&db.conn, "w").unwrap().unwrap();
        assert!((latest.score - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_trust_score_timeline_window() {
        let db = test_db();
        for (score, ts) in [(90.0, 100), (80.0, 200), (70.0, 300)] {
            insert_trust_score(&db.conn, "w", score, ts, None).unwrap();
        }
        let all = trust_score_timeline(&db.conn, "w", None, None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].computed_at, 300);

        let windowed = trust_score_timeline(&db.conn, "w", Some(150), Some(250), 10).unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].computed_at, 200);
    }

    #[test]
    fn test_wallet_profile_seen_range_monotonic() {
        let db = test_db();
        upsert_wallet_profile(
            &db.conn,
            &WalletProfile {
                wallet: "w".into(),
                first_seen_at: 100,
                last_seen_at: 200,
                profile_json: None,
            },
        )
        .unwrap();
        // Narrower range must not shrink the stored one.
        upsert_wallet_profile(
            &db.conn,
            &WalletProfile {
                wallet: "w".into(),
                first_seen_at: 150,
                last_seen_at: 180,
                profile_json: None,
            },
        )
        .unwrap();
        // Wider range extends both ends.
        upsert_wallet_profile(
            &db.conn,
            &WalletProfile {
                wallet: "w".into(),
                first_seen_at: 50,
                last_seen_at: 400,
                profile_json: None,
            },
        )
        .unwrap();

        let p = wallet_profile(&db.conn, "w").unwrap().unwrap();
        assert_eq!(p.first_seen_at, 50);
        assert_eq!(p.last_seen_at, 400);
    }

    #[test]
    fn test_tracked_wallets_and_priority() {
        let db = test_db();
        assert!(track_wallet(&db.conn, "w1", Priority::Normal).unwrap());
        assert!(!track_wallet(&db.conn, "w1", Priority::Critical).unwrap()); // no overwrite
        assert!(track_wallet(&db.conn, "w2", Priority::Critical).unwrap());

        assert_eq!(wallet_priority(&db.conn, "w1").unwrap(), Priority::Normal);
        set_wallet_priority(&db.conn, "w1", Priority::Watchlist).unwrap();
        assert_eq!(
            wallet_priority(&db.conn, "w1").unwrap(),
            Priority::Watchlist
        );
        // Untracked wallets read as normal.
        assert_eq!(
            wallet_priority(&db.conn, "ghost").unwrap(),
            Priority::Normal
        );

        set_last_analyzed(&db.conn, "w1", 12345).unwrap();
        let rows = tracked_wallets(&db.conn, 10).unwrap();
        let w1 = rows.iter().find(|r| r.wallet == "w1").unwrap();
        assert_eq!(w1.last_analyzed_at, Some(12345));
    }

    #[test]
    fn test_alert_insert_and_cooldown_probe() {
        let db = test_db();
        insert_alert(&db.conn, "w", "high", "too fast", 1000).unwrap();

        assert!(has_recent_alert(&db.conn, "w", "high", "too fast", 500).unwrap());
        assert!(!has_recent_alert(&db.conn, "w", "high", "too fast", 1500).unwrap());
        assert!(!has_recent_alert(&db.conn, "w", "low", "too fast", 500).unwrap());

        let alerts = alerts_for_wallet(&db.conn, "w", None, None, 10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, "high");
    }

    #[test]
    fn test_cluster_lifecycle_and_replace() {
        let db = test_db();
        let id = insert_cluster(&db.conn, 0.6, r#"["bidirectional"]"#).unwrap();
        insert_cluster_member(&db.conn, id, "a").unwrap();
        insert_cluster_member(&db.conn, id, "b").unwrap();

        let members = cluster_members(&db.conn, id).unwrap();
        assert_eq!(members, vec!["a", "b"]);

        let row = cluster_for_wallet(&db.conn, "a").unwrap().unwrap();
        assert_eq!(row.id, id);
        assert!(row.cluster_risk.is_none());

        update_cluster_risk(&db.conn, id, 12.5, 999).unwrap();
        let row = cluster_by_id(&db.conn, id).unwrap().unwrap();
        assert_eq!(row.cluster_risk, Some(12.5));
        assert_eq!(row.risk_updated_at, Some(999));

        delete_all_clusters(&db.conn).unwrap();
        assert!(cluster_for_wallet(&db.conn, "a").unwrap().is_none());
        assert!(cluster_ids(&db.conn).unwrap().is_empty());
    }

    #[test]
    fn test_entity_profile_upsert_and_history() {
        let db = test_db();
        let profile = EntityProfileRow {
            entity_id: 7,
            cluster_id: 7,
            reputation_score: 42.0,
            risk_history_json: Some("[]".into()),
            last_updated: 1000,
            decay_factor: 0.9,
            reason_tags_json: r#"["cluster_contamination"]"#.into(),
        };
        upsert_entity_profile(&db.conn, &profile).unwrap();
        insert_entity_history(&db.conn, 7, 42.0, "[]", 1000).unwrap();
        insert_entity_history(&db.conn, 7, 45.0, "[]", 2000).unwrap();

        let loaded = entity_profile(&db.conn, 7).unwrap().unwrap();
        assert!((loaded.reputation_score - 42.0).abs() < f64::EPSILON);
        assert_eq!(entity_profile_by_cluster(&db.conn, 7).unwrap(), Some(loaded));

        let history = entity_history(&db.conn, 7, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].1, 2000); // newest first
    }

    #[test]
    fn test_escalation_state_roundtrip() {
        let db = test_db();
        assert!(escalation_state(&db.conn, "w").unwrap().is_none());

        let state = EscalationStateRow {
            wallet: "w".into(),
            risk_stage: RiskStage::Warning,
            escalation_score: 42.5,
            last_alert_ts: Some(100),
            last_clean_ts: Some(50),
            state_json: Some(r#"{"reasons":[]}"#.into()),
        };
        upsert_escalation_state(&db.conn, &state).unwrap();
        let loaded = escalation_state(&db.conn, "w").unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_reputation_state_roundtrip() {
        let db = test_db();
        let state = ReputationStateRow {
            wallet: "w".into(),
            current_score: 88.0,
            avg_7d: Some(85.0),
            avg_30d: None,
            trend: Trend::Improving,
            volatility: Some(2.1),
            decay_factor: 0.75,
        };
        upsert_reputation_state(&db.conn, &state).unwrap();
        let loaded = reputation_state(&db.conn, "w").unwrap().unwrap();
        assert_eq!(loaded, state);
    }
}
