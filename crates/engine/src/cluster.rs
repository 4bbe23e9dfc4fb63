//! Heuristic identity clustering: group wallets that likely belong to the
//! same entity, from graph edges alone.
//!
//! Candidate sets come from bidirectional flow, shared funding, fan-out,
//! burst co-timing and 2-cycles; overlapping sets are merged until fixpoint.
//! Rebuild is full-replace: clear clusters and members, then insert. Cluster
//! risk feeds the member penalty and the entity reputation update.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::Result;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use common::store::{self, GraphEdge};
use common::types::ScoreMetadata;

pub const REASON_BIDIRECTIONAL: &str = "bidirectional";
pub const REASON_SHARED_FUNDING: &str = "shared_funding";
pub const REASON_FAN_IN_OUT: &str = "fan_in_out";
pub const REASON_BURST_TIMING: &str = "burst_timing";
pub const REASON_CIRCULAR: &str = "circular";

pub const MIN_BIDIRECTIONAL_TX: u64 = 2;
pub const MIN_FAN_SIZE: usize = 2;
pub const BURST_WINDOW_SEC: i64 = 86_400 * 7;
pub const MIN_CONFIDENCE: f64 = 0.3;
pub const MAX_CLUSTER_PENALTY: f64 = 15.0;
pub const CLUSTER_RISK_FACTOR: f64 = 0.25;
pub const EDGES_LIMIT: usize = 50_000;
const MAX_BURST_BUCKETS: usize = 50;
const RISKY_SCORE_BELOW: f64 = 70.0;

/// Identity cluster: wallets likely controlled by one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub cluster_id: i64,
    pub wallet_ids: Vec<String>,
    pub confidence_score: f64,
    pub reason_tags: Vec<String>,
}

type EdgeLookup = HashMap<(String, String), (u64, u64, i64)>;

fn edges_to_lookup(edges: &[GraphEdge]) -> EdgeLookup {
    let mut lookup = EdgeLookup::new();
    for e in edges {
        let s = e.sender.trim();
        let r = e.receiver.trim();
        if s.is_empty() || r.is_empty() || s == r {
            continue;
        }
        lookup.insert(
            (s.to_string(), r.to_string()),
            (e.tx_count, e.total_volume_lamports, e.last_seen_timestamp),
        );
    }
    lookup
}

/// Pairs {a, b} where both directions exist with tx_count >= 2 each.
fn find_bidirectional(lookup: &EdgeLookup) -> Vec<BTreeSet<String>> {
    let mut pairs = Vec::new();
    let mut seen: HashSet<BTreeSet<String>> = HashSet::new();
    for ((a, b), (tc, _, _)) in lookup {
        if a >= b {
            continue;
        }
        let Some((tc_rev, _, _)) = lookup.get(&(b.clone(), a.clone())) else {
            continue;
        };
        if *tc >= MIN_BIDIRECTIONAL_TX && *tc_rev >= MIN_BIDIRECTIONAL_TX {
            let set: BTreeSet<String> = [a.clone(), b.clone()].into_iter().collect();
            if seen.insert(set.clone()) {
                pairs.push(set);
            }
        }
    }
    pairs
}

fn sender_to_receivers(lookup: &EdgeLookup) -> HashMap<&str, BTreeSet<&str>> {
    let mut map: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for ((s, r), (tc, _, _)) in lookup {
        if *tc < 1 {
            continue;
        }
        map.entry(s.as_str()).or_default().insert(r.as_str());
    }
    map
}

/// Receivers that share one funding source (fan-in from a single sender).
fn find_shared_funding(lookup: &EdgeLookup) -> Vec<BTreeSet<String>> {
    sender_to_receivers(lookup)
        .values()
        .filter(|receivers| receivers.len() >= MIN_FAN_SIZE)
        .map(|receivers| receivers.iter().map(|r| (*r).to_string()).collect())
        .collect()
}

/// Sender plus its receivers when it fans out to multiple wallets.
fn find_fan_out(lookup: &EdgeLookup) -> Vec<BTreeSet<String>> {
    sender_to_receivers(lookup)
        .iter()
        .filter(|(_, receivers)| receivers.len() >= MIN_FAN_SIZE)
        .map(|(sender, receivers)| {
            let mut set: BTreeSet<String> = receivers.iter().map(|r| (*r).to_string()).collect();
            set.insert((*sender).to_string());
            set
        })
        .collect()
}

/// Endpoints of edges whose last_seen falls in the same 7-day bucket.
fn find_burst_timing(lookup: &EdgeLookup, window_sec: i64) -> Vec<BTreeSet<String>> {
    let mut buckets: HashMap<i64, BTreeSet<String>> = HashMap::new();
    for ((s, r), (_, _, ts)) in lookup {
        if *ts <= 0 {
            continue;
        }
        let bucket = ts / window_sec;
        let entry = buckets.entry(bucket).or_default();
        entry.insert(s.clone());
        entry.insert(r.clone());
    }
    let mut out: Vec<(i64, BTreeSet<String>)> = buckets
        .into_iter()
        .filter(|(_, wallets)| wallets.len() >= MIN_FAN_SIZE)
        .collect();
    out.sort_by_key(|(bucket, _)| *bucket);
    out.into_iter()
        .take(MAX_BURST_BUCKETS)
        .map(|(_, wallets)| wallets)
        .collect()
}

/// Merge overlapping candidate sets until fixpoint; evidence tags are
/// concatenated with order-preserving dedup.
fn merge_cluster_sets(
    mut candidates: Vec<(BTreeSet<String>, Vec<String>)>,
) -> Vec<(BTreeSet<String>, Vec<String>)> {
    let mut merged: Vec<(BTreeSet<String>, Vec<String>)> = Vec::new();
    while !candidates.is_empty() {
        let (mut current, mut tags) = candidates.remove(0);
        let mut changed = true;
        while changed {
            changed = false;
            let mut rest = Vec::with_capacity(candidates.len());
            for (set, set_tags) in candidates {
                if current.intersection(&set).next().is_some() {
                    current.extend(set);
                    for t in set_tags {
                        if !tags.contains(&t) {
                            tags.push(t);
                        }
                    }
                    changed = true;
                } else {
                    rest.push((set, set_tags));
                }
            }
            candidates = rest;
        }
        if current.len() >= 2 && !merged.iter().any(|(s, _)| *s == current) {
            merged.push((current, tags));
        }
    }
    merged
}

/// More evidence kinds and more members → higher confidence, capped at 1.
fn confidence_from_reasons(reason_tags: &[String], size: usize) -> f64 {
    let size_bonus = 0.05 * (size.saturating_sub(2)).min(4) as f64;
    let base = 0.4 + 0.1 * reason_tags.len() as f64 + size_bonus;
    (base.min(1.0) * 100.0).round() / 100.0
}

/// Build clusters from graph edges and persist them.
///
/// With `replace` (the default mode) existing clusters are cleared first
/// for a full recompute. Returns the persisted clusters.
pub fn run_clustering(conn: &Connection, edges_limit: usize, replace: bool) -> Result<Vec<Cluster>> {
    if replace {
        store::delete_all_clusters(conn)?;
    }
    let edges = store::graph_edges_all(conn, edges_limit)?;
    if edges.is_empty() {
        return Ok(Vec::new());
    }
    let lookup = edges_to_lookup(&edges);

    let mut candidates: Vec<(BTreeSet<String>, Vec<String>)> = Vec::new();
    for set in find_bidirectional(&lookup) {
        candidates.push((set, vec![REASON_BIDIRECTIONAL.to_string()]));
    }
    for set in find_shared_funding(&lookup) {
        candidates.push((set, vec![REASON_SHARED_FUNDING.to_string()]));
    }
    for set in find_fan_out(&lookup) {
        candidates.push((set, vec![REASON_FAN_IN_OUT.to_string()]));
    }
    for set in find_burst_timing(&lookup, BURST_WINDOW_SEC) {
        candidates.push((set, vec![REASON_BURST_TIMING.to_string()]));
    }
    // 2-cycles coincide with bidirectional pairs; kept as a distinct
    // evidence tag.
    for set in find_bidirectional(&lookup) {
        candidates.push((set, vec![REASON_CIRCULAR.to_string()]));
    }

    let merged = merge_cluster_sets(candidates);

    let mut result = Vec::new();
    for (wallet_set, reason_tags) in merged {
        if wallet_set.len() < 2 {
            continue;
        }
        let confidence = confidence_from_reasons(&reason_tags, wallet_set.len());
        if confidence < MIN_CONFIDENCE {
            continue;
        }
        let tags_json = serde_json::to_string(&reason_tags)?;
        let cluster_id = store::insert_cluster(conn, confidence, &tags_json)?;
        info!(
            cluster_id,
            wallet_count = wallet_set.len(),
            confidence_score = confidence,
            reason_tags = ?reason_tags,
            "cluster created"
        );
        let wallet_ids: Vec<String> = wallet_set.into_iter().collect();
        for w in &wallet_ids {
            store::insert_cluster_member(conn, cluster_id, w)?;
            debug!(cluster_id, wallet = %w, "wallet added to cluster");
        }
        result.push(Cluster {
            cluster_id,
            wallet_ids,
            confidence_score: confidence,
            reason_tags,
        });
    }
    Ok(result)
}

/// Compute and persist the risk of one cluster from its members' latest
/// scores. A member is risky when its score is under 70 or its metadata is
/// anomalous. Triggers the entity reputation update (best-effort).
pub fn compute_cluster_risk(conn: &Connection, cluster_id: i64, now_ts: i64) -> Result<f64> {
    let members = store::cluster_members(conn, cluster_id)?;
    if members.is_empty() {
        return Ok(0.0);
    }
    let latest = store::latest_trust_scores_for(conn, &members)?;

    let mut scores = Vec::new();
    let mut risky: HashSet<&str> = HashSet::new();
    for w in &members {
        let Some(rec) = latest.get(w) else {
            continue;
        };
        scores.push(rec.score);
        if rec.score < RISKY_SCORE_BELOW {
            risky.insert(w);
        }
        if ScoreMetadata::parse(rec.metadata_json.as_deref()).is_some_and(|m| m.is_anomalous) {
            risky.insert(w);
        }
    }

    let risky_count = risky.len();
    let risk = if scores.is_empty() && risky_count == 0 {
        0.0
    } else {
        let min_score = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let min_score = if min_score.is_finite() { min_score } else { 100.0 };
        let mut risk = (100.0 - min_score) * CLUSTER_RISK_FACTOR;
        if risky_count > 0 {
            risk = (risk + risky_count as f64 * 2.0).min(MAX_CLUSTER_PENALTY);
        }
        ((risk.min(MAX_CLUSTER_PENALTY)) * 100.0).round() / 100.0
    };

    store::update_cluster_risk(conn, cluster_id, risk, now_ts)?;
    info!(
        cluster_id,
        cluster_risk = risk,
        member_count = members.len(),
        risky_count,
        "cluster risk updated"
    );

    if let Err(e) = crate::entity::update_entity_reputation_from_cluster(conn, cluster_id, now_ts) {
        warn!(cluster_id, error = %e, "entity reputation update failed");
    }

    Ok(risk)
}

/// Cluster risk penalty for a wallet: 0 when not clustered, otherwise the
/// stored (or freshly computed) cluster risk capped at 15.
pub fn cluster_penalty_for_wallet(conn: &Connection, wallet: &str, now_ts: i64) -> Result<f64> {
    let Some(row) = store::cluster_for_wallet(conn, wallet)? else {
        return Ok(0.0);
    };
    if let Some(stored) = row.cluster_risk {
        if stored > 0.0 {
            return Ok(stored.min(MAX_CLUSTER_PENALTY));
        }
    }
    let risk = compute_cluster_risk(conn, row.id, now_ts)?;
    Ok(risk.min(MAX_CLUSTER_PENALTY))
}

/// Score after the cluster penalty, clamped to [0, 100].
pub fn apply_cluster_penalty(
    conn: &Connection,
    wallet: &str,
    score_after_graph: f64,
    now_ts: i64,
) -> Result<f64> {
    let penalty = cluster_penalty_for_wallet(conn, wallet, now_ts)?;
    Ok((score_after_graph - penalty).clamp(0.0, 100.0))
}
