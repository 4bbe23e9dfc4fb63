//! Risk propagation through the wallet graph.
//!
//! A wallet is penalized by a decayed sum of anomaly contributions from its
//! N-hop neighbors: a neighbor whose latest stored score carries
//! `is_anomalous` contributes `base_penalty * decay^hop`. The total is
//! capped so one wallet's score is not destroyed by many bad neighbors.

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

use common::store;
use common::types::ScoreMetadata;

use crate::graph::neighbors_up_to_hops;

#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Max hop distance (1 = direct neighbors, 2 = neighbors of neighbors).
    pub max_depth: u32,
    /// Risk multiplier per hop: penalty at distance d = base * decay^d.
    pub decay_per_hop: f64,
    /// Penalty for one anomalous neighbor at distance 1 (before decay).
    pub base_penalty: f64,
    /// Cap on the total propagated penalty.
    pub max_penalty: f64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            decay_per_hop: 0.5,
            base_penalty: 6.0,
            max_penalty: 20.0,
        }
    }
}

/// Adjusted trust score after propagating risk from anomalous neighbors.
/// Result is clamped to [0, 100].
pub fn propagate_risk(
    conn: &Connection,
    wallet: &str,
    base_score: f64,
    config: &PropagationConfig,
) -> Result<f64> {
    let neighbor_hops = neighbors_up_to_hops(conn, wallet, config.max_depth)?;
    if neighbor_hops.is_empty() {
        return Ok(base_score.clamp(0.0, 100.0));
    }

    let neighbors: Vec<String> = neighbor_hops.keys().cloned().collect();
    let latest = store::latest_trust_scores_for(conn, &neighbors)?;

    let mut total_penalty = 0.0;
    for neighbor in &neighbors {
        let Some(rec) = latest.get(neighbor) else {
            continue;
        };
        let anomalous = ScoreMetadata::parse(rec.metadata_json.as_deref())
            .is_some_and(|m| m.is_anomalous);
        if !anomalous {
            continue;
        }
        let hop = neighbor_hops[neighbor];
        let decay_factor = config.decay_per_hop.powi(hop as i32);
        let penalty = config.base_penalty * decay_factor;
        total_penalty += penalty;
        info!(
            source_wallet = %neighbor,
            affected_wallet = %wallet,
            hop_distance = hop,
            decay_factor,
            penalty_applied = penalty,
            "risk propagation"
        );
    }

    let total_penalty = total_penalty.min(config.max_penalty);
    Ok((base_score - total_penalty).clamp(0.0, 100.0))
}
