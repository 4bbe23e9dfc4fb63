//! Wallet relationship graph: directed sender → receiver edges with
//! aggregate stats, updated from the history slice on every analysis.
//!
//! Idempotence caveat: counters are only correct if each transaction is
//! passed once; duplicates inflate `tx_count`. The worker feeds edges from
//! the deduplicated transaction table, which satisfies that.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use common::store;
use common::types::ParsedTransaction;

/// Update graph edges from a list of transactions. Skips rows with missing
/// endpoints or self-transfers. Returns the number of edges touched.
pub fn update_wallet_graph(conn: &Connection, transactions: &[ParsedTransaction]) -> Result<u64> {
    let mut updated = 0_u64;
    for tx in transactions {
        let sender = tx.sender.trim();
        let receiver = tx.receiver.trim();
        if sender.is_empty() || receiver.is_empty() || sender == receiver {
            continue;
        }
        let ts = tx.timestamp.unwrap_or(0);
        if store::upsert_graph_edge(conn, sender, receiver, tx.amount_lamports, ts)? {
            updated += 1;
        }
    }
    if updated > 0 {
        debug!(tx_count = transactions.len(), edges_updated = updated, "wallet graph updated");
    }
    Ok(updated)
}

/// All wallets within `max_hops` of `wallet` over the undirected adjacency,
/// mapped to their hop distance. BFS with a visited set; the start wallet
/// itself is excluded.
pub fn neighbors_up_to_hops(
    conn: &Connection,
    wallet: &str,
    max_hops: u32,
) -> Result<HashMap<String, u32>> {
    let mut result = HashMap::new();
    if max_hops == 0 {
        return Ok(result);
    }
    let start = wallet.trim().to_string();
    let mut seen = std::collections::HashSet::new();
    seen.insert(start.clone());
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    queue.push_back((start, 0));

    while let Some((w, d)) = queue.pop_front() {
        if d >= max_hops {
            continue;
        }
        for other in store::graph_adjacent(conn, &w)? {
            if !seen.insert(other.clone()) {
                continue;
            }
            let hop = d + 1;
            result.insert(other.clone(), hop);
            queue.push_back((other, hop));
        }
    }
    Ok(result)
}
