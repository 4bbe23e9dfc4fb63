//! Polling listener: periodically fetch signatures for every tracked
//! wallet, deduplicate against a per-wallet LRU, fetch the new
//! transactions, parse and enqueue them.
//!
//! The same output contract as the stream pipeline: `(wallet, tx)` items on
//! the bounded priority queue. RPC errors back off exponentially within
//! bounds and never kill the loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::db::AsyncDb;
use common::rpc::SolanaRpc;
use common::store;
use common::types::Priority;

use crate::parser;
use crate::queue::{WorkItem, WorkQueue};

/// Per-wallet LRU of seen signatures: O(1) membership with bounded memory.
#[derive(Debug, Default)]
pub struct SignatureLru {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SignatureLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.set.contains(signature)
    }

    /// Insert a signature, evicting the oldest when at capacity.
    /// Returns false if it was already present.
    pub fn insert(&mut self, signature: &str) -> bool {
        if self.set.contains(signature) {
            return false;
        }
        if self.set.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(signature.to_string());
        self.order.push_back(signature.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub poll_interval: Duration,
    pub signatures_limit: u32,
    pub max_seen_per_wallet: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

/// Run the polling loop until cancelled. Each cycle visits every tracked
/// wallet with `finalized` commitment and pushes newly seen transactions.
pub async fn run_polling_listener(
    db: AsyncDb,
    rpc: Arc<SolanaRpc>,
    queue: Arc<WorkQueue>,
    config: ListenerConfig,
    cancel: CancellationToken,
) {
    let mut seen: HashMap<String, SignatureLru> = HashMap::new();
    let mut backoff = config.backoff_min;
    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(poll_interval_sec = config.poll_interval.as_secs(), "polling listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let wallets = match db
            .call_named("listener.tracked_wallets", |conn| {
                store::tracked_wallets(conn, 50_000)
            })
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "listener could not load tracked wallets");
                continue;
            }
        };

        let mut cycle_errors = 0_u32;
        for row in &wallets {
            if cancel.is_cancelled() {
                break;
            }
            let lru = seen
                .entry(row.wallet.clone())
                .or_insert_with(|| SignatureLru::new(config.max_seen_per_wallet));
            match poll_wallet(&rpc, &queue, &row.wallet, row.priority, lru, &config).await {
                Ok(pushed) => {
                    if pushed > 0 {
                        metrics::counter!("engine_listener_txs_total").increment(pushed);
                    }
                }
                Err(e) => {
                    cycle_errors += 1;
                    warn!(wallet = %row.wallet, error = %e, "poll failed");
                }
            }
        }

        if cycle_errors > 0 {
            // Whole-cycle backoff on RPC trouble, bounded.
            warn!(cycle_errors, backoff_sec = backoff.as_secs(), "listener cycle had errors; backing off");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(config.backoff_max);
        } else {
            backoff = config.backoff_min;
        }
    }
    info!("polling listener stopped");
}

async fn poll_wallet(
    rpc: &SolanaRpc,
    queue: &WorkQueue,
    wallet: &str,
    priority: Priority,
    lru: &mut SignatureLru,
    config: &ListenerConfig,
) -> anyhow::Result<u64> {
    let infos = rpc
        .get_signatures_for_address(wallet, config.signatures_limit, None, "finalized")
        .await?;

    // Newest first from the RPC; process oldest first so history lands in
    // chronological order.
    let mut new_sigs: Vec<String> = infos
        .iter()
        .map(|i| i.signature.clone())
        .filter(|sig| lru.insert(sig))
        .collect();
    new_sigs.reverse();

    if new_sigs.is_empty() {
        debug!(wallet, "no new signatures");
        return Ok(0);
    }
    info!(wallet, new_count = new_sigs.len(), "signatures fetched");

    let mut pushed = 0_u64;
    for sig in new_sigs {
        let raw = match rpc.get_transaction(&sig).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                warn!(wallet, signature = %sig, error = %e, "tx fetch failed");
                continue;
            }
        };
        let Some(parsed) = parser::parse(&raw) else {
            debug!(wallet, signature = %sig, "tx parse skipped");
            continue;
        };
        queue.push(
            WorkItem::StreamTx {
                wallet: wallet.to_string(),
                tx: parsed,
            },
            priority,
        );
        pushed += 1;
    }
    Ok(pushed)
}
