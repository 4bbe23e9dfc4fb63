//! Streaming ingestion: WebSocket `accountSubscribe` per tracked wallet →
//! debounce → fetch new signatures and transactions over HTTP → parse →
//! bounded priority queue.
//!
//! Auto-reconnects with exponential backoff; per-wallet debounce coalesces
//! notification bursts into one fetch. Signature dedup uses the same
//! bounded LRU as the polling listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::db::AsyncDb;
use common::rpc::SolanaRpc;
use common::store;
use common::types::Priority;

use crate::listener::SignatureLru;
use crate::parser;
use crate::queue::{WorkItem, WorkQueue};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub debounce: Duration,
    pub signatures_limit: u32,
    pub max_seen_per_wallet: usize,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub ping_interval: Duration,
}

/// What a raw WebSocket text frame means to the pipeline.
#[derive(Debug, PartialEq)]
pub enum StreamMessage {
    /// Reply to a subscribe request: request id → subscription id.
    SubscribeAck { id: u64, subscription: u64 },
    /// Account update for an active subscription.
    Notification { subscription: u64, slot: Option<u64> },
    Other,
}

pub fn build_subscribe_request(id: u64, wallet: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "accountSubscribe",
        "params": [wallet, {"encoding": "base64", "commitment": "confirmed"}],
    })
    .to_string()
}

pub fn parse_stream_message(raw: &str) -> StreamMessage {
    let Ok(msg) = serde_json::from_str::<serde_json::Value>(raw) else {
        return StreamMessage::Other;
    };
    if msg.get("method").and_then(|m| m.as_str()) == Some("accountNotification") {
        let params = msg.get("params");
        let subscription = params
            .and_then(|p| p.get("subscription"))
            .and_then(serde_json::Value::as_u64);
        let slot = params
            .and_then(|p| p.get("result"))
            .and_then(|r| r.get("context"))
            .and_then(|c| c.get("slot"))
            .and_then(serde_json::Value::as_u64);
        if let Some(subscription) = subscription {
            return StreamMessage::Notification { subscription, slot };
        }
        return StreamMessage::Other;
    }
    if let (Some(id), Some(subscription)) = (
        msg.get("id").and_then(serde_json::Value::as_u64),
        msg.get("result").and_then(serde_json::Value::as_u64),
    ) {
        return StreamMessage::SubscribeAck { id, subscription };
    }
    StreamMessage::Other
}

/// Shared context for debounced fetch tasks.
struct FetchContext {
    db: AsyncDb,
    rpc: Arc<SolanaRpc>,
    queue: Arc<WorkQueue>,
    seen: tokio::sync::Mutex<HashMap<String, SignatureLru>>,
    signatures_limit: u32,
    max_seen_per_wallet: usize,
}

/// Run the stream pipeline until cancelled: connect, subscribe to every
/// tracked wallet, debounce notifications into fetches, reconnect with
/// exponential backoff on socket loss.
pub async fn run_stream_pipeline(
    db: AsyncDb,
    rpc: Arc<SolanaRpc>,
    queue: Arc<WorkQueue>,
    config: StreamConfig,
    cancel: CancellationToken,
) {
    let ctx = Arc::new(FetchContext {
        db: db.clone(),
        rpc,
        queue,
        seen: tokio::sync::Mutex::new(HashMap::new()),
        signatures_limit: config.signatures_limit,
        max_seen_per_wallet: config.max_seen_per_wallet,
    });

    let mut backoff = config.reconnect_min;
    let mut run_id = 0_u64;
    while !cancel.is_cancelled() {
        run_id += 1;
        info!(run_id, url = %config.ws_url, "stream connecting");
        match tokio_tungstenite::connect_async(config.ws_url.as_str()).await {
            Ok((socket, _response)) => {
                backoff = config.reconnect_min;
                if let Err(e) = run_connection(socket, &ctx, &config, &cancel, run_id).await {
                    warn!(run_id, error = %e, "stream disconnected");
                }
            }
            Err(e) => {
                warn!(run_id, error = %e, "stream connect failed");
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        info!(run_id, backoff_sec = backoff.as_secs_f64(), "stream reconnect");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
    info!(run_id, "stream stopped");
}

async fn run_connection(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    ctx: &Arc<FetchContext>,
    config: &StreamConfig,
    cancel: &CancellationToken,
    run_id: u64,
) -> Result<()> {
    let (mut write, mut read) = socket.split();

    // Subscribe to every tracked wallet; responses are matched by request id.
    let tracked = ctx
        .db
        .call_named("stream.tracked_wallets", |conn| {
            store::tracked_wallets(conn, 50_000)
        })
        .await?;
    if tracked.is_empty() {
        warn!(run_id, "stream watchlist empty");
    }

    let mut priorities: HashMap<String, Priority> = HashMap::new();
    let mut pending: HashMap<u64, String> = HashMap::new();
    let mut subscriptions: HashMap<u64, String> = HashMap::new();
    let mut debounce_tasks: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    let mut next_id = 0_u64;
    for row in &tracked {
        next_id += 1;
        priorities.insert(row.wallet.clone(), row.priority);
        pending.insert(next_id, row.wallet.clone());
        write
            .send(Message::Text(build_subscribe_request(next_id, &row.wallet)))
            .await
            .context("subscribe send failed")?;
    }
    info!(run_id, wallet_count = tracked.len(), "stream connected");

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // first tick fires immediately; skip it

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break Ok(());
            }
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    break Err(anyhow::Error::from(e).context("ping failed"));
                }
            }
            frame = read.next() => {
                let Some(frame) = frame else {
                    break Err(anyhow::anyhow!("socket closed"));
                };
                match frame {
                    Ok(Message::Text(text)) => match parse_stream_message(&text) {
                        StreamMessage::SubscribeAck { id, subscription } => {
                            if let Some(wallet) = pending.remove(&id) {
                                debug!(run_id, wallet = %wallet, subscription, "subscribed");
                                subscriptions.insert(subscription, wallet);
                            }
                        }
                        StreamMessage::Notification { subscription, slot } => {
                            if let Some(wallet) = subscriptions.get(&subscription) {
                                debug!(run_id, wallet = %wallet, ?slot, "stream event");
                                schedule_fetch(
                                    ctx,
                                    &mut debounce_tasks,
                                    wallet.clone(),
                                    priorities.get(wallet).copied().unwrap_or(Priority::Normal),
                                    config.debounce,
                                );
                            }
                        }
                        StreamMessage::Other => {}
                    },
                    Ok(Message::Ping(payload)) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            break Err(anyhow::Error::from(e).context("pong failed"));
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        break Err(anyhow::anyhow!("server closed connection: {frame:?}"));
                    }
                    Ok(_) => {}
                    Err(e) => break Err(anyhow::Error::from(e).context("socket read failed")),
                }
            }
        }
    };

    for (_, task) in debounce_tasks {
        task.abort();
    }
    result
}

/// Debounce: replace any pending fetch for this wallet with a fresh timer.
fn schedule_fetch(
    ctx: &Arc<FetchContext>,
    tasks: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    wallet: String,
    priority: Priority,
    debounce: Duration,
) {
    if let Some(previous) = tasks.remove(&wallet) {
        previous.abort();
    }
    let ctx = ctx.clone();
    let key = wallet.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        if let Err(e) = fetch_and_push(&ctx, &wallet, priority).await {
            warn!(wallet = %wallet, error = %e, "stream fetch failed");
        }
    });
    tasks.insert(key, handle);
}

/// Fetch new signatures for a wallet, then the transactions behind them,
/// parse and enqueue. Rate limiting lives in the RPC client.
async fn fetch_and_push(ctx: &FetchContext, wallet: &str, priority: Priority) -> Result<()> {
    let infos = ctx
        .rpc
        .get_signatures_for_address(wallet, ctx.signatures_limit, None, "confirmed")
        .await?;

    let new_sigs: Vec<String> = {
        let mut seen = ctx.seen.lock().await;
        let lru = seen
            .entry(wallet.to_string())
            .or_insert_with(|| SignatureLru::new(ctx.max_seen_per_wallet));
        let mut sigs: Vec<String> = infos
            .iter()
            .map(|i| i.signature.clone())
            .filter(|sig| lru.insert(sig))
            .collect();
        sigs.reverse(); // oldest first
        sigs
    };
    if new_sigs.is_empty() {
        debug!(wallet, "no new signatures");
        return Ok(());
    }
    info!(wallet, new_count = new_sigs.len(), "stream signatures fetched");

    for sig in new_sigs {
        let raw = match ctx.rpc.get_transaction(&sig).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                warn!(wallet, signature = %sig, error = %e, "stream tx fetch failed");
                continue;
            }
        };
        let Some(parsed) = parser::parse(&raw) else {
            debug!(wallet, signature = %sig, "stream tx parse skipped");
            continue;
        };
        info!(
            wallet,
            signature = parsed.signature.as_deref().unwrap_or(""),
            slot = ?parsed.slot,
            amount_lamports = parsed.amount_lamports,
            "tx received"
        );
        ctx.queue.push(
            WorkItem::StreamTx {
                wallet: wallet.to_string(),
                tx: parsed,
            },
            priority,
        );
        metrics::counter!("engine_stream_txs_total").increment(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_request_shape() {
        let req = build_subscribe_request(7, "WalletAAA");
        let v: serde_json::Value = serde_json::from_str(&req).unwrap();
        assert_eq!(v["method"], "accountSubscribe");
        assert_eq!(v["id"], 7);
        assert_eq!(v["params"][0], "WalletAAA");
        assert_eq!(v["params"][1]["commitment"], "confirmed");
    }

    #[test]
    fn test_parse_subscribe_ack() {
        let msg = r#"{"jsonrpc":"2.0","result":23784,"id":3}"#;
        assert_eq!(
            parse_stream_message(msg),
            StreamMessage::SubscribeAck {
                id: 3,
                subscription: 23784
            }
        );
    }

    #[test]
    fn test_parse_account_notification() {
        let msg = r#"{
            "jsonrpc": "2.0",
            "method": "accountNotification",
            "params": {
                "subscription": 23784,
                "result": {
                    "context": {"slot": 5199307},
                    "value": {"lamports": 33594}
                }
            }
        }"#;
        assert_eq!(
            parse_stream_message(msg),
            StreamMessage::Notification {
                subscription: 23784,
                slot: Some(5_199_307)
            }
        );
    }

    #[test]
    fn test_parse_garbage_is_other() {
        assert_eq!(parse_stream_message("not json"), StreamMessage::Other);
        assert_eq!(parse_stream_message("{}"), StreamMessage::Other);
        // An error response has an id but no integer result.
        assert_eq!(
            parse_stream_message(r#"{"id":1,"error":{"code":-32602,"message":"bad"}}"#),
            StreamMessage::Other
        );
    }
}
