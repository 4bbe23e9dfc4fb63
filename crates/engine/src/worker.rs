//! Per-wallet analysis pipeline and the worker pool that runs it.
//!
//! Pipeline per unit of work: persist tx → update graph → extract features
//! → detect anomalies → base score → risk propagation → cluster penalty →
//! entity modifier → persist score + profile → alerts → escalation →
//! reputation → rolling stats. Propagation, cluster and entity steps are
//! best-effort: on failure the score reflects the steps that succeeded.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::db::AsyncDb;
use common::store::{self, RollingStatsRow, WalletProfile};
use common::types::{ParsedTransaction, Priority, RiskStage};

use crate::alerts::{evaluate_and_store_alerts, AlertConfig};
use crate::anomaly::{detect_anomalies, AnomalyConfig};
use crate::cluster::apply_cluster_penalty;
use crate::entity::apply_entity_modifier;
use crate::escalation::{update_escalation, EscalationConfig};
use crate::features::extract_features;
use crate::graph::update_wallet_graph;
use crate::propagation::{propagate_risk, PropagationConfig};
use crate::queue::{WorkItem, WorkQueue};
use crate::reputation::update_reputation;
use crate::scorer::compute_trust_score;

const ROLLING_WINDOW_DAYS: u32 = 7;
const SECONDS_PER_DAY: i64 = 86_400;

/// Everything the pipeline needs, injected once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_tx_history: usize,
    pub anomaly: AnomalyConfig,
    pub alert: AlertConfig,
    pub propagation: PropagationConfig,
    pub escalation: EscalationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tx_history: 500,
            anomaly: AnomalyConfig::default(),
            alert: AlertConfig::default(),
            propagation: PropagationConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &common::config::Config) -> Self {
        Self {
            max_tx_history: config.analysis.max_tx_history,
            anomaly: AnomalyConfig::default(),
            alert: AlertConfig {
                trust_score_alert_below: config.alerts.trust_score_alert_below,
                cooldown_sec: config.alerts.cooldown_sec,
                ..AlertConfig::default()
            },
            propagation: PropagationConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }
}

/// Result of one completed analysis, for logging and tests.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub wallet: String,
    pub base_score: f64,
    pub final_score: f64,
    pub is_anomalous: bool,
    pub flag_count: usize,
    pub alerts_stored: u64,
    pub risk_stage: RiskStage,
}

/// Mutable counters shared with the heartbeat task.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub processed: AtomicU64,
    pub errors: AtomicU64,
    pub last_processed_at: AtomicI64,
    pub last_wallet: Mutex<Option<String>>,
}

impl WorkerState {
    fn record_success(&self, wallet: &str, now_ts: i64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.last_processed_at.store(now_ts, Ordering::Relaxed);
        if let Ok(mut last) = self.last_wallet.lock() {
            *last = Some(wallet.to_string());
        }
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Run the full analysis for one wallet against its stored history.
/// Returns None when the wallet has no history yet.
pub fn analyze_wallet(
    conn: &Connection,
    wallet: &str,
    config: &PipelineConfig,
    now_ts: i64,
) -> Result<Option<AnalysisOutcome>> {
    let history = store::transaction_history(conn, wallet, config.max_tx_history)?;
    if history.is_empty() {
        return Ok(None);
    }
    let txs: Vec<ParsedTransaction> = history.iter().map(|r| r.to_parsed()).collect();

    if let Err(e) = update_wallet_graph(conn, &txs) {
        warn!(wallet, error = %e, "graph update failed");
    }

    let features = extract_features(&txs, wallet, 1.0);
    let anomaly_result = detect_anomalies(&features, &config.anomaly);
    let base_score = compute_trust_score(&anomaly_result);

    // Steps 6–8 are best-effort: each failure degrades to the score the
    // preceding steps produced.
    let mut score = match propagate_risk(conn, wallet, base_score, &config.propagation) {
        Ok(s) => s,
        Err(e) => {
            warn!(wallet, error = %e, "risk propagation failed");
            base_score
        }
    };
    score = match apply_cluster_penalty(conn, wallet, score, now_ts) {
        Ok(s) => s,
        Err(e) => {
            warn!(wallet, error = %e, "cluster penalty failed");
            score
        }
    };
    score = match apply_entity_modifier(conn, wallet, score) {
        Ok(s) => s,
        Err(e) => {
            warn!(wallet, error = %e, "entity modifier failed");
            score
        }
    };
    let final_score = round2(score);

    let metadata = serde_json::json!({
        "anomaly_flags": anomaly_result.flags_json(),
        "is_anomalous": anomaly_result.is_anomalous,
        "tx_count": features.tx_count,
    })
    .to_string();
    store::insert_trust_score(conn, wallet, final_score, now_ts, Some(&metadata))?;

    let ts_min = history
        .iter()
        .filter_map(|r| r.timestamp)
        .min()
        .unwrap_or(now_ts);
    let ts_max = history
        .iter()
        .filter_map(|r| r.timestamp)
        .max()
        .unwrap_or(now_ts);
    store::upsert_wallet_profile(
        conn,
        &WalletProfile {
            wallet: wallet.to_string(),
            first_seen_at: ts_min,
            last_seen_at: ts_max,
            profile_json: None,
        },
    )?;

    let alerts_stored =
        evaluate_and_store_alerts(conn, wallet, final_score, &anomaly_result, &config.alert, now_ts)?;
    let risk_stage =
        update_escalation(conn, wallet, &anomaly_result, &config.escalation, now_ts)?;

    if let Err(e) = update_reputation(conn, wallet, final_score, now_ts) {
        warn!(wallet, error = %e, "reputation update failed");
    }
    if let Err(e) = update_rolling_stats(conn, wallet, &txs, &anomaly_result.flags_json(), now_ts) {
        warn!(wallet, error = %e, "rolling stats update failed");
    }

    // First successful score auto-tracks the wallet.
    if !store::is_tracked(conn, wallet)? {
        store::track_wallet(conn, wallet, Priority::Normal)?;
    }
    store::set_last_analyzed(conn, wallet, now_ts)?;

    let outcome = AnalysisOutcome {
        wallet: wallet.to_string(),
        base_score,
        final_score,
        is_anomalous: anomaly_result.is_anomalous,
        flag_count: anomaly_result.flags.len(),
        alerts_stored,
        risk_stage,
    };
    info!(
        wallet,
        trust_score = final_score,
        base_score,
        is_anomalous = outcome.is_anomalous,
        tx_count = features.tx_count,
        alerts_stored,
        risk_stage = risk_stage.as_str(),
        "wallet analyzed"
    );
    Ok(Some(outcome))
}

fn update_rolling_stats(
    conn: &Connection,
    wallet: &str,
    txs: &[ParsedTransaction],
    flags: &[serde_json::Value],
    now_ts: i64,
) -> Result<()> {
    let since = now_ts - i64::from(ROLLING_WINDOW_DAYS) * SECONDS_PER_DAY;
    let (mut volume, mut count) = (0_u64, 0_u64);
    for tx in txs {
        if tx.timestamp.is_some_and(|ts| ts >= since) {
            volume = volume.saturating_add(tx.amount_lamports);
            count += 1;
        }
    }
    let timeline = store::trust_score_timeline(conn, wallet, Some(since), Some(now_ts), 1000)?;
    let avg_trust_score = (!timeline.is_empty())
        .then(|| timeline.iter().map(|r| r.score).sum::<f64>() / timeline.len() as f64);
    let alert_count = store::alerts_for_wallet(conn, wallet, Some(since), None, 1000)?.len() as u64;

    store::upsert_rolling_stats(
        conn,
        &RollingStatsRow {
            wallet: wallet.to_string(),
            window_days: ROLLING_WINDOW_DAYS,
            period_end_ts: now_ts - now_ts.rem_euclid(SECONDS_PER_DAY),
            volume_lamports: volume,
            tx_count: count,
            anomaly_count: flags.len() as u64,
            avg_trust_score,
            alert_count,
        },
    )
}

/// Handle one stream item: persist the transaction, then (if it was new)
/// run the full analysis. Duplicate signatures contribute nothing.
pub fn process_stream_tx(
    conn: &Connection,
    wallet: &str,
    tx: &ParsedTransaction,
    config: &PipelineConfig,
    now_ts: i64,
) -> Result<Option<AnalysisOutcome>> {
    let inserted = store::insert_parsed_transactions(conn, wallet, std::slice::from_ref(tx))?;
    if inserted == 0 {
        return Ok(None);
    }
    analyze_wallet(conn, wallet, config, now_ts)
}

/// Spawn `concurrency` worker tasks draining the shared queue. Each worker
/// finishes its in-flight analysis before honoring shutdown.
pub fn spawn_worker_pool(
    db: AsyncDb,
    queue: Arc<WorkQueue>,
    config: Arc<PipelineConfig>,
    state: Arc<WorkerState>,
    concurrency: usize,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|worker_id| {
            let db = db.clone();
            let queue = queue.clone();
            let config = config.clone();
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = queue.pop() => item,
                    };
                    let wallet = item.wallet().to_string();
                    let now_ts = chrono::Utc::now().timestamp();
                    let config = config.clone();
                    let result = db
                        .call_named("worker.analyze", move |conn| match item {
                            WorkItem::StreamTx { wallet, tx } => {
                                process_stream_tx(conn, &wallet, &tx, &config, now_ts)
                            }
                            WorkItem::Analyze { wallet } => {
                                analyze_wallet(conn, &wallet, &config, now_ts)
                            }
                        })
                        .await;
                    match result {
                        Ok(Some(_)) => {
                            state.record_success(&wallet, now_ts);
                            metrics::counter!("engine_wallets_analyzed_total").increment(1);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            state.record_error();
                            warn!(worker_id, wallet = %wallet, error = %e, "analysis failed");
                        }
                    }
                }
                info!(worker_id, "worker stopped");
            })
        })
        .collect()
}

/// Heartbeat: periodic log line plus gauges, until cancelled.
pub async fn run_heartbeat(
    state: Arc<WorkerState>,
    queue: Arc<WorkQueue>,
    interval_sec: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_sec.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let processed = state.processed.load(Ordering::Relaxed);
        let errors = state.errors.load(Ordering::Relaxed);
        let last_wallet = state.last_wallet.lock().ok().and_then(|w| w.clone());
        metrics::gauge!("engine_worker_processed").set(processed as f64);
        metrics::gauge!("engine_worker_errors").set(errors as f64);
        metrics::gauge!("engine_queue_depth").set(queue.len() as f64);
        info!(
            processed,
            errors,
            queue_depth = queue.len(),
            last_wallet = last_wallet.as_deref().unwrap_or("-"),
            last_processed_at = state.last_processed_at.load(Ordering::Relaxed),
            "worker heartbeat"
        );
    }
}
