use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use engine::queue::{WorkItem, WorkQueue};
use engine::{cli, cluster, jobs, listener, metrics, publisher, scheduler, stream, worker};

use common::config::Config;
use common::db::{AsyncDb, Database};
use common::rpc::SolanaRpc;
use common::types::Priority;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("trust_engine", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch)?;

    tracing::info!("trust engine starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    if cmd != cli::Command::Run {
        let db = Database::open(&config.database.path)?;
        db.run_migrations()?;
        cli::run_command(&db, cmd)?;
        return Ok(());
    }

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let db = AsyncDb::open(&config.database.path).await?;

    // Merge the configured seed set into the registry, then require a
    // non-empty registry: an engine with nothing to watch is a config error.
    let seeds = config.seed_wallets();
    let tracked_count = db
        .call_named("main.seed_wallets", move |conn| {
            for wallet in &seeds {
                common::store::track_wallet(conn, wallet, Priority::Normal)?;
            }
            Ok(common::store::tracked_wallet_addresses(conn, 10)?.len())
        })
        .await?;
    if tracked_count == 0 {
        anyhow::bail!("no tracked wallets: set ingestion.wallets or register wallets first");
    }

    if config.publisher.enabled && !config.publisher.dry_run {
        // The signing transport is an external integration; this binary
        // only ships the dry-run sender.
        anyhow::bail!(
            "publisher.enabled without dry_run requires an external attestation signer; \
             set publisher.dry_run = true"
        );
    }

    let cancel = CancellationToken::new();
    let work_queue = Arc::new(WorkQueue::new(config.ingestion.queue_maxsize));
    let pipeline_config = Arc::new(worker::PipelineConfig::from_config(&config));
    let worker_state = Arc::new(worker::WorkerState::default());

    let worker_handles = worker::spawn_worker_pool(
        db.clone(),
        work_queue.clone(),
        pipeline_config.clone(),
        worker_state.clone(),
        config.analysis.concurrency,
        cancel.clone(),
    );

    tokio::spawn(worker::run_heartbeat(
        worker_state.clone(),
        work_queue.clone(),
        config.analysis.heartbeat_interval_sec,
        cancel.clone(),
    ));

    // Ingestion: WebSocket stream (canonical) or HTTP polling, same output
    // contract on the work queue.
    match config.ingestion.listen_mode.as_str() {
        "stream" => {
            let http_url = common::rpc::ws_url_to_http(&config.rpc.ws_url);
            let rpc = Arc::new(SolanaRpc::with_url(&http_url, &config.rpc));
            let stream_config = stream::StreamConfig {
                ws_url: config.rpc.ws_url.clone(),
                debounce: Duration::from_secs_f64(config.ingestion.debounce_sec.max(0.0)),
                signatures_limit: config.ingestion.signatures_limit,
                max_seen_per_wallet: config.ingestion.max_seen_per_wallet,
                reconnect_min: Duration::from_secs(config.ingestion.reconnect_min_sec.max(1)),
                reconnect_max: Duration::from_secs(config.ingestion.reconnect_max_sec.max(1)),
                ping_interval: Duration::from_secs(30),
            };
            tokio::spawn(stream::run_stream_pipeline(
                db.clone(),
                rpc,
                work_queue.clone(),
                stream_config,
                cancel.clone(),
            ));
        }
        _ => {
            let rpc = Arc::new(SolanaRpc::new(&config.rpc));
            let listener_config = listener::ListenerConfig {
                poll_interval: Duration::from_secs(config.ingestion.poll_interval_sec.max(1)),
                signatures_limit: config.ingestion.signatures_limit,
                max_seen_per_wallet: config.ingestion.max_seen_per_wallet_poll,
                backoff_min: Duration::from_secs(config.ingestion.reconnect_min_sec.max(1)),
                backoff_max: Duration::from_secs(config.ingestion.reconnect_max_sec.max(1)),
            };
            tokio::spawn(listener::run_polling_listener(
                db.clone(),
                rpc,
                work_queue.clone(),
                listener_config,
                cancel.clone(),
            ));
        }
    }

    // Periodic analysis cycle: scheduler picks the batch, the queue feeds
    // the worker pool. A full cluster rebuild runs every N cycles.
    let (scan_tx, mut scan_rx) = tokio::sync::mpsc::channel::<()>(8);
    let _tickers = jobs::start(vec![jobs::JobSpec {
        name: "analysis_cycle".to_string(),
        interval: Duration::from_secs(config.analysis.scan_interval_sec.max(1)),
        tick: scan_tx,
        run_immediately: true,
    }]);

    {
        let db = db.clone();
        let queue = work_queue.clone();
        let cancel = cancel.clone();
        let scheduler_config = scheduler::SchedulerConfig {
            cycle_interval_sec: config.analysis.scan_interval_sec as f64,
            max_wallets_per_cycle: config.analysis.max_wallets_per_cycle,
            watchlist_every_n_cycles: config.analysis.watchlist_every_n_cycles,
            normal_every_n_cycles: config.analysis.normal_every_n_cycles,
            ..scheduler::SchedulerConfig::default()
        };
        let mode = config.analysis.scheduler_mode.clone();
        let rebuild_every = config.analysis.cluster_rebuild_every_n_cycles;
        tokio::spawn(async move {
            let mut cycle = 0_u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = scan_rx.recv() => { if tick.is_none() { break; } }
                }
                cycle += 1;
                let now_ts = chrono::Utc::now().timestamp();
                let scheduler_config = scheduler_config.clone();
                let mode = mode.clone();
                let batch = db
                    .call_named("scheduler.select", move |conn| {
                        if mode == "rotation" {
                            let wallets = scheduler::select_wallets_for_cycle(
                                conn,
                                cycle,
                                now_ts,
                                &scheduler_config,
                            )?;
                            let priorities =
                                common::store::wallet_priorities_for(conn, &wallets)?;
                            Ok(wallets
                                .into_iter()
                                .map(|w| {
                                    let p = priorities
                                        .get(&w)
                                        .copied()
                                        .unwrap_or(Priority::Normal);
                                    (w, p)
                                })
                                .collect::<Vec<_>>())
                        } else {
                            let batch = scheduler::next_batch(
                                conn,
                                scheduler_config.max_wallets_per_cycle,
                                now_ts,
                                &scheduler_config,
                            )?;
                            Ok(batch
                                .into_iter()
                                .map(|s| {
                                    let p = match s.tier_rank {
                                        3 => Priority::Critical,
                                        2 => Priority::Watchlist,
                                        _ => Priority::Normal,
                                    };
                                    (s.wallet, p)
                                })
                                .collect::<Vec<_>>())
                        }
                    })
                    .await;
                match batch {
                    Ok(batch) => {
                        if !batch.is_empty() {
                            metrics::scheduler_batch();
                            tracing::info!(cycle, batch_size = batch.len(), "analysis cycle");
                        }
                        for (wallet, priority) in batch {
                            queue.push(WorkItem::Analyze { wallet }, priority);
                        }
                    }
                    Err(e) => tracing::error!(cycle, error = %e, "scheduler selection failed"),
                }

                if rebuild_every > 0 && cycle % rebuild_every == 0 {
                    let res = db
                        .call_named("cluster.rebuild", move |conn| {
                            let clusters =
                                cluster::run_clustering(conn, cluster::EDGES_LIMIT, true)?;
                            for c in &clusters {
                                cluster::compute_cluster_risk(conn, c.cluster_id, now_ts)?;
                            }
                            Ok(clusters.len())
                        })
                        .await;
                    match res {
                        Ok(n) => {
                            metrics::clusters_rebuilt();
                            tracing::info!(cycle, clusters = n, "cluster rebuild done");
                        }
                        Err(e) => tracing::error!(cycle, error = %e, "cluster rebuild failed"),
                    }
                }
            }
        });
    }

    if config.publisher.enabled {
        let publisher_config = publisher::PublisherConfig {
            score_delta_threshold: config.publisher.score_delta_threshold,
            max_tx_per_minute: config.publisher.max_tx_per_minute.max(1),
            retry_attempts: config.publisher.retry_attempts,
            retry_backoff: Duration::from_secs_f64(config.publisher.retry_backoff_sec.max(0.0)),
            confirm_timeout: Duration::from_secs(config.publisher.confirm_timeout_sec.max(1)),
            dry_run: config.publisher.dry_run,
            ..publisher::PublisherConfig::default()
        };
        let p = publisher::Publisher::new(db.clone(), publisher::DryRunSender, publisher_config);
        tokio::spawn(publisher::run_publisher(
            p,
            Duration::from_secs(config.publisher.publish_interval_sec.max(1)),
            cancel.clone(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("trust engine stopped");
    Ok(())
}
