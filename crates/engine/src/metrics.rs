use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

const HISTOGRAM_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub fn describe() {
    describe_counter!(
        "tracing_error_events",
        "Cumulative count of all ERROR-level tracing events."
    );
    describe_histogram!(
        "engine_db_query_latency_ms",
        "SQLite DB operation total latency in milliseconds (queue wait + execution)."
    );
    describe_counter!("engine_db_query_errors_total", "SQLite DB operation errors.");
    describe_counter!(
        "engine_wallets_analyzed_total",
        "Wallet analyses completed by the worker pool."
    );
    describe_counter!(
        "engine_listener_txs_total",
        "Transactions enqueued by the polling listener."
    );
    describe_counter!(
        "engine_stream_txs_total",
        "Transactions enqueued by the stream pipeline."
    );
    describe_counter!(
        "engine_queue_dropped_total",
        "Work items dropped by queue backpressure, labeled by reason."
    );
    describe_gauge!("engine_queue_depth", "Current work queue depth.");
    describe_gauge!("engine_worker_processed", "Analyses completed since start.");
    describe_gauge!("engine_worker_errors", "Analyses failed since start.");
    describe_counter!(
        "engine_oracle_cache_hits_total",
        "Oracle lookups served from the TTL cache."
    );
    describe_counter!(
        "engine_oracle_rate_limited_total",
        "Oracle lookups refused by the rate limiter."
    );
    describe_counter!(
        "engine_publisher_sent_total",
        "Attestation transactions sent to the ledger."
    );
    describe_counter!(
        "engine_publisher_rate_limited_total",
        "Publisher chunks deferred by the per-minute cap."
    );
    describe_counter!(
        "engine_scheduler_batches_total",
        "Scheduler cycles that selected at least one wallet."
    );
    describe_counter!(
        "engine_clusters_rebuilt_total",
        "Full cluster rebuilds completed."
    );
}

// Counter helpers for the crate root, where `metrics::` is this module.
pub fn scheduler_batch() {
    metrics::counter!("engine_scheduler_batches_total").increment(1);
}

pub fn clusters_rebuilt() {
    metrics::counter!("engine_clusters_rebuilt_total").increment(1);
}

pub fn install_prometheus(port: u16) -> Result<()> {
    // Bind to localhost by default: the metrics endpoint stays private on
    // the host and scrapers reach it via localhost.
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Prefix("engine_".to_string()), HISTOGRAM_BUCKETS_MS)
        .map_err(anyhow::Error::from)?
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::msg)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        describe();

        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("engine_wallets_analyzed_total").increment(1);
            metrics::counter!("tracing_error_events").increment(1);
            metrics::counter!("engine_queue_dropped_total", "reason" => "full").increment(1);
            metrics::gauge!("engine_queue_depth").set(3.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("engine_wallets_analyzed_total"));
        assert!(rendered.contains("tracing_error_events"));
        assert!(rendered.contains(r#"reason="full""#));
        assert!(rendered.contains("engine_queue_depth"));
    }

    #[test]
    fn test_describe_registers_help_lines() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("engine_publisher_sent_total").increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("# HELP engine_publisher_sent_total"));
    }
}
