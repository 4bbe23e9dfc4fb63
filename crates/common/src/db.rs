use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;

/// Busy timeout once the connection is serving normal traffic.
const RUNTIME_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
/// Short per-attempt busy timeout during schema setup, so lock handling
/// happens in the retry loop rather than inside SQLite.
const SETUP_BUSY_TIMEOUT: Duration = Duration::from_secs(2);
/// Schema-setup retry bounds: linear backoff, `attempt * STEP` per wait.
const SETUP_MAX_ATTEMPTS: u32 = 8;
const SETUP_BACKOFF_STEP: Duration = Duration::from_secs(5);

pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// All SQLite work runs on one dedicated background thread, which keeps
/// the Tokio runtime cooperative and serializes writers. Clone is cheap
/// (shared mpsc sender to that thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

/// Apply pragmas, the schema batch, and additive column migrations.
/// Idempotent; both open paths funnel through here.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(SCHEMA)?;
    migrate_clusters_risk_columns(conn)?;
    migrate_escalation_state_json(conn)?;
    Ok(())
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Collapse the channel-level error wrapper into one `anyhow::Error`.
fn flatten_call_error(e: tokio_rusqlite::Error<anyhow::Error>) -> anyhow::Error {
    match e {
        tokio_rusqlite::Error::Error(err) => err,
        tokio_rusqlite::Error::ConnectionClosed => anyhow::anyhow!("database connection closed"),
        tokio_rusqlite::Error::Close((_, err)) => anyhow::anyhow!("database close error: {err}"),
        other => anyhow::anyhow!("database error: {other}"),
    }
}

impl AsyncDb {
    /// Open a database at `path` and bring the schema up to date on the
    /// background thread.
    ///
    /// Schema setup takes a write lock and can collide with concurrent
    /// readers (CLI sessions, admin sqlite3 shells, deploy checks). A
    /// hard failure here would crash-loop under a process supervisor, so
    /// locked databases get a bounded number of retries before giving up.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(SETUP_BUSY_TIMEOUT)?;
                    init_schema(conn)?;
                    conn.busy_timeout(RUNTIME_BUSY_TIMEOUT)?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err))
                    if is_locked(&err) && attempt < SETUP_MAX_ATTEMPTS =>
                {
                    let wait = SETUP_BACKOFF_STEP * attempt;
                    tracing::warn!(
                        attempt,
                        wait = ?wait,
                        "database locked during schema setup; retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(tokio_rusqlite::Error::Error(err)) => {
                    return Err(
                        anyhow::Error::from(err).context("AsyncDb::open: schema setup failed")
                    );
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    ///
    /// The closure receives `&mut rusqlite::Connection` and can perform
    /// arbitrary sync SQLite operations; the result comes back over a
    /// oneshot channel.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| function(conn))
            .await
            .map_err(flatten_call_error)
    }

    /// Like [`Self::call`], with Prometheus latency/error metrics.
    ///
    /// Latency is wall-clock for the whole operation: queueing behind the
    /// background thread plus every statement in the closure.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("engine_db_query_latency_ms", "op" => op, "status" => status)
            .record(start.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            metrics::counter!("engine_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Sync callers (CLI reads) just wait out short locks.
        conn.busy_timeout(RUNTIME_BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        init_schema(&self.conn)?;
        Ok(())
    }
}

/// Add cluster_risk / risk_updated_at to wallet_clusters if missing
/// (for DBs created before cluster risk landed).
fn migrate_clusters_risk_columns(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let required: [(&str, &str); 2] = [
        ("cluster_risk", "REAL"),
        ("risk_updated_at", "INTEGER"),
    ];
    for (name, ty) in required {
        let has: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('wallet_clusters') WHERE name=?1",
            rusqlite::params![name],
            |row| row.get(0),
        )?;
        if has == 0 {
            conn.execute(
                &format!("ALTER TABLE wallet_clusters ADD COLUMN {name} {ty}"),
                [],
            )?;
        }
    }
    Ok(())
}

/// Add state_json to wallet_escalation_state if missing.
fn migrate_escalation_state_json(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let has: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('wallet_escalation_state') WHERE name='state_json'",
        [],
        |row| row.get(0),
    )?;
    if has == 0 {
        conn.execute(
            "ALTER TABLE wallet_escalation_state ADD COLUMN state_json TEXT",
            [],
        )?;
    }
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wallet_profiles (
    wallet TEXT PRIMARY KEY,
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    profile_json TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tracked_wallets (
    wallet TEXT PRIMARY KEY,
    priority TEXT NOT NULL DEFAULT 'normal',   -- critical | watchlist | normal
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_analyzed_at INTEGER
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,                      -- tracked wallet this row was ingested for
    signature TEXT NOT NULL,
    sender TEXT NOT NULL,
    receiver TEXT NOT NULL,
    amount_lamports INTEGER NOT NULL,
    timestamp INTEGER,                         -- blockTime, unix seconds
    slot INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet, signature)
);

CREATE TABLE IF NOT EXISTS trust_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    score REAL NOT NULL,
    computed_at INTEGER NOT NULL,
    metadata_json TEXT                         -- anomaly flags snapshot, is_anomalous, tx_count
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    severity TEXT NOT NULL,                    -- low|medium|high|critical|risk_score
    reason TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS wallet_escalation_state (
    wallet TEXT PRIMARY KEY,
    risk_stage TEXT NOT NULL DEFAULT 'normal', -- normal | warning | critical
    escalation_score REAL NOT NULL DEFAULT 0.0,
    last_alert_ts INTEGER,
    last_clean_ts INTEGER,
    state_json TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wallet_reputation_state (
    wallet TEXT PRIMARY KEY,
    current_score REAL NOT NULL,
    avg_7d REAL,
    avg_30d REAL,
    trend TEXT NOT NULL DEFAULT 'stable',      -- improving | stable | degrading
    volatility REAL,
    decay_factor REAL NOT NULL DEFAULT 1.0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wallet_graph_edges (
    sender TEXT NOT NULL,
    receiver TEXT NOT NULL,
    tx_count INTEGER NOT NULL DEFAULT 1,
    total_volume_lamports INTEGER NOT NULL DEFAULT 0,
    last_seen_timestamp INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (sender, receiver)
);

CREATE TABLE IF NOT EXISTS wallet_clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    confidence_score REAL NOT NULL,
    reason_tags_json TEXT NOT NULL DEFAULT '[]',
    cluster_risk REAL,
    risk_updated_at INTEGER,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wallet_cluster_members (
    cluster_id INTEGER NOT NULL,
    wallet TEXT NOT NULL,
    PRIMARY KEY (cluster_id, wallet)
);

CREATE TABLE IF NOT EXISTS entity_profiles (
    entity_id INTEGER PRIMARY KEY,             -- 1:1 with wallet_clusters.id
    cluster_id INTEGER NOT NULL,
    reputation_score REAL NOT NULL DEFAULT 50.0,
    risk_history_json TEXT,                    -- bounded list of snapshots
    last_updated INTEGER NOT NULL,
    decay_factor REAL NOT NULL DEFAULT 1.0,
    reason_tags_json TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS entity_reputation_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    reputation_score REAL NOT NULL,
    reason_tags_json TEXT,
    snapshot_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS wallet_rolling_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    window_days INTEGER NOT NULL,
    period_end_ts INTEGER NOT NULL,
    volume_lamports INTEGER NOT NULL DEFAULT 0,
    tx_count INTEGER NOT NULL DEFAULT 0,
    anomaly_count INTEGER NOT NULL DEFAULT 0,
    avg_trust_score REAL,
    alert_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(wallet, window_days, period_end_ts)
);

CREATE INDEX IF NOT EXISTS idx_transactions_wallet ON transactions(wallet);
CREATE INDEX IF NOT EXISTS idx_transactions_wallet_timestamp ON transactions(wallet, timestamp);
CREATE INDEX IF NOT EXISTS idx_trust_scores_wallet_computed_at ON trust_scores(wallet, computed_at DESC);
CREATE INDEX IF NOT EXISTS idx_alerts_wallet_created_at ON alerts(wallet, created_at);
CREATE INDEX IF NOT EXISTS idx_graph_edges_last_seen ON wallet_graph_edges(last_seen_timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_graph_edges_receiver ON wallet_graph_edges(receiver);
CREATE INDEX IF NOT EXISTS idx_cluster_members_wallet ON wallet_cluster_members(wallet);
CREATE INDEX IF NOT EXISTS idx_entity_history_entity ON entity_reputation_history(entity_id, snapshot_at DESC);
CREATE INDEX IF NOT EXISTS idx_rolling_stats_wallet ON wallet_rolling_stats(wallet);
"#;
