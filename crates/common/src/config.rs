use anyhow::{Context, Result};
use serde::Deserialize;

/// Process-wide configuration, parsed once from TOML in `main`.
/// Every field has a default so a partial (or empty) file is valid;
/// `validate()` enforces the combinations that are fatal at startup.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub ingestion: Ingestion,
    #[serde(default)]
    pub analysis: Analysis,
    #[serde(default)]
    pub alerts: Alerts,
    #[serde(default)]
    pub oracle: Oracle,
    #[serde(default)]
    pub publisher: Publisher,
    #[serde(default)]
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rpc {
    #[serde(default = "default_rpc_url")]
    pub url: String,
    #[serde(default = "default_rpc_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    #[serde(default = "default_signatures_timeout_sec")]
    pub signatures_timeout_sec: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            ws_url: default_rpc_ws_url(),
            rate_per_sec: default_rate_per_sec(),
            request_timeout_sec: default_request_timeout_sec(),
            signatures_timeout_sec: default_signatures_timeout_sec(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ingestion {
    /// "stream" (WebSocket accountSubscribe) or "poll" (getSignaturesForAddress).
    #[serde(default = "default_listen_mode")]
    pub listen_mode: String,
    /// Initial tracked set; merged into the registry at startup.
    #[serde(default)]
    pub wallets: Vec<String>,
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_signatures_limit")]
    pub signatures_limit: u32,
    #[serde(default = "default_debounce_sec")]
    pub debounce_sec: f64,
    #[serde(default = "default_queue_maxsize")]
    pub queue_maxsize: usize,
    #[serde(default = "default_reconnect_min_sec")]
    pub reconnect_min_sec: u64,
    #[serde(default = "default_reconnect_max_sec")]
    pub reconnect_max_sec: u64,
    /// Signature LRU size for the stream pipeline.
    #[serde(default = "default_max_seen_per_wallet")]
    pub max_seen_per_wallet: usize,
    /// Signature LRU size for the polling listener, which sees deeper
    /// signature pages per cycle than the stream does.
    #[serde(default = "default_max_seen_per_wallet_poll")]
    pub max_seen_per_wallet_poll: usize,
}

impl Default for Ingestion {
    fn default() -> Self {
        Self {
            listen_mode: default_listen_mode(),
            wallets: Vec::new(),
            poll_interval_sec: default_poll_interval_sec(),
            signatures_limit: default_signatures_limit(),
            debounce_sec: default_debounce_sec(),
            queue_maxsize: default_queue_maxsize(),
            reconnect_min_sec: default_reconnect_min_sec(),
            reconnect_max_sec: default_reconnect_max_sec(),
            max_seen_per_wallet: default_max_seen_per_wallet(),
            max_seen_per_wallet_poll: default_max_seen_per_wallet_poll(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Analysis {
    #[serde(default = "default_scan_interval_sec")]
    pub scan_interval_sec: u64,
    #[serde(default = "default_max_wallets_per_cycle")]
    pub max_wallets_per_cycle: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_tx_history")]
    pub max_tx_history: usize,
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    /// "priority" (rule-based queue) or "rotation" (deterministic cycles).
    #[serde(default = "default_scheduler_mode")]
    pub scheduler_mode: String,
    #[serde(default = "default_watchlist_every_n_cycles")]
    pub watchlist_every_n_cycles: u64,
    #[serde(default = "default_normal_every_n_cycles")]
    pub normal_every_n_cycles: u64,
    #[serde(default = "default_cluster_rebuild_every_n_cycles")]
    pub cluster_rebuild_every_n_cycles: u64,
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            scan_interval_sec: default_scan_interval_sec(),
            max_wallets_per_cycle: default_max_wallets_per_cycle(),
            concurrency: default_concurrency(),
            max_tx_history: default_max_tx_history(),
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            scheduler_mode: default_scheduler_mode(),
            watchlist_every_n_cycles: default_watchlist_every_n_cycles(),
            normal_every_n_cycles: default_normal_every_n_cycles(),
            cluster_rebuild_every_n_cycles: default_cluster_rebuild_every_n_cycles(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alerts {
    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: i64,
    #[serde(default = "default_trust_score_alert_below")]
    pub trust_score_alert_below: f64,
}

impl Default for Alerts {
    fn default() -> Self {
        Self {
            cooldown_sec: default_cooldown_sec(),
            trust_score_alert_below: default_trust_score_alert_below(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Oracle {
    #[serde(default = "default_cache_ttl_sec")]
    pub cache_ttl_sec: u64,
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: usize,
    #[serde(default = "default_rate_limit_window_sec")]
    pub rate_limit_window_sec: u64,
}

impl Default for Oracle {
    fn default() -> Self {
        Self {
            cache_ttl_sec: default_cache_ttl_sec(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_sec: default_rate_limit_window_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Publisher {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_publish_interval_sec")]
    pub publish_interval_sec: u64,
    #[serde(default = "default_score_delta_threshold")]
    pub score_delta_threshold: f64,
    #[serde(default = "default_max_tx_per_minute")]
    pub max_tx_per_minute: usize,
    #[serde(default = "default_confirm_timeout_sec")]
    pub confirm_timeout_sec: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_sec")]
    pub retry_backoff_sec: f64,
    #[serde(default)]
    pub dry_run: bool,
    /// Path to the oracle signer credentials. Required when enabled and
    /// not in dry_run; the signing transport itself is external.
    #[serde(default)]
    pub signer_path: String,
}

impl Default for Publisher {
    fn default() -> Self {
        Self {
            enabled: false,
            publish_interval_sec: default_publish_interval_sec(),
            score_delta_threshold: default_score_delta_threshold(),
            max_tx_per_minute: default_max_tx_per_minute(),
            confirm_timeout_sec: default_confirm_timeout_sec(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_sec: default_retry_backoff_sec(),
            dry_run: false,
            signer_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for Observability {
    fn default() -> Self {
        Self {
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_db_path() -> String {
    "data/trust.db".to_string()
}
fn default_rpc_url() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}
fn default_rpc_ws_url() -> String {
    "wss://api.mainnet-beta.solana.com".to_string()
}
fn default_rate_per_sec() -> f64 {
    8.0
}
fn default_request_timeout_sec() -> u64 {
    15
}
fn default_signatures_timeout_sec() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_listen_mode() -> String {
    "stream".to_string()
}
fn default_poll_interval_sec() -> u64 {
    45
}
fn default_signatures_limit() -> u32 {
    20
}
fn default_debounce_sec() -> f64 {
    1.0
}
fn default_queue_maxsize() -> usize {
    8192
}
fn default_reconnect_min_sec() -> u64 {
    1
}
fn default_reconnect_max_sec() -> u64 {
    60
}
fn default_max_seen_per_wallet() -> usize {
    5000
}
fn default_max_seen_per_wallet_poll() -> usize {
    10_000
}
fn default_scan_interval_sec() -> u64 {
    30
}
fn default_max_wallets_per_cycle() -> usize {
    2000
}
fn default_concurrency() -> usize {
    8
}
fn default_max_tx_history() -> usize {
    500
}
fn default_heartbeat_interval_sec() -> u64 {
    30
}
fn default_scheduler_mode() -> String {
    "priority".to_string()
}
fn default_watchlist_every_n_cycles() -> u64 {
    2
}
fn default_normal_every_n_cycles() -> u64 {
    4
}
fn default_cluster_rebuild_every_n_cycles() -> u64 {
    10
}
fn default_cooldown_sec() -> i64 {
    3600
}
fn default_trust_score_alert_below() -> f64 {
    50.0
}
fn default_cache_ttl_sec() -> u64 {
    60
}
fn default_rate_limit_requests() -> usize {
    100
}
fn default_rate_limit_window_sec() -> u64 {
    60
}
fn default_publish_interval_sec() -> u64 {
    60
}
fn default_score_delta_threshold() -> f64 {
    3.0
}
fn default_max_tx_per_minute() -> usize {
    10
}
fn default_confirm_timeout_sec() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_sec() -> f64 {
    2.0
}
fn default_prometheus_port() -> u16 {
    9187
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/default.toml".into());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config = Self::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Startup invariants; violations are fatal (process exit 1).
    pub fn validate(&self) -> Result<()> {
        match self.ingestion.listen_mode.as_str() {
            "stream" | "poll" => {}
            other => {
                anyhow::bail!("ingestion.listen_mode must be \"stream\" or \"poll\", got {other:?}")
            }
        }
        match self.analysis.scheduler_mode.as_str() {
            "priority" | "rotation" => {}
            other => anyhow::bail!(
                "analysis.scheduler_mode must be \"priority\" or \"rotation\", got {other:?}"
            ),
        }
        if self.publisher.enabled && !self.publisher.dry_run && self.publisher.signer_path.is_empty()
        {
            anyhow::bail!("publisher.enabled requires publisher.signer_path unless dry_run is set");
        }
        if self.analysis.concurrency == 0 {
            anyhow::bail!("analysis.concurrency must be >= 1");
        }
        if self.ingestion.queue_maxsize == 0 {
            anyhow::bail!("ingestion.queue_maxsize must be >= 1");
        }
        Ok(())
    }

    /// Tracked wallets from config, trimmed and de-duplicated, order kept.
    pub fn seed_wallets(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.ingestion
            .wallets
            .iter()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty() && seen.insert(w.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_default_config_file() {
        let config = Config::from_str(include_str!("../../../config/default.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ingestion.poll_interval_sec, 45);
        assert_eq!(config.analysis.concurrency, 8);
        assert!((config.publisher.score_delta_threshold - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.ingestion.queue_maxsize, 8192);
        assert_eq!(config.ingestion.max_seen_per_wallet, 5000);
        assert_eq!(config.ingestion.max_seen_per_wallet_poll, 10_000);
        assert_eq!(config.analysis.max_tx_history, 500);
        assert_eq!(config.alerts.cooldown_sec, 3600);
        assert_eq!(config.oracle.cache_ttl_sec, 60);
        assert_eq!(config.analysis.scheduler_mode, "priority");
        assert!(!config.publisher.enabled);
    }

    #[test]
    fn test_publisher_without_signer_is_fatal() {
        let config = Config::from_str(
            r#"
            [publisher]
            enabled = true
            dry_run = false
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publisher_dry_run_without_signer_is_ok() {
        let config = Config::from_str(
            r#"
            [publisher]
            enabled = true
            dry_run = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_listen_mode_rejected() {
        let config = Config::from_str("[ingestion]\nlisten_mode = \"carrier-pigeon\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_seed_wallets_dedup_and_trim() {
        let config = Config::from_str(
            r#"
            [ingestion]
            wallets = [" Aaa ", "Bbb", "Aaa", ""]
            "#,
        )
        .unwrap();
        assert_eq!(config.seed_wallets(), vec!["Aaa", "Bbb"]);
    }
}
