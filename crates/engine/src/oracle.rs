//! Trust oracle: read-only access to trust intelligence for external
//! callers, with a TTL cache and per-client sliding-window rate limiting.
//!
//! Lookups never mutate state. The explanation payload carries the anomaly
//! summary, cluster contamination and historical trend so consumers can
//! show *why* a score is what it is.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use tracing::warn;

use common::db::AsyncDb;
use common::store;
use common::types::{RiskLevel, ScoreMetadata};

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub cache_ttl: Duration,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Explanation {
    pub anomaly_summary: Option<String>,
    pub cluster_contamination: Option<String>,
    pub historical_trend: Option<String>,
}

/// Structured oracle response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleResult {
    pub trust_score: Option<f64>,
    pub risk_level: RiskLevel,
    pub entity_reputation: Option<f64>,
    pub cluster_risk: Option<f64>,
    pub reason_tags: Vec<String>,
    pub last_updated: i64,
    pub explanation: Explanation,
}

fn parse_tags(json: Option<&str>) -> Vec<String> {
    json.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

fn merge_tags(base: Vec<String>, extra: Vec<String>) -> Vec<String> {
    let mut out = base;
    for tag in extra {
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Wallet trust lookup, pure read over the store.
pub fn wallet_trust_lookup(conn: &Connection, wallet: &str) -> Result<Option<OracleResult>> {
    let Some(latest) = store::latest_trust_score(conn, wallet)? else {
        return Ok(None);
    };
    let trust_score = latest.score;
    let last_updated = latest.computed_at;

    let reputation = store::reputation_state(conn, wallet)?;
    let (trend, avg_7d, avg_30d) = match &reputation {
        Some(r) => (Some(r.trend), r.avg_7d, r.avg_30d),
        None => (None, None, None),
    };

    let mut reason_tags = Vec::new();
    let mut cluster_risk = None;
    let mut cluster_contamination = None;
    let mut entity_reputation = None;
    if let Some(cluster) = store::cluster_for_wallet(conn, wallet)? {
        reason_tags = parse_tags(Some(&cluster.reason_tags_json));
        cluster_risk = cluster.cluster_risk;
        if let Some(risk) = cluster.cluster_risk.filter(|r| *r > 0.0) {
            cluster_contamination =
                Some(format!("Cluster risk {risk:.1}; reason_tags={reason_tags:?}"));
        }
        if let Some(profile) = store::entity_profile_by_cluster(conn, cluster.id)? {
            entity_reputation = Some(profile.reputation_score);
            reason_tags = merge_tags(reason_tags, parse_tags(Some(&profile.reason_tags_json)));
        }
    }

    let anomaly_summary = ScoreMetadata::parse(latest.metadata_json.as_deref()).and_then(|meta| {
        let names = meta.rule_names();
        (!names.is_empty()).then(|| {
            format!(
                "{} anomaly flag(s): {}",
                names.len(),
                names
                    .iter()
                    .take(5)
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    });

    let historical_trend = trend.map(|t| {
        let mut s = format!("Trend: {}", t.as_str());
        if avg_7d.is_some() || avg_30d.is_some() {
            s.push_str(&format!("; avg_7d={avg_7d:?}; avg_30d={avg_30d:?}"));
        }
        s
    });

    Ok(Some(OracleResult {
        trust_score: Some(trust_score),
        risk_level: RiskLevel::from_score(trust_score),
        entity_reputation,
        cluster_risk,
        reason_tags,
        last_updated,
        explanation: Explanation {
            anomaly_summary,
            cluster_contamination,
            historical_trend,
        },
    }))
}

/// Entity reputation lookup.
pub fn entity_reputation_lookup(conn: &Connection, entity_id: i64) -> Result<Option<OracleResult>> {
    let Some(profile) = store::entity_profile(conn, entity_id)? else {
        return Ok(None);
    };
    let reason_tags = parse_tags(Some(&profile.reason_tags_json));

    let history = store::entity_history(conn, entity_id, 10)?;
    let historical_trend = (history.len() >= 2).then(|| {
        let recent = history[0].0;
        let older = history[history.len() - 1].0;
        let direction = if recent > older {
            "improving"
        } else if recent < older {
            "degrading"
        } else {
            "stable"
        };
        format!("Entity trend: {direction} (recent={recent:.1}, older={older:.1})")
    });

    let cluster_risk =
        store::cluster_by_id(conn, entity_id)?.and_then(|c| c.cluster_risk);

    Ok(Some(OracleResult {
        trust_score: Some(profile.reputation_score),
        risk_level: RiskLevel::from_score(100.0 - cluster_risk.unwrap_or(0.0)),
        entity_reputation: Some(profile.reputation_score),
        cluster_risk,
        reason_tags,
        last_updated: profile.last_updated,
        explanation: Explanation {
            anomaly_summary: None,
            cluster_contamination: cluster_risk
                .filter(|r| *r > 0.0)
                .map(|r| format!("Entity in cluster; cluster_risk={r}")),
            historical_trend,
        },
    }))
}

/// Cluster risk lookup.
pub fn cluster_risk_lookup(conn: &Connection, cluster_id: i64) -> Result<Option<OracleResult>> {
    let Some(cluster) = store::cluster_by_id(conn, cluster_id)? else {
        return Ok(None);
    };
    let reason_tags = parse_tags(Some(&cluster.reason_tags_json));
    let members = store::cluster_members(conn, cluster_id)?;
    let mut last_updated = cluster.risk_updated_at.unwrap_or(0);

    let entity_reputation = match store::entity_profile_by_cluster(conn, cluster_id)? {
        Some(profile) => {
            last_updated = last_updated.max(profile.last_updated);
            Some(profile.reputation_score)
        }
        None => None,
    };

    let trust_score = 100.0 - cluster.cluster_risk.unwrap_or(0.0);
    Ok(Some(OracleResult {
        trust_score: Some(trust_score),
        risk_level: RiskLevel::from_score(trust_score),
        entity_reputation,
        cluster_risk: cluster.cluster_risk,
        reason_tags,
        last_updated,
        explanation: Explanation {
            anomaly_summary: None,
            cluster_contamination: cluster
                .cluster_risk
                .filter(|r| *r > 0.0)
                .map(|r| format!("Cluster has {} member(s); cluster_risk={r}", members.len())),
            historical_trend: Some(format!(
                "confidence={}; members={}",
                cluster.confidence_score,
                members.len()
            )),
        },
    }))
}

struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (OracleResult, Instant)>>,
}

impl TtlCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<OracleResult> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((value, stored_at)) if stored_at.elapsed() <= self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, value: OracleResult) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, (value, Instant::now()));
        }
    }
}

struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, key: &str) -> bool {
        let Ok(mut hits) = self.hits.lock() else {
            return true;
        };
        let now = Instant::now();
        let times = hits.entry(key.to_string()).or_default();
        while times
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            times.pop_front();
        }
        if times.len() >= self.max_requests {
            return false;
        }
        times.push_back(now);
        true
    }
}

/// The oracle service: cached, rate-limited lookups over the store.
pub struct TrustOracle {
    db: AsyncDb,
    cache: TtlCache,
    limiter: SlidingWindowLimiter,
}

impl TrustOracle {
    pub fn new(db: AsyncDb, config: &OracleConfig) -> Self {
        Self {
            db,
            cache: TtlCache::new(config.cache_ttl),
            limiter: SlidingWindowLimiter::new(
                config.rate_limit_requests,
                config.rate_limit_window,
            ),
        }
    }

    fn rate_key(client_id: Option<&str>, fallback: &str) -> String {
        let key = client_id.unwrap_or(fallback).trim();
        if key.is_empty() {
            "anonymous".to_string()
        } else {
            key.to_string()
        }
    }

    async fn lookup<F>(&self, cache_key: String, rate_key: String, query: F) -> Result<Option<OracleResult>>
    where
        F: FnOnce(&mut Connection) -> Result<Option<OracleResult>> + Send + 'static,
    {
        if !self.limiter.allow(&rate_key) {
            warn!(key = %rate_key, "oracle rate limited");
            metrics::counter!("engine_oracle_rate_limited_total").increment(1);
            return Ok(None);
        }
        if let Some(cached) = self.cache.get(&cache_key) {
            metrics::counter!("engine_oracle_cache_hits_total").increment(1);
            return Ok(Some(cached));
        }
        let result = self.db.call_named("oracle.lookup", query).await?;
        if let Some(result) = &result {
            self.cache.put(cache_key, result.clone());
        }
        Ok(result)
    }

    pub async fn get_wallet_trust(
        &self,
        wallet: &str,
        client_id: Option<&str>,
    ) -> Result<Option<OracleResult>> {
        let wallet = wallet.trim().to_string();
        if wallet.is_empty() {
            return Ok(None);
        }
        let rate_key = Self::rate_key(client_id, &wallet);
        let cache_key = format!("wallet:{wallet}");
        self.lookup(cache_key, rate_key, move |conn| {
            wallet_trust_lookup(conn, &wallet)
        })
        .await
    }

    pub async fn get_entity_reputation(
        &self,
        entity_id: i64,
        client_id: Option<&str>,
    ) -> Result<Option<OracleResult>> {
        let rate_key = Self::rate_key(client_id, &format!("entity:{entity_id}"));
        self.lookup(format!("entity:{entity_id}"), rate_key, move |conn| {
            entity_reputation_lookup(conn, entity_id)
        })
        .await
    }

    pub async fn get_cluster_risk(
        &self,
        cluster_id: i64,
        client_id: Option<&str>,
    ) -> Result<Option<OracleResult>> {
        let rate_key = Self::rate_key(client_id, &format!("cluster:{cluster_id}"));
        self.lookup(format!("cluster:{cluster_id}"), rate_key, move |conn| {
            cluster_risk_lookup(conn, cluster_id)
        })
        .await
    }
}
