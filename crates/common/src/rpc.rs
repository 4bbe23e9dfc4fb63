//! Solana JSON-RPC client used by the listener, stream and publisher.
//!
//! All calls go through a shared token-bucket rate limiter and a bounded
//! retry loop; every request carries an explicit timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::config;
use crate::types::{RawTransaction, SignatureInfo};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("rpc node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("rpc malformed response: {0}")]
    Malformed(String),
    #[error("rpc retries exhausted for {method}: {reason}")]
    Exhausted { method: String, reason: String },
}

/// Token-bucket style limiter: enforces a minimum interval between acquires.
pub struct RateLimiter {
    interval: Duration,
    last_acquire: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        let interval = if rate_per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / rate_per_sec)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            last_acquire: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut last = self.last_acquire.lock().await;
        let now = tokio::time::Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.duration_since(prev);
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }
}

pub struct SolanaRpc {
    url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    request_timeout: Duration,
    signatures_timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    next_id: AtomicU64,
}

impl SolanaRpc {
    pub fn new(cfg: &config::Rpc) -> Self {
        Self::with_url(&cfg.url, cfg)
    }

    /// Same settings against an explicit endpoint (the stream derives its
    /// HTTP endpoint from the WebSocket URL).
    pub fn with_url(url: &str, cfg: &config::Rpc) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.signatures_timeout_sec.max(cfg.request_timeout_sec)))
            .build()
            .unwrap_or_default();
        Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            limiter: RateLimiter::new(cfg.rate_per_sec),
            request_timeout: Duration::from_secs(cfg.request_timeout_sec),
            signatures_timeout: Duration::from_secs(cfg.signatures_timeout_sec),
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// One JSON-RPC call with rate limiting and bounded retry on transport
    /// errors, 429 and 5xx. Node-level errors are returned without retry.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params,
        });

        let mut attempt = 0_u32;
        loop {
            self.limiter.acquire().await;
            let result = self
                .client
                .post(&self.url)
                .timeout(timeout)
                .json(&body)
                .send()
                .await;

            let retryable: Option<String> = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let payload: serde_json::Value = resp.json().await?;
                        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
                            let code = err.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0);
                            let message = err
                                .get("message")
                                .and_then(serde_json::Value::as_str)
                                .unwrap_or("unknown")
                                .to_string();
                            return Err(RpcError::Node { code, message });
                        }
                        return Ok(payload.get("result").cloned().unwrap_or(serde_json::Value::Null));
                    }
                    let code = status.as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    if code == 429 || code >= 500 {
                        Some(format!("http {code}"))
                    } else {
                        return Err(RpcError::Http { status: code, body: text });
                    }
                }
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = retryable {
                if attempt >= self.max_retries {
                    return Err(RpcError::Exhausted {
                        method: method.to_string(),
                        reason,
                    });
                }
                let backoff = self.backoff_base * 2_u32.saturating_pow(attempt);
                warn!(method, attempt, reason = %reason, backoff_ms = backoff.as_millis() as u64,
                    "rpc call failed; backing off");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }

    /// `getSignaturesForAddress` with the given commitment, newest first.
    pub async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: u32,
        before: Option<&str>,
        commitment: &str,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        let mut opts = json!({ "limit": limit, "commitment": commitment });
        if let Some(before) = before {
            opts["before"] = json!(before);
        }
        let result = self
            .call(
                "getSignaturesForAddress",
                json!([address, opts]),
                self.signatures_timeout,
            )
            .await?;
        let infos: Vec<SignatureInfo> = serde_json::from_value(result)
            .map_err(|e| RpcError::Malformed(format!("signatures payload: {e}")))?;
        debug!(address, count = infos.len(), "fetched signatures");
        Ok(infos)
    }

    /// `getTransaction` with JSON encoding; None when the node has no record.
    pub async fn get_transaction(&self, signature: &str) -> Result<Option<RawTransaction>, RpcError> {
        let result = self
            .call(
                "getTransaction",
                json!([signature, { "encoding": "json", "maxSupportedTransactionVersion": 0 }]),
                self.request_timeout,
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let raw: RawTransaction = serde_json::from_value(result)
            .map_err(|e| RpcError::Malformed(format!("transaction payload: {e}")))?;
        Ok(Some(raw))
    }

    /// Confirmation status of a signature: `processed | confirmed | finalized`,
    /// None when the node does not know it (yet). Errors out if the
    /// transaction itself failed on chain.
    pub async fn get_signature_status(&self, signature: &str) -> Result<Option<String>, RpcError> {
        let result = self
            .call(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
                self.request_timeout,
            )
            .await?;
        let status = result
            .get("value")
            .and_then(|v| v.get(0))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if status.is_null() {
            return Ok(None);
        }
        if let Some(err) = status.get("err").filter(|e| !e.is_null()) {
            return Err(RpcError::Node {
                code: 0,
                message: format!("transaction failed: {err}"),
            });
        }
        Ok(status
            .get("confirmationStatus")
            .and_then(|s| s.as_str())
            .map(str::to_string))
    }
}

/// Convert a WebSocket endpoint to its HTTP twin for RPC calls.
pub fn ws_url_to_http(ws_url: &str) -> String {
    let s = ws_url.trim();
    if let Some(rest) = s.strip_prefix("wss://") {
        return format!("https://{rest}");
    }
    if let Some(rest) = s.strip_prefix("ws://") {
        return format!("http://{rest}");
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_to_http() {
        assert_eq!(
            ws_url_to_http("wss://api.mainnet-beta.solana.com"),
            "https://api.mainnet-beta.solana.com"
        );
        assert_eq!(ws_url_to_http("ws://localhost:8900"), "http://localhost:8900");
        assert_eq!(
            ws_url_to_http("https://already-http.example"),
            "https://already-http.example"
        );
    }

    #[test]
    fn test_parse_signatures_payload() {
        let json = r#"[
            {"signature": "sigA", "slot": 100, "blockTime": 1700000000, "err": null},
            {"signature": "sigB", "slot": 101}
        ]"#;
        let infos: Vec<SignatureInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].signature, "sigA");
        assert_eq!(infos[0].block_time, Some(1_700_000_000));
        assert!(infos[1].block_time.is_none());
    }

    #[test]
    fn test_parse_transaction_payload() {
        let json = r#"{
            "blockTime": 1700000000,
            "slot": 12345,
            "transaction": {
                "message": {
                    "accountKeys": ["Sender111", "Receiver111", "11111111111111111111111111111111"],
                    "instructions": [
                        {"programIdIndex": 2, "accounts": [0, 1], "data": "3Bxs4h24hBtQy9rw"}
                    ],
                    "header": {"numRequiredSignatures": 1}
                },
                "signatures": ["sigX"]
            },
            "meta": {
                "preBalances": [1000, 0, 1],
                "postBalances": [500, 490, 1],
                "fee": 10,
                "innerInstructions": []
            }
        }"#;
        let raw: RawTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(raw.block_time, Some(1_700_000_000));
        let msg = raw.transaction.unwrap().message.unwrap();
        assert_eq!(msg.account_keys.len(), 3);
        assert_eq!(msg.instructions[0].accounts, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_acquires() {
        let limiter = RateLimiter::new(2.0); // 500ms interval
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Two waits of 500ms each under the paused clock.
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_rate_limiter_zero_rate_is_unlimited() {
        let limiter = RateLimiter::new(0.0);
        limiter.acquire().await;
        limiter.acquire().await; // returns immediately, no panic
    }
}
