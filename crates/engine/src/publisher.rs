//! Attestation publisher: push score changes to the external ledger under
//! safety rails.
//!
//! Rails: score-delta gating against the last published value, a rolling
//! per-minute transaction cap, bounded retry with exponential backoff,
//! confirmation wait, and a dry-run mode that emits the same log envelope
//! without sending. The signing transport is an external collaborator
//! behind [`AttestationSender`]; this module owns everything else.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::db::AsyncDb;
use common::store;
use common::types::RiskLevel;

pub const DRY_RUN_SIGNATURE: &str = "dry_run";

/// On-chain attestation account layout, parsed by fixed offsets:
/// 8-byte discriminator, 32-byte wallet, u8 score, u8 risk,
/// little-endian i64 timestamp, 32-byte oracle key.
const DISCRIMINATOR_LEN: usize = 8;
const WALLET_LEN: usize = 32;
const SCORE_OFFSET: usize = DISCRIMINATOR_LEN + WALLET_LEN; // 40
const MIN_ACCOUNT_LEN: usize = SCORE_OFFSET + 2; // score + risk
const TIMESTAMP_OFFSET: usize = SCORE_OFFSET + 2; // 42
const ORACLE_OFFSET: usize = TIMESTAMP_OFFSET + 8; // 50
const FULL_ACCOUNT_LEN: usize = ORACLE_OFFSET + 32; // 82

/// One score update bound for the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationUpdate {
    pub wallet: String,
    pub trust_score: u8,
    pub risk_level: u8,
}

/// Decoded attestation account (reader side).
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationAccount {
    pub wallet: [u8; 32],
    pub trust_score: u8,
    pub risk_level: u8,
    pub last_updated: Option<i64>,
    pub oracle: Option<[u8; 32]>,
}

/// Instruction data for `update_trust_score(wallet, score, risk)`:
/// discriminator ++ wallet ++ score ++ risk.
pub fn encode_update_data(discriminator: &[u8; 8], wallet: &[u8; 32], score: u8, risk: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity(DISCRIMINATOR_LEN + WALLET_LEN + 2);
    data.extend_from_slice(discriminator);
    data.extend_from_slice(wallet);
    data.push(score);
    data.push(risk);
    data
}

/// Parse an attestation account by fixed offsets. Returns None when the
/// buffer is too short to carry score and risk.
pub fn parse_attestation_account(data: &[u8]) -> Option<AttestationAccount> {
    if data.len() < MIN_ACCOUNT_LEN {
        return None;
    }
    let mut wallet = [0_u8; 32];
    wallet.copy_from_slice(&data[DISCRIMINATOR_LEN..DISCRIMINATOR_LEN + WALLET_LEN]);
    let trust_score = data[SCORE_OFFSET];
    let risk_level = data[SCORE_OFFSET + 1];

    let last_updated = (data.len() >= TIMESTAMP_OFFSET + 8).then(|| {
        let mut buf = [0_u8; 8];
        buf.copy_from_slice(&data[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]);
        i64::from_le_bytes(buf)
    });
    let oracle = (data.len() >= FULL_ACCOUNT_LEN).then(|| {
        let mut buf = [0_u8; 32];
        buf.copy_from_slice(&data[ORACLE_OFFSET..ORACLE_OFFSET + 32]);
        buf
    });

    Some(AttestationAccount {
        wallet,
        trust_score,
        risk_level,
        last_updated,
        oracle,
    })
}

/// The signing transport. Implementations build, sign and submit the
/// ledger transaction for a chunk of updates and report the signature;
/// `confirm` resolves once the ledger reaches confirmed/finalized.
pub trait AttestationSender {
    fn send_batch(
        &self,
        updates: &[AttestationUpdate],
    ) -> impl Future<Output = Result<String>> + Send;

    fn confirm(&self, signature: &str) -> impl Future<Output = Result<bool>> + Send;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub score_delta_threshold: f64,
    pub max_tx_per_minute: usize,
    pub max_updates_per_batch: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub confirm_timeout: Duration,
    pub dry_run: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            score_delta_threshold: 3.0,
            max_tx_per_minute: 10,
            max_updates_per_batch: 20,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

/// Publisher state: delta gating and the rolling send window are
/// single-owner, living with the publisher task.
pub struct Publisher<S: AttestationSender> {
    db: AsyncDb,
    sender: S,
    config: PublisherConfig,
    last_published: HashMap<String, f64>,
    sent_at: VecDeque<Instant>,
}

impl<S: AttestationSender> Publisher<S> {
    pub fn new(db: AsyncDb, sender: S, config: PublisherConfig) -> Self {
        Self {
            db,
            sender,
            config,
            last_published: HashMap::new(),
            sent_at: VecDeque::new(),
        }
    }

    /// Wallets whose latest score moved more than the threshold since the
    /// last published value (or were never published).
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<AttestationUpdate>> {
        let last_published = self.last_published.clone();
        let threshold = self.config.score_delta_threshold;
        self.db
            .call_named("publisher.pending", move |conn| {
                let wallets = store::tracked_wallet_addresses(conn, 5_000)?;
                let latest = store::latest_trust_scores_for(conn, &wallets)?;
                let mut out = Vec::new();
                for wallet in wallets {
                    let Some(rec) = latest.get(&wallet) else {
                        continue;
                    };
                    if !(0.0..=100.0).contains(&rec.score) {
                        continue;
                    }
                    if let Some(last) = last_published.get(&wallet) {
                        if (rec.score - last).abs() <= threshold {
                            continue;
                        }
                    }
                    out.push(AttestationUpdate {
                        wallet,
                        trust_score: rec.score.round().clamp(0.0, 100.0) as u8,
                        risk_level: RiskLevel::from_score(rec.score).as_u8(),
                    });
                    if out.len() >= limit {
                        break;
                    }
                }
                Ok(out)
            })
            .await
    }

    fn rate_limited(&mut self) -> bool {
        let now = Instant::now();
        while self
            .sent_at
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(60))
        {
            self.sent_at.pop_front();
        }
        self.sent_at.len() >= self.config.max_tx_per_minute
    }

    /// One publish cycle. Returns the number of transactions issued
    /// (dry-run envelopes count).
    pub async fn run_cycle(&mut self) -> Result<u64> {
        let pending = self
            .fetch_pending(self.config.max_updates_per_batch.max(1))
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let chunk_size = self.config.max_updates_per_batch.clamp(1, 20);
        let mut issued = 0_u64;
        for chunk in pending.chunks(chunk_size) {
            if self.rate_limited() {
                warn!(
                    max_tx_per_minute = self.config.max_tx_per_minute,
                    in_window = self.sent_at.len(),
                    "rate_limited_tx_per_minute"
                );
                metrics::counter!("engine_publisher_rate_limited_total").increment(1);
                break;
            }

            if self.config.dry_run {
                let wallets: Vec<&str> = chunk.iter().map(|u| u.wallet.as_str()).collect();
                info!(
                    signature = DRY_RUN_SIGNATURE,
                    wallets_updated = ?wallets,
                    instruction_count = chunk.len(),
                    "attestation dry run"
                );
                issued += 1;
                continue;
            }

            if self.send_chunk_with_retry(chunk).await {
                issued += 1;
            }
        }
        Ok(issued)
    }

    /// Send one chunk with bounded exponential backoff. On success,
    /// confirmation is awaited (bounded) and the delta baseline advances.
    async fn send_chunk_with_retry(&mut self, chunk: &[AttestationUpdate]) -> bool {
        for attempt in 0..self.config.retry_attempts.max(1) {
            match self.sender.send_batch(chunk).await {
                Ok(signature) => {
                    let wallets: Vec<&str> = chunk.iter().map(|u| u.wallet.as_str()).collect();
                    info!(
                        signature = %signature,
                        instruction_count = chunk.len(),
                        wallets_updated = ?wallets,
                        "attestation sent"
                    );
                    let confirmed = tokio::time::timeout(
                        self.config.confirm_timeout,
                        self.sender.confirm(&signature),
                    )
                    .await;
                    match confirmed {
                        Ok(Ok(true)) => {
                            info!(signature = %signature, "attestation confirmed");
                        }
                        Ok(Ok(false)) | Ok(Err(_)) => {
                            warn!(signature = %signature, "attestation confirmation failed");
                        }
                        Err(_) => {
                            warn!(
                                signature = %signature,
                                timeout_sec = self.config.confirm_timeout.as_secs(),
                                "attestation confirmation timed out"
                            );
                        }
                    }
                    for update in chunk {
                        self.last_published
                            .insert(update.wallet.clone(), f64::from(update.trust_score));
                        info!(signature = %signature, wallet = %update.wallet, "wallet attested");
                    }
                    self.sent_at.push_back(Instant::now());
                    metrics::counter!("engine_publisher_sent_total").increment(1);
                    return true;
                }
                Err(e) => {
                    let backoff = self.config.retry_backoff * 2_u32.saturating_pow(attempt);
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        backoff_sec = backoff.as_secs_f64(),
                        "attestation send failed"
                    );
                    if attempt + 1 < self.config.retry_attempts.max(1) {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        false
    }
}

/// A sender that never touches the network; used when `dry_run` is set.
/// Kept as a real implementation so the generic plumbing is exercised.
#[derive(Debug, Clone, Default)]
pub struct DryRunSender;

impl AttestationSender for DryRunSender {
    fn send_batch(
        &self,
        _updates: &[AttestationUpdate],
    ) -> impl Future<Output = Result<String>> + Send {
        std::future::ready(Ok(DRY_RUN_SIGNATURE.to_string()))
    }

    fn confirm(&self, _signature: &str) -> impl Future<Output = Result<bool>> + Send {
        std::future::ready(Ok(true))
    }
}

/// Drive publish cycles on an interval until cancelled.
pub async fn run_publisher<S: AttestationSender>(
    mut publisher: Publisher<S>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(interval_sec = interval.as_secs(), "publisher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match publisher.run_cycle().await {
            Ok(0) => {}
            Ok(issued) => info!(issued, "publisher cycle done"),
            Err(e) => warn!(error = %e, "publisher cycle failed"),
        }
    }
    info!("publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Priority;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every batch; optionally fails the first N sends.
    #[derive(Clone, Default)]
    struct MockSender {
        batches: Arc<Mutex<Vec<Vec<AttestationUpdate>>>>,
        fail_first: Arc<AtomicU32>,
    }

    impl AttestationSender for MockSender {
        fn send_batch(
            &self,
            updates: &[AttestationUpdate],
        ) -> impl Future<Output = Result<String>> + Send {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            let result = if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                Err(anyhow::anyhow!("simulated send failure"))
            } else {
                self.batches
                    .lock()
                    .unwrap()
                    .push(updates.to_vec());
                Ok(format!("sig{}", self.batches.lock().unwrap().len()))
            };
            std::future::ready(result)
        }

        fn confirm(&self, _signature: &str) -> impl Future<Output = Result<bool>> + Send {
            std::future::ready(Ok(true))
        }
    }

    async fn seeded_db(wallets: &[(&str, f64)]) -> AsyncDb {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let rows: Vec<(String, f64)> = wallets
            .iter()
            .map(|(w, s)| ((*w).to_string(), *s))
            .collect();
        db.call(move |conn| {
            for (wallet, score) in &rows {
                store::track_wallet(conn, wallet, Priority::Normal)?;
                store::insert_trust_score(conn, wallet, *score, 1_000, None)?;
            }
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[test]
    fn test_encode_update_data_layout() {
        let disc = [1, 2, 3, 4, 5, 6, 7, 8];
        let wallet = [9_u8; 32];
        let data = encode_update_data(&disc, &wallet, 87, 0);
        assert_eq!(data.len(), 42);
        assert_eq!(&data[..8], &disc);
        assert_eq!(&data[8..40], &wallet);
        assert_eq!(data[40], 87);
        assert_eq!(data[41], 0);
    }

    #[test]
    fn test_parse_attestation_account_fixed_offsets() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0_u8; 8]); // discriminator
        data.extend_from_slice(&[7_u8; 32]); // wallet
        data.push(73); // score
        data.push(1); // risk
        data.extend_from_slice(&1_700_000_000_i64.to_le_bytes());
        data.extend_from_slice(&[5_u8; 32]); // oracle

        let account = parse_attestation_account(&data).unwrap();
        assert_eq!(account.wallet, [7_u8; 32]);
        assert_eq!(account.trust_score, 73);
        assert_eq!(account.risk_level, 1);
        assert_eq!(account.last_updated, Some(1_700_000_000));
        assert_eq!(account.oracle, Some([5_u8; 32]));
    }

    #[test]
    fn test_parse_attestation_account_short_buffers() {
        assert!(parse_attestation_account(&[0_u8; 41]).is_none());
        // Score+risk only: timestamp and oracle absent.
        let account = parse_attestation_account(&[0_u8; 42]).unwrap();
        assert!(account.last_updated.is_none());
        assert!(account.oracle.is_none());
    }

    #[tokio::test]
    async fn test_delta_gating() {
        let db = seeded_db(&[("w", 70.0)]).await;
        let sender = MockSender::default();
        let mut publisher = Publisher::new(db.clone(), sender.clone(), PublisherConfig::default());

        // Never published: first cycle sends.
        assert_eq!(publisher.run_cycle().await.unwrap(), 1);
        assert_eq!(sender.batches.lock().unwrap().len(), 1);

        // New score 72: |72 − 70| ≤ 3 → skipped.
        db.call(|conn| {
            store::insert_trust_score(conn, "w", 72.0, 2_000, None)?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(publisher.run_cycle().await.unwrap(), 0);

        // New score 74: above the threshold → published.
        db.call(|conn| {
            store::insert_trust_score(conn, "w", 74.0, 3_000, None)?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(publisher.run_cycle().await.unwrap(), 1);
        let batches = sender.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].trust_score, 74);
        assert_eq!(batches[1][0].risk_level, RiskLevel::from_score(74.0).as_u8());
    }

    #[tokio::test]
    async fn test_rate_cap_defers_eleventh_send() {
        let wallets: Vec<(String, f64)> = (0..11).map(|i| (format!("w{i:02}"), 50.0)).collect();
        let refs: Vec<(&str, f64)> = wallets.iter().map(|(w, s)| (w.as_str(), *s)).collect();
        let db = seeded_db(&refs).await;

        let sender = MockSender::default();
        let config = PublisherConfig {
            max_updates_per_batch: 1, // one wallet per transaction
            ..PublisherConfig::default()
        };
        let mut publisher = Publisher::new(db, sender.clone(), config);

        // Pending list is capped at the batch size per cycle, so drive
        // eleven cycles inside one rate window.
        let mut issued = 0_u64;
        for _ in 0..11 {
            issued += publisher.run_cycle().await.unwrap();
        }
        assert_eq!(issued, 10);
        assert_eq!(sender.batches.lock().unwrap().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_with_backoff_then_succeeds() {
        let db = seeded_db(&[("w", 40.0)]).await;
        let sender = MockSender::default();
        sender.fail_first.store(2, Ordering::SeqCst);
        let mut publisher = Publisher::new(db, sender.clone(), PublisherConfig::default());

        let issued = publisher.run_cycle().await.unwrap();
        assert_eq!(issued, 1);
        assert_eq!(sender.batches.lock().unwrap().len(), 1);
        assert_eq!(sender.fail_first.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_gives_up_after_max_attempts() {
        let db = seeded_db(&[("w", 40.0)]).await;
        let sender = MockSender::default();
        sender.fail_first.store(10, Ordering::SeqCst);
        let mut publisher = Publisher::new(db, sender.clone(), PublisherConfig::default());

        let issued = publisher.run_cycle().await.unwrap();
        assert_eq!(issued, 0);
        assert!(sender.batches.lock().unwrap().is_empty());
        // Three attempts consumed.
        assert_eq!(sender.fail_first.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_dry_run_emits_envelope_without_send() {
        let db = seeded_db(&[("w", 40.0)]).await;
        let sender = MockSender::default();
        let config = PublisherConfig {
            dry_run: true,
            ..PublisherConfig::default()
        };
        let mut publisher = Publisher::new(db, sender.clone(), config);

        let issued = publisher.run_cycle().await.unwrap();
        assert_eq!(issued, 1);
        // The transport was never touched.
        assert!(sender.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_scores_skipped() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            store::track_wallet(conn, "w", Priority::Normal)?;
            store::insert_trust_score(conn, "w", 250.0, 1_000, None)?;
            Ok(())
        })
        .await
        .unwrap();
        let sender = MockSender::default();
        let mut publisher = Publisher::new(db, sender.clone(), PublisherConfig::default());
        assert_eq!(publisher.run_cycle().await.unwrap(), 0);
    }
}
