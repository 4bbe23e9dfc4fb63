//! Behavioral feature extraction from wallet transaction history.
//!
//! Converts a history slice into a structured vector: tx frequency, average
//! value, unique counterparties, velocity. No scoring logic here; the output
//! feeds the anomaly rules and the score metadata.

use common::types::{ParsedTransaction, LAMPORTS_PER_SOL};

/// Seconds per day for frequency/velocity normalization.
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Behavioral feature vector for a wallet over an observed transaction set.
///
/// Rate fields are None when fewer than two timestamps were observed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub wallet: String,
    /// Transactions involving this wallet in the observed set.
    pub tx_count: u32,
    /// Transactions per day over the observed span.
    pub tx_frequency: Option<f64>,
    pub avg_transaction_value_lamports: f64,
    pub avg_transaction_value_sol: f64,
    /// Distinct addresses that sent to or received from this wallet.
    pub unique_counterparties: u32,
    pub velocity_lamports_per_day: Option<f64>,
    pub velocity_sol_per_day: Option<f64>,
    pub total_volume_lamports: u64,
    pub total_volume_sol: f64,
    pub time_span_seconds: Option<f64>,
    pub time_span_days: Option<f64>,
}

impl FeatureVector {
    fn zero(wallet: &str) -> Self {
        Self {
            wallet: wallet.to_string(),
            tx_count: 0,
            tx_frequency: None,
            avg_transaction_value_lamports: 0.0,
            avg_transaction_value_sol: 0.0,
            unique_counterparties: 0,
            velocity_lamports_per_day: None,
            velocity_sol_per_day: None,
            total_volume_lamports: 0,
            total_volume_sol: 0.0,
            time_span_seconds: None,
            time_span_days: None,
        }
    }
}

/// Compute the feature vector for `wallet` over the supplied transactions.
///
/// Only transactions where the wallet is sender or receiver count. The time
/// span (max − min timestamp) is clamped to `min_time_span_seconds` so rate
/// metrics cannot explode on near-simultaneous transactions.
pub fn extract_features(
    transactions: &[ParsedTransaction],
    wallet: &str,
    min_time_span_seconds: f64,
) -> FeatureVector {
    let mut counterparties = std::collections::HashSet::new();
    let mut total_lamports: u64 = 0;
    let mut timestamps: Vec<i64> = Vec::new();
    let mut n: u32 = 0;

    for tx in transactions {
        if tx.sender != wallet && tx.receiver != wallet {
            continue;
        }
        n += 1;
        counterparties.insert(tx.sender.as_str());
        counterparties.insert(tx.receiver.as_str());
        total_lamports = total_lamports.saturating_add(tx.amount_lamports);
        if let Some(ts) = tx.timestamp {
            timestamps.push(ts);
        }
    }
    counterparties.remove(wallet);

    if n == 0 {
        return FeatureVector::zero(wallet);
    }

    let total_sol = total_lamports as f64 / LAMPORTS_PER_SOL;
    let avg_lamports = total_lamports as f64 / f64::from(n);
    let avg_sol = total_sol / f64::from(n);

    let mut time_span_seconds = None;
    let mut time_span_days = None;
    let mut tx_frequency = None;
    let mut velocity_lamports_per_day = None;
    let mut velocity_sol_per_day = None;

    if timestamps.len() >= 2 {
        let ts_min = *timestamps.iter().min().unwrap_or(&0);
        let ts_max = *timestamps.iter().max().unwrap_or(&0);
        let span = ((ts_max - ts_min).max(0) as f64).max(min_time_span_seconds);
        let days = span / SECONDS_PER_DAY;
        time_span_seconds = Some(span);
        time_span_days = Some(days);
        tx_frequency = Some(f64::from(n) / days);
        velocity_lamports_per_day = Some(total_lamports as f64 / days);
        velocity_sol_per_day = Some(total_sol / days);
    }

    FeatureVector {
        wallet: wallet.to_string(),
        tx_count: n,
        tx_frequency,
        avg_transaction_value_lamports: avg_lamports,
        avg_transaction_value_sol: avg_sol,
        unique_counterparties: counterparties.len() as u32,
        velocity_lamports_per_day,
        velocity_sol_per_day,
        total_volume_lamports: total_lamports,
        total_volume_sol: total_sol,
        time_span_seconds,
        time_span_days,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sender: &str, receiver: &str, sol: f64, ts: Option<i64>) -> ParsedTransaction {
        ParsedTransaction {
            sender: sender.into(),
            receiver: receiver.into(),
            amount_lamports: (sol * LAMPORTS_PER_SOL) as u64,
            timestamp: ts,
            signature: None,
            slot: None,
        }
    }

    #[test]
    fn test_empty_input_is_zero_vector() {
        let f = extract_features(&[], "w", 1.0);
        assert_eq!(f.tx_count, 0);
        assert!(f.tx_frequency.is_none());
        assert!(f.velocity_sol_per_day.is_none());
        assert_eq!(f.total_volume_lamports, 0);
    }

    #[test]
    fn test_filters_to_wallet_involvement() {
        let txs = vec![
            tx("w", "a", 1.0, Some(100)),
            tx("b", "w", 2.0, Some(200)),
            tx("x", "y", 50.0, Some(300)), // unrelated
        ];
        let f = extract_features(&txs, "w", 1.0);
        assert_eq!(f.tx_count, 2);
        assert_eq!(f.unique_counterparties, 2);
        assert!((f.total_volume_sol - 3.0).abs() < 1e-9);
        assert!((f.avg_transaction_value_sol - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_counterparties_exclude_self() {
        let txs = vec![tx("w", "a", 1.0, None), tx("w", "a", 1.0, None)];
        let f = extract_features(&txs, "w", 1.0);
        assert_eq!(f.unique_counterparties, 1);
    }

    #[test]
    fn test_rates_require_two_timestamps() {
        let txs = vec![tx("w", "a", 1.0, Some(100)), tx("w", "b", 1.0, None)];
        let f = extract_features(&txs, "w", 1.0);
        assert_eq!(f.tx_count, 2);
        assert!(f.tx_frequency.is_none());
        assert!(f.time_span_seconds.is_none());
    }

    #[test]
    fn test_frequency_and_velocity_over_one_day() {
        // 150 txs of 1 SOL spread over exactly one day.
        let mut txs = Vec::new();
        let day = 86_400_i64;
        for i in 0..150 {
            let ts = 1_700_000_000 + i * day / 149;
            txs.push(tx("w", &format!("c{i}"), 1.0, Some(ts)));
        }
        let f = extract_features(&txs, "w", 1.0);
        let freq = f.tx_frequency.unwrap();
        let vel = f.velocity_sol_per_day.unwrap();
        assert!((freq - 150.0).abs() < 1.0, "freq={freq}");
        assert!((vel - 150.0).abs() < 1.0, "vel={vel}");
    }

    #[test]
    fn test_time_span_clamped_to_minimum() {
        // Two transactions one second apart: span clamps to 1s and the
        // frequency stays finite instead of exploding.
        let txs = vec![
            tx("w", "a", 1.0, Some(1000)),
            tx("w", "b", 1.0, Some(1000)),
        ];
        let f = extract_features(&txs, "w", 1.0);
        assert_eq!(f.time_span_seconds, Some(1.0));
        let freq = f.tx_frequency.unwrap();
        assert!((freq - 2.0 * SECONDS_PER_DAY).abs() < 1e-6);
    }
}
