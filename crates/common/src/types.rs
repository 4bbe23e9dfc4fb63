use serde::{Deserialize, Serialize};

/// 1 SOL = 1_000_000_000 lamports.
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Anomaly / alert severity. Ordering is part of the contract:
/// `low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Scheduling tier of a tracked wallet. Unknown strings normalize to `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    Watchlist,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Watchlist => "watchlist",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "watchlist" => Self::Watchlist,
            _ => Self::Normal,
        }
    }

    /// Sort rank for the scheduler: higher analyzes first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 3,
            Self::Watchlist => 2,
            Self::Normal => 1,
        }
    }
}

/// Escalation stage of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskStage {
    Normal,
    Warning,
    Critical,
}

impl RiskStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "warning" => Self::Warning,
            _ => Self::Normal,
        }
    }

    /// Stage → scheduling tier: warnings land on the watchlist.
    pub fn to_priority(self) -> Priority {
        match self {
            Self::Normal => Priority::Normal,
            Self::Warning => Priority::Watchlist,
            Self::Critical => Priority::Critical,
        }
    }
}

/// Risk banding of a trust score. One mapping for the whole codebase:
/// `<30 critical, <50 high, <70 medium, else low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 30.0 {
            Self::Critical
        } else if score < 50.0 {
            Self::High
        } else if score < 70.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Wire encoding for the on-chain attestation: Low=0 … Critical=3.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// Reputation trend over the score timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Degrading => "degrading",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "improving" => Self::Improving,
            "degrading" => Self::Degrading,
            _ => Self::Stable,
        }
    }
}

/// Canonical transaction shape produced by the parser. Everything
/// downstream (features, graph, store) consumes this and only this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTransaction {
    pub sender: String,
    pub receiver: String,
    pub amount_lamports: u64,
    pub timestamp: Option<i64>,
    pub signature: Option<String>,
    pub slot: Option<u64>,
}

impl ParsedTransaction {
    pub fn amount_sol(&self) -> f64 {
        self.amount_lamports as f64 / LAMPORTS_PER_SOL
    }
}

/// Metadata blob persisted alongside every trust score. The flags are
/// stored as raw JSON objects so the store stays agnostic of rule shapes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreMetadata {
    #[serde(default)]
    pub anomaly_flags: Vec<serde_json::Value>,
    #[serde(default)]
    pub is_anomalous: bool,
    #[serde(default)]
    pub tx_count: u32,
}

impl ScoreMetadata {
    /// Parse from a stored `metadata_json` column; None on absent/invalid.
    pub fn parse(metadata_json: Option<&str>) -> Option<Self> {
        serde_json::from_str(metadata_json?).ok()
    }

    /// Highest severity among the stored flags, if any carry one.
    pub fn max_severity(&self) -> Option<Severity> {
        self.anomaly_flags
            .iter()
            .filter_map(|f| f.get("severity").and_then(|s| s.as_str()))
            .filter_map(Severity::parse)
            .max()
    }

    /// Rule names (`rule_name`, falling back to `type`) of the stored flags.
    pub fn rule_names(&self) -> Vec<String> {
        self.anomaly_flags
            .iter()
            .filter_map(|f| {
                f.get("rule_name")
                    .or_else(|| f.get("type"))
                    .and_then(|s| s.as_str())
            })
            .map(str::to_string)
            .collect()
    }
}

/// One entry from `getSignaturesForAddress`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: Option<u64>,
    #[serde(rename = "blockTime")]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
}

/// `getTransaction` result payload (JSON encoding). Shapes are lenient:
/// every field the parser touches is optional so malformed upstream data
/// degrades to a parse miss instead of a deserialization error.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
    pub transaction: Option<RawTransactionEnvelope>,
    pub meta: Option<RawTransactionMeta>,
    #[serde(rename = "blockTime")]
    pub block_time: Option<i64>,
    pub slot: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTransactionEnvelope {
    pub message: Option<RawMessage>,
    #[serde(default)]
    pub signatures: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "accountKeys", default)]
    pub account_keys: Vec<AccountKey>,
    #[serde(default)]
    pub instructions: Vec<RawInstruction>,
    pub header: Option<RawHeader>,
}

/// `accountKeys` entries arrive as plain strings (json encoding) or as
/// objects with a `pubkey` field (jsonParsed).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Plain(String),
    Keyed { pubkey: String },
}

impl AccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Keyed { pubkey } => pubkey,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHeader {
    #[serde(rename = "numRequiredSignatures", default)]
    pub num_required_signatures: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawInstruction {
    #[serde(rename = "programIdIndex")]
    pub program_id_index: Option<usize>,
    #[serde(default)]
    pub accounts: Vec<usize>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTransactionMeta {
    #[serde(rename = "preBalances", default)]
    pub pre_balances: Vec<u64>,
    #[serde(rename = "postBalances", default)]
    pub post_balances: Vec<u64>,
    #[serde(rename = "innerInstructions", default)]
    pub inner_instructions: Vec<RawInnerInstructions>,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[serde(rename = "loadedAddresses")]
    pub loaded_addresses: Option<RawLoadedAddresses>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawInnerInstructions {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub instructions: Vec<RawInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn test_priority_normalizes_unknown_to_normal() {
        assert_eq!(Priority::parse("critical"), Priority::Critical);
        assert_eq!(Priority::parse("Watchlist"), Priority::Watchlist);
        assert_eq!(Priority::parse("vip"), Priority::Normal);
        assert_eq!(Priority::Critical.rank(), 3);
        assert_eq!(Priority::Normal.rank(), 1);
    }

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(RiskLevel::from_score(10.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(29.9), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(30.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(49.9), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(50.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(69.9), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(70.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(100.0), RiskLevel::Low);
        assert_eq!(RiskLevel::Critical.as_u8(), 3);
        assert_eq!(RiskLevel::Low.as_u8(), 0);
    }

    #[test]
    fn test_risk_stage_to_priority_mirror() {
        assert_eq!(RiskStage::Warning.to_priority(), Priority::Watchlist);
        assert_eq!(RiskStage::Critical.to_priority(), Priority::Critical);
        assert_eq!(RiskStage::Normal.to_priority(), Priority::Normal);
    }

    #[test]
    fn test_score_metadata_roundtrip() {
        let json = r#"{
            "anomaly_flags": [
                {"rule_name": "burst_transactions", "severity": "high"},
                {"type": "suspicious_velocity", "severity": "critical"}
            ],
            "is_anomalous": true,
            "tx_count": 12
        }"#;
        let meta = ScoreMetadata::parse(Some(json)).unwrap();
        assert!(meta.is_anomalous);
        assert_eq!(meta.tx_count, 12);
        assert_eq!(meta.max_severity(), Some(Severity::Critical));
        assert_eq!(
            meta.rule_names(),
            vec!["burst_transactions", "suspicious_velocity"]
        );
    }

    #[test]
    fn test_score_metadata_invalid_is_none() {
        assert!(ScoreMetadata::parse(None).is_none());
        assert!(ScoreMetadata::parse(Some("not json")).is_none());
    }

    #[test]
    fn test_account_keys_both_encodings() {
        let json = r#"{
            "accountKeys": ["Aaa", {"pubkey": "Bbb"}],
            "instructions": [],
            "header": {"numRequiredSignatures": 1}
        }"#;
        let msg: RawMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.account_keys[0].pubkey(), "Aaa");
        assert_eq!(msg.account_keys[1].pubkey(), "Bbb");
    }

    #[test]
    fn test_parsed_transaction_amount_sol() {
        let tx = ParsedTransaction {
            sender: "a".into(),
            receiver: "b".into(),
            amount_lamports: 1_500_000_000,
            timestamp: Some(1_700_000_000),
            signature: Some("sig".into()),
            slot: Some(1),
        };
        assert!((tx.amount_sol() - 1.5).abs() < 1e-9);
    }
}
