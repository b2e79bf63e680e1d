use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

use crate::error::MonitorError;
use crate::listener::types::BridgeTransaction;

/// The detection rules. Each one yields at most one finding per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    BridgeTimeout,
    ValueMismatch,
    DuplicateTransaction,
    SuspiciousContract,
    UnusualVolume,
    FailedVerification,
    ReplayAttack,
    GasAnomaly,
}

impl AnomalyType {
    pub const ALL: [AnomalyType; 8] = [
        Self::BridgeTimeout,
        Self::ValueMismatch,
        Self::DuplicateTransaction,
        Self::SuspiciousContract,
        Self::UnusualVolume,
        Self::FailedVerification,
        Self::ReplayAttack,
        Self::GasAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BridgeTimeout => "bridge_timeout",
            Self::ValueMismatch => "value_mismatch",
            Self::DuplicateTransaction => "duplicate_transaction",
            Self::SuspiciousContract => "suspicious_contract",
            Self::UnusualVolume => "unusual_volume",
            Self::FailedVerification => "failed_verification",
            Self::ReplayAttack => "replay_attack",
            Self::GasAnomaly => "gas_anomaly",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyType {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MonitorError::Decode(format!("unknown anomaly type '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(MonitorError::Decode(format!("unknown severity '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Active,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
            Self::FalsePositive => "false_positive",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::FalsePositive)
    }

    pub fn can_transition_to(&self, next: AnomalyStatus) -> bool {
        match self {
            Self::Active => next != Self::Active,
            Self::Investigating => next.is_terminal(),
            Self::Resolved | Self::FalsePositive => false,
        }
    }
}

impl FromStr for AnomalyStatus {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "investigating" => Ok(Self::Investigating),
            "resolved" => Ok(Self::Resolved),
            "false_positive" => Ok(Self::FalsePositive),
            other => Err(MonitorError::Decode(format!("unknown anomaly status '{}'", other))),
        }
    }
}

/// Output of a single rule before it is persisted.
#[derive(Debug, Clone)]
pub struct Finding {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub data: JsonValue,
    pub related_transaction_ids: Vec<i64>,
}

/// A persisted detection finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Option<i64>,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub status: AnomalyStatus,
    pub transaction_id: Option<i64>,
    pub related_transaction_ids: Vec<i64>,
    pub network: String,
    pub contract_address: Option<String>,
    pub title: String,
    pub description: String,
    pub data: JsonValue,
    pub confidence: f64,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Ids of the alerts raised for this anomaly.
    pub alert_ids: Vec<i64>,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn from_finding(tx: &BridgeTransaction, finding: Finding, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            anomaly_type: finding.anomaly_type,
            severity: finding.severity,
            status: AnomalyStatus::Active,
            transaction_id: tx.id,
            related_transaction_ids: finding.related_transaction_ids,
            network: tx.network.clone(),
            contract_address: Some(tx.bridge_contract.clone()),
            title: finding.title,
            description: finding.description,
            data: finding.data,
            confidence: finding.confidence.clamp(0.0, 1.0),
            resolution_notes: None,
            resolved_by: None,
            resolved_at: None,
            alert_ids: Vec::new(),
            detected_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_strings_round_trip() {
        for t in AnomalyType::ALL {
            assert_eq!(t.as_str().parse::<AnomalyType>().unwrap(), t);
        }
        assert!("large_transfer".parse::<AnomalyType>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use AnomalyStatus::*;
        assert!(Active.can_transition_to(Investigating));
        assert!(Active.can_transition_to(Resolved));
        assert!(Active.can_transition_to(FalsePositive));
        assert!(!Active.can_transition_to(Active));
        assert!(Investigating.can_transition_to(Resolved));
        assert!(!Investigating.can_transition_to(Active));
        assert!(!Resolved.can_transition_to(Active));
        assert!(!FalsePositive.can_transition_to(Resolved));
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }
}
