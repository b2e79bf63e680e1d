use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MonitorError;

/// The four bridge-contract event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lock,
    Unlock,
    Mint,
    Burn,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Mint => "mint",
            Self::Burn => "burn",
        }
    }

    /// Lock and Burn move funds off a chain.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Lock | Self::Burn)
    }

    /// An outbound event pairs with an inbound one and vice versa.
    pub fn is_complementary(&self, other: EventKind) -> bool {
        self.is_outbound() != other.is_outbound()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock" => Ok(Self::Lock),
            "unlock" => Ok(Self::Unlock),
            "mint" => Ok(Self::Mint),
            "burn" => Ok(Self::Burn),
            other => Err(MonitorError::Decode(format!("unknown event kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(MonitorError::Decode(format!("unknown transaction status '{}'", other))),
        }
    }
}

/// A decoded bridge event normalized to a chain-independent shape.
///
/// Addresses and hashes are lowercase `0x`-prefixed hex. `(tx_hash, log_index, network)`
/// is the natural key; `id` is assigned by the store on first insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTransaction {
    pub id: Option<i64>,
    pub network: String,
    pub chain_id: i64,
    pub block_number: i64,
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: i32,
    pub event_kind: EventKind,
    pub bridge_contract: String,
    pub token_address: String,
    pub token_symbol: String,
    pub token_decimals: i16,
    pub amount_raw: BigDecimal,
    /// Human-readable amount produced by integer division, e.g. "1.5".
    pub amount: String,
    pub from_address: String,
    pub to_address: String,
    pub bridge_id: Option<String>,
    pub target_chain_id: Option<i64>,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
    pub gas_used: Option<i64>,
    /// Effective gas price in wei.
    pub gas_price: Option<i64>,
    pub matched_transaction_id: Option<i64>,
    pub is_matched: bool,
    pub matched_at: Option<DateTime<Utc>>,
}

impl BridgeTransaction {
    /// Formatted amount as a float, for comparisons and thresholds only.
    pub fn amount_value(&self) -> f64 {
        self.amount.parse().unwrap_or(0.0)
    }

    pub fn is_outbound(&self) -> bool {
        self.event_kind.is_outbound()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }

    pub fn gas_price_gwei(&self) -> Option<f64> {
        self.gas_price.map(|wei| wei as f64 / 1e9)
    }

    pub fn same_record(&self, other: &BridgeTransaction) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => {
                self.tx_hash == other.tx_hash
                    && self.log_index == other.log_index
                    && self.network == other.network
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Connecting,
    Listening,
    Reconnecting,
    Failed,
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// True once the connector task has ended and needs an external restart.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

/// Transient per-network connection state. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerHealth {
    pub network: String,
    pub chain_id: i64,
    pub state: ListenerState,
    pub last_processed_block: Option<u64>,
    pub reconnect_attempts: u32,
    pub subscriptions: usize,
    pub last_error: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl ListenerHealth {
    pub fn new(network: &str, chain_id: i64) -> Self {
        Self {
            network: network.to_string(),
            chain_id,
            state: ListenerState::Stopped,
            last_processed_block: None,
            reconnect_attempts: 0,
            subscriptions: 0,
            last_error: None,
            last_event_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_direction() {
        assert!(EventKind::Lock.is_outbound());
        assert!(EventKind::Burn.is_outbound());
        assert!(!EventKind::Unlock.is_outbound());
        assert!(!EventKind::Mint.is_outbound());

        assert!(EventKind::Lock.is_complementary(EventKind::Mint));
        assert!(EventKind::Burn.is_complementary(EventKind::Unlock));
        assert!(!EventKind::Lock.is_complementary(EventKind::Burn));
        assert!(!EventKind::Mint.is_complementary(EventKind::Unlock));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [TxStatus::Pending, TxStatus::Completed, TxStatus::Failed, TxStatus::Timeout] {
            assert_eq!(status.as_str().parse::<TxStatus>().unwrap(), status);
        }
        assert!("matched".parse::<TxStatus>().is_err());
        assert!(!TxStatus::Pending.is_terminal());
        assert!(TxStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_listener_state_down() {
        assert!(ListenerState::Failed.is_down());
        assert!(ListenerState::Stopped.is_down());
        assert!(!ListenerState::Reconnecting.is_down());
        assert!(!ListenerState::Listening.is_down());
    }
}
