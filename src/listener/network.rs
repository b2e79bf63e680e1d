use serde::{Deserialize, Serialize};

use crate::alerts::types::{AlertRequest, AlertSeverity, AlertType};
use crate::listener::types::BridgeTransaction;

/// Network-specific behaviour layered on top of the shared connector:
/// token seeds (see `tokens::registry`), high-value thresholds and secondary checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Ethereum,
    Polygon,
    Bsc,
    #[default]
    Generic,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ethereum => "ethereum",
            Self::Polygon => "polygon",
            Self::Bsc => "bsc",
            Self::Generic => "generic",
        }
    }

    /// Transfers at or above this formatted amount raise a high-value alert.
    pub fn high_value_threshold(&self) -> f64 {
        match self {
            Self::Ethereum => 100_000.0,
            Self::Polygon | Self::Bsc => 50_000.0,
            Self::Generic => 100_000.0,
        }
    }

    /// Gas price (gwei) above which a bridge event is worth a log line.
    fn gas_price_warning_gwei(&self) -> Option<f64> {
        match self {
            Self::Ethereum => Some(300.0),
            _ => None,
        }
    }

    /// Extra checks run on every freshly ingested transaction.
    pub fn secondary_checks(&self, tx: &BridgeTransaction) -> Vec<AlertRequest> {
        let mut alerts = Vec::new();

        let amount = tx.amount_value();
        let threshold = self.high_value_threshold();
        if amount >= threshold {
            alerts.push(
                AlertRequest::new(
                    AlertType::HighValueTransfer,
                    AlertSeverity::Warning,
                    format!("High-value {} on {}", tx.event_kind, tx.network),
                    format!(
                        "{} {} {} by {} exceeds the {} threshold of {:.0}",
                        tx.event_kind, tx.amount, tx.token_symbol, tx.from_address, tx.network, threshold
                    ),
                )
                .with_transaction(tx)
                .with_details(serde_json::json!({
                    "amount": tx.amount,
                    "token": tx.token_symbol,
                    "threshold": threshold,
                    "network_kind": self.as_str(),
                })),
            );
        }

        if let (Some(limit), Some(gwei)) = (self.gas_price_warning_gwei(), tx.gas_price_gwei()) {
            if gwei > limit {
                tracing::warn!(
                    network = %tx.network,
                    tx_hash = %tx.tx_hash,
                    gas_price_gwei = gwei,
                    "Bridge event paid an unusually high gas price"
                );
            }
        }

        alerts
    }
}
