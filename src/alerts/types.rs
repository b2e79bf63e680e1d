use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

use crate::anomaly::types::{AnomalyType, Severity};
use crate::error::MonitorError;
use crate::listener::types::BridgeTransaction;

/// What an alert is about. Anomaly alerts reuse the rule name so that the
/// engine and the matcher produce identical group keys for the same condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AlertType {
    Anomaly(AnomalyType),
    BridgeSuccess,
    HighValueTransfer,
    ListenerFailed,
    ListenerRestartFailed,
    StoreUnavailable,
    Manual,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anomaly(t) => t.as_str(),
            Self::BridgeSuccess => "bridge_success",
            Self::HighValueTransfer => "high_value_transfer",
            Self::ListenerFailed => "listener_failed",
            Self::ListenerRestartFailed => "listener_restart_failed",
            Self::StoreUnavailable => "store_unavailable",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridge_success" => Ok(Self::BridgeSuccess),
            "high_value_transfer" => Ok(Self::HighValueTransfer),
            "listener_failed" => Ok(Self::ListenerFailed),
            "listener_restart_failed" => Ok(Self::ListenerRestartFailed),
            "store_unavailable" => Ok(Self::StoreUnavailable),
            "manual" => Ok(Self::Manual),
            other => other
                .parse::<AnomalyType>()
                .map(Self::Anomaly)
                .map_err(|_| MonitorError::Decode(format!("unknown alert type '{}'", other))),
        }
    }
}

impl From<AlertType> for String {
    fn from(value: AlertType) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for AlertType {
    type Error = MonitorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Low,
    Warning,
    Medium,
    High,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Warning => "warning",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Channels an alert of this severity is routed to, before filtering
    /// out channels that are not configured.
    pub fn channels(&self) -> &'static [ChannelType] {
        match self {
            Self::Critical => &[
                ChannelType::LiveFeed,
                ChannelType::Email,
                ChannelType::Slack,
                ChannelType::Discord,
                ChannelType::Webhook,
            ],
            Self::High | Self::Error => &[
                ChannelType::LiveFeed,
                ChannelType::Email,
                ChannelType::Slack,
                ChannelType::Webhook,
            ],
            Self::Warning | Self::Medium => &[ChannelType::LiveFeed, ChannelType::Discord],
            Self::Info | Self::Low => &[ChannelType::LiveFeed],
        }
    }
}

impl From<Severity> for AlertSeverity {
    fn from(value: Severity) -> Self {
        match value {
            Severity::Low => Self::Low,
            Severity::Medium => Self::Medium,
            Severity::High => Self::High,
            Severity::Critical => Self::Critical,
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "warning" => Ok(Self::Warning),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(MonitorError::Decode(format!("unknown alert severity '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Sent,
    Acknowledged,
    Resolved,
    Failed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            "failed" => Ok(Self::Failed),
            other => Err(MonitorError::Decode(format!("unknown alert status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    LiveFeed,
    Email,
    Slack,
    Discord,
    Webhook,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LiveFeed => "live_feed",
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Delivery record for one channel of one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub channel: ChannelType,
    pub target: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl ChannelDelivery {
    pub fn new(channel: ChannelType, target: impl Into<String>) -> Self {
        Self {
            channel,
            target: target.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            sent_at: None,
        }
    }

    /// Whether the next delivery round should try this channel.
    pub fn is_due(&self, max_retries: i32) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Failed => self.attempts < max_retries,
            DeliveryStatus::Sent => false,
        }
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Sent;
        self.attempts += 1;
        self.last_error = None;
        self.sent_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = DeliveryStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error);
    }
}

/// Intake payload for `AlertSystem::send_alert`.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub details: JsonValue,
    pub network: Option<String>,
    pub contract_address: Option<String>,
    /// Related transaction hash, part of the group key.
    pub transaction_ref: Option<String>,
    pub transaction_id: Option<i64>,
    pub anomaly_id: Option<i64>,
    pub auto_resolve_after: Option<Duration>,
}

impl AlertRequest {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            details: JsonValue::Null,
            network: None,
            contract_address: None,
            transaction_ref: None,
            transaction_id: None,
            anomaly_id: None,
            auto_resolve_after: None,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Attach the transaction's network, bridge contract, hash and id.
    pub fn with_transaction(mut self, tx: &BridgeTransaction) -> Self {
        self.network = Some(tx.network.clone());
        self.contract_address = Some(tx.bridge_contract.clone());
        self.transaction_ref = Some(tx.tx_hash.clone());
        self.transaction_id = tx.id;
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }

    pub fn with_anomaly(mut self, anomaly_id: Option<i64>) -> Self {
        self.anomaly_id = anomaly_id;
        self
    }

    pub fn auto_resolve_after(mut self, after: Duration) -> Self {
        self.auto_resolve_after = Some(after);
        self
    }

    pub fn group_key(&self) -> String {
        group_key(
            self.alert_type,
            self.network.as_deref(),
            self.contract_address.as_deref(),
            self.transaction_ref.as_deref(),
        )
    }
}

/// Deterministic key that collapses semantically identical alerts.
pub fn group_key(
    alert_type: AlertType,
    network: Option<&str>,
    contract: Option<&str>,
    transaction_ref: Option<&str>,
) -> String {
    let part = |v: Option<&str>| {
        v.map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "-".to_string())
    };
    format!(
        "{}|{}|{}|{}",
        alert_type.as_str(),
        part(network),
        part(contract),
        part(transaction_ref)
    )
}

/// A persisted alert envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<i64>,
    pub alert_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub details: JsonValue,
    pub anomaly_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub transaction_ref: Option<String>,
    pub network: Option<String>,
    pub contract_address: Option<String>,
    pub status: AlertStatus,
    pub group_key: String,
    pub channels: Vec<ChannelDelivery>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub auto_resolve: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn from_request(
        request: AlertRequest,
        channels: Vec<ChannelDelivery>,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Self {
        let group_key = request.group_key();
        // Alerts routed only to already-delivered channels are settled at birth;
        // everything else is due for the retry sweep straight away.
        let pending = channels.iter().any(|c| c.is_due(max_retries));
        Self {
            id: None,
            alert_id: uuid::Uuid::new_v4().to_string(),
            alert_type: request.alert_type,
            severity: request.severity,
            title: request.title,
            message: request.message,
            details: request.details,
            anomaly_id: request.anomaly_id,
            transaction_id: request.transaction_id,
            transaction_ref: request.transaction_ref,
            network: request.network,
            contract_address: request.contract_address,
            status: if pending { AlertStatus::Pending } else { AlertStatus::Sent },
            group_key,
            channels,
            retry_count: 0,
            max_retries,
            next_retry_at: pending.then_some(now),
            auto_resolve: request.auto_resolve_after.is_some(),
            expires_at: request.auto_resolve_after.map(|after| now + after),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            created_at: now,
        }
    }

    pub fn has_due_channels(&self) -> bool {
        self.channels.iter().any(|c| c.is_due(self.max_retries))
    }

    pub fn all_channels_sent(&self) -> bool {
        self.channels.iter().all(|c| c.status == DeliveryStatus::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_is_deterministic() {
        let a = group_key(
            AlertType::Anomaly(AnomalyType::BridgeTimeout),
            Some("ethereum"),
            Some("0xAbC"),
            Some("0x01"),
        );
        let b = group_key(
            AlertType::Anomaly(AnomalyType::BridgeTimeout),
            Some("ethereum"),
            Some("0xabc"),
            Some("0x01"),
        );
        assert_eq!(a, b);
        assert_eq!(a, "bridge_timeout|ethereum|0xabc|0x01");
    }

    #[test]
    fn test_group_key_missing_parts() {
        let key = group_key(AlertType::ListenerFailed, Some("polygon"), None, Some(""));
        assert_eq!(key, "listener_failed|polygon|-|-");
    }

    #[test]
    fn test_alert_type_strings() {
        let t: AlertType = "value_mismatch".parse().unwrap();
        assert_eq!(t, AlertType::Anomaly(AnomalyType::ValueMismatch));
        assert_eq!("bridge_success".parse::<AlertType>().unwrap(), AlertType::BridgeSuccess);
        assert!("nonsense".parse::<AlertType>().is_err());

        let json = serde_json::to_string(&AlertType::Anomaly(AnomalyType::GasAnomaly)).unwrap();
        assert_eq!(json, "\"gas_anomaly\"");
    }

    #[test]
    fn test_channels_by_severity() {
        assert_eq!(AlertSeverity::Info.channels(), &[ChannelType::LiveFeed]);
        assert!(AlertSeverity::Critical.channels().contains(&ChannelType::Discord));
        assert!(AlertSeverity::Critical.channels().contains(&ChannelType::Slack));
        assert!(AlertSeverity::High.channels().contains(&ChannelType::Email));
        assert!(!AlertSeverity::High.channels().contains(&ChannelType::Discord));
        assert_eq!(
            AlertSeverity::Warning.channels(),
            AlertSeverity::Medium.channels()
        );
    }

    #[test]
    fn test_channel_due_rules() {
        let mut delivery = ChannelDelivery::new(ChannelType::Email, "ops@example.org");
        assert!(delivery.is_due(3));
        delivery.mark_failed("smtp down".into());
        delivery.mark_failed("smtp down".into());
        assert!(delivery.is_due(3));
        delivery.mark_failed("smtp down".into());
        assert!(!delivery.is_due(3));
        assert_eq!(delivery.attempts, 3);

        let mut ok = ChannelDelivery::new(ChannelType::Slack, "hooks.slack.com");
        ok.mark_sent(Utc::now());
        assert!(!ok.is_due(3));
    }

    #[test]
    fn test_from_request_sets_expiry() {
        let now = Utc::now();
        let req = AlertRequest::new(AlertType::BridgeSuccess, AlertSeverity::Info, "t", "m")
            .with_network("ethereum")
            .auto_resolve_after(Duration::hours(24));
        let alert = Alert::from_request(req, vec![], 3, now);
        assert!(alert.auto_resolve);
        assert_eq!(alert.expires_at, Some(now + Duration::hours(24)));
        assert_eq!(alert.status, AlertStatus::Sent);
        assert_eq!(alert.next_retry_at, None);
        assert_eq!(alert.group_key, "bridge_success|ethereum|-|-");
    }

    #[test]
    fn test_from_request_with_due_channel_is_pending_and_sweepable() {
        let now = Utc::now();
        let mut live = ChannelDelivery::new(ChannelType::LiveFeed, "feed");
        live.mark_sent(now);
        let email = ChannelDelivery::new(ChannelType::Email, "ops@example.org");
        let req = AlertRequest::new(AlertType::Manual, AlertSeverity::High, "t", "m");

        let alert = Alert::from_request(req, vec![live, email], 3, now);
        assert_eq!(alert.status, AlertStatus::Pending);
        assert_eq!(alert.next_retry_at, Some(now));
        assert!(alert.has_due_channels());
        assert!(!alert.all_channels_sent());
    }
}
