use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::alerts::system::AlertStats;
use crate::alerts::types::Alert;
use crate::anomaly::types::Anomaly;
use crate::listener::supervisor::ListenerStatusReport;
use crate::listener::types::{BridgeTransaction, ListenerHealth};
use crate::matcher::matching::MatchedPair;

/// Events pushed to live-feed subscribers, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedEvent {
    Transaction(BridgeTransaction),
    Anomaly(Anomaly),
    Alert(Alert),
    TransactionMatched(MatchedPair),
    ListenerStatus(Vec<ListenerHealth>),
    SystemStatus(SystemStatus),
}

impl FeedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Anomaly(_) => "anomaly",
            Self::Alert(_) => "alert",
            Self::TransactionMatched(_) => "transaction_matched",
            Self::ListenerStatus(_) => "listener_status",
            Self::SystemStatus(_) => "system_status",
        }
    }

    fn networks(&self) -> Vec<&str> {
        match self {
            Self::Transaction(tx) => vec![tx.network.as_str()],
            Self::Anomaly(a) => vec![a.network.as_str()],
            Self::Alert(a) => a.network.as_deref().into_iter().collect(),
            Self::TransactionMatched(pair) => {
                vec![pair.source.network.as_str(), pair.destination.network.as_str()]
            }
            Self::ListenerStatus(health) => health.iter().map(|h| h.network.as_str()).collect(),
            Self::SystemStatus(_) => Vec::new(),
        }
    }

    fn severity(&self) -> Option<&'static str> {
        match self {
            Self::Anomaly(a) => Some(a.severity.as_str()),
            Self::Alert(a) => Some(a.severity.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub active_listeners: usize,
    pub total_listeners: usize,
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
}

/// Per-subscriber filter. Empty lists match everything.
///
/// Network and severity filters only apply to events that carry the field;
/// status events without a network still reach a network-filtered subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedFilter {
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub severities: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
}

impl FeedFilter {
    pub fn matches(&self, event: &FeedEvent) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| t == event.kind()) {
            return false;
        }

        if !self.networks.is_empty() {
            let networks = event.networks();
            if !networks.is_empty()
                && !networks
                    .iter()
                    .any(|n| self.networks.iter().any(|f| f.eq_ignore_ascii_case(n)))
            {
                return false;
            }
        }

        if !self.severities.is_empty() {
            if let Some(severity) = event.severity() {
                if !self.severities.iter().any(|s| s == severity) {
                    return false;
                }
            }
        }

        true
    }
}

/// Inbound requests from a live-feed client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedRequest {
    Subscribe {
        #[serde(flatten)]
        filter: FeedFilter,
    },
    AcknowledgeAlert {
        alert_id: i64,
        #[serde(default)]
        user: Option<String>,
    },
    ResolveAlert {
        alert_id: i64,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },
    RequestDashboardData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedResponse {
    Subscribed(FeedFilter),
    AlertAcknowledged(Alert),
    AlertResolved(Alert),
    DashboardData(Box<DashboardData>),
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub recent_alerts: Vec<Alert>,
    pub recent_anomalies: Vec<Anomaly>,
    pub listener_status: ListenerStatusReport,
    pub alert_stats: AlertStats,
    pub transaction_counts: HashMap<String, i64>,
}

/// Broadcast hub for live-feed events. Cloning shares the same channel.
#[derive(Clone)]
pub struct LiveFeed {
    sender: broadcast::Sender<FeedEvent>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers reached. No subscribers is not an error.
    pub fn publish(&self, event: FeedEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::{AlertRequest, AlertSeverity, AlertType};
    use crate::listener::types::EventKind;
    use crate::test_utils::sample_tx;

    fn alert_event(network: &str, severity: AlertSeverity) -> FeedEvent {
        let req = AlertRequest::new(AlertType::Manual, severity, "t", "m").with_network(network);
        FeedEvent::Alert(Alert::from_request(req, vec![], 3, Utc::now()))
    }

    #[test]
    fn test_event_wire_shape() {
        let tx = sample_tx("ethereum", 1, EventKind::Lock, "10", None);
        let json = serde_json::to_value(FeedEvent::Transaction(tx)).unwrap();
        assert_eq!(json["type"], "transaction");
        assert_eq!(json["data"]["network"], "ethereum");
        assert_eq!(json["data"]["event_kind"], "lock");
    }

    #[test]
    fn test_filter_by_network_and_severity() {
        let filter = FeedFilter {
            networks: vec!["polygon".into()],
            severities: vec!["critical".into()],
            types: vec![],
        };
        assert!(filter.matches(&alert_event("polygon", AlertSeverity::Critical)));
        assert!(!filter.matches(&alert_event("ethereum", AlertSeverity::Critical)));
        assert!(!filter.matches(&alert_event("polygon", AlertSeverity::Info)));

        let status = FeedEvent::SystemStatus(SystemStatus {
            active_listeners: 1,
            total_listeners: 2,
            healthy: false,
            timestamp: Utc::now(),
        });
        assert!(filter.matches(&status));
    }

    #[test]
    fn test_filter_by_type() {
        let filter = FeedFilter {
            types: vec!["transaction".into()],
            ..Default::default()
        };
        assert!(!filter.matches(&alert_event("polygon", AlertSeverity::High)));
        let tx = sample_tx("polygon", 137, EventKind::Mint, "5", None);
        assert!(filter.matches(&FeedEvent::Transaction(tx)));
    }

    #[test]
    fn test_parse_requests() {
        let req: FeedRequest =
            serde_json::from_str(r#"{"type":"subscribe","networks":["bsc"]}"#).unwrap();
        match req {
            FeedRequest::Subscribe { filter } => assert_eq!(filter.networks, vec!["bsc"]),
            other => panic!("unexpected {:?}", other),
        }

        let req: FeedRequest =
            serde_json::from_str(r#"{"type":"acknowledge_alert","alert_id":7}"#).unwrap();
        assert!(matches!(req, FeedRequest::AcknowledgeAlert { alert_id: 7, user: None }));

        let req: FeedRequest = serde_json::from_str(r#"{"type":"request_dashboard_data"}"#).unwrap();
        assert!(matches!(req, FeedRequest::RequestDashboardData));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let feed = LiveFeed::new(16);
        assert_eq!(feed.publish(alert_event("bsc", AlertSeverity::Low)), 0);

        let mut rx = feed.subscribe();
        assert_eq!(feed.publish(alert_event("bsc", AlertSeverity::Low)), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "alert");
    }
}
