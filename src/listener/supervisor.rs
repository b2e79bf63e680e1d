use alloy::primitives::Address;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::connector::ChainConnector;
use super::types::{BridgeTransaction, ListenerHealth, ListenerState};
use crate::alerts::system::AlertSystem;
use crate::alerts::types::{AlertRequest, AlertSeverity, AlertType};
use crate::config::{ListenerConfig, NetworkConfig};
use crate::error::Result;
use crate::feed::{FeedEvent, LiveFeed, SystemStatus};

const PLACEHOLDER_MARKERS: [&str; 4] = ["YOUR_", "your-", "<", "example"];

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatusReport {
    pub active: usize,
    pub total: usize,
    pub networks: Vec<ListenerHealth>,
}

impl ListenerStatusReport {
    pub fn healthy(&self) -> bool {
        self.total > 0 && self.active == self.total
    }
}

/// A network gets a connector only with a real endpoint and a non-zero bridge address.
pub fn is_network_enabled(network: &NetworkConfig) -> bool {
    if !network.enabled {
        return false;
    }
    let endpoint = network.rpc_ws.trim();
    if endpoint.is_empty() || PLACEHOLDER_MARKERS.iter().any(|m| endpoint.contains(m)) {
        return false;
    }
    matches!(Address::from_str(&network.bridge_address), Ok(addr) if addr != Address::ZERO)
}

/// Owns one connector per enabled network and restarts the ones that died.
pub struct ListenerSupervisor {
    listener: ListenerConfig,
    connectors: Vec<Arc<ChainConnector>>,
    alerts: Arc<AlertSystem>,
    feed: LiveFeed,
    restart_failures: Mutex<HashMap<String, u32>>,
    shutdown: CancellationToken,
}

impl ListenerSupervisor {
    pub fn initialize(
        networks: &[NetworkConfig],
        listener: ListenerConfig,
        sink: mpsc::Sender<BridgeTransaction>,
        alerts: Arc<AlertSystem>,
        feed: LiveFeed,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let mut connectors = Vec::new();
        for network in networks {
            if !is_network_enabled(network) {
                tracing::warn!(
                    network = %network.name,
                    "Network disabled or missing endpoint/bridge address, skipping"
                );
                continue;
            }
            let connector = ChainConnector::new(
                network.clone(),
                listener.clone(),
                sink.clone(),
                alerts.clone(),
            )?;
            connectors.push(Arc::new(connector));
        }

        tracing::info!(
            enabled = connectors.len(),
            configured = networks.len(),
            "Listener supervisor initialized"
        );

        Ok(Self {
            listener,
            connectors,
            alerts,
            feed,
            restart_failures: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn networks(&self) -> Vec<&str> {
        self.connectors.iter().map(|c| c.network()).collect()
    }

    pub async fn start(&self) {
        for connector in &self.connectors {
            tracing::info!(network = %connector.network(), "Starting listener");
            connector.start_listening(&self.shutdown).await;
        }
    }

    pub async fn status(&self) -> ListenerStatusReport {
        let mut networks = Vec::with_capacity(self.connectors.len());
        for connector in &self.connectors {
            networks.push(connector.health().await);
        }
        ListenerStatusReport {
            active: networks
                .iter()
                .filter(|h| h.state == ListenerState::Listening)
                .count(),
            total: networks.len(),
            networks,
        }
    }

    /// Restart connectors whose task has ended, then publish their status.
    pub async fn health_sweep(&self) {
        for connector in &self.connectors {
            let state = connector.health().await.state;
            if !state.is_down() {
                continue;
            }
            self.restart(connector).await;
        }

        let report = self.status().await;
        self.feed
            .publish(FeedEvent::ListenerStatus(report.networks.clone()));
        self.feed.publish(FeedEvent::SystemStatus(SystemStatus {
            active_listeners: report.active,
            total_listeners: report.total,
            healthy: report.healthy(),
            timestamp: Utc::now(),
        }));
    }

    async fn restart(&self, connector: &Arc<ChainConnector>) {
        let network = connector.network().to_string();
        tracing::warn!(network = %network, "Listener is down, restarting");

        // Probe before spawning so a dead endpoint counts as a failed restart
        match connector.connect().await {
            Ok(_) => {
                self.restart_failures.lock().await.remove(&network);
                connector.start_listening(&self.shutdown).await;
            }
            Err(e) => {
                let failures = {
                    let mut map = self.restart_failures.lock().await;
                    let count = map.entry(network.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                tracing::error!(network = %network, failures, error = %e, "Listener restart failed");

                if failures >= self.listener.restart_escalation_threshold {
                    let request = AlertRequest::new(
                        AlertType::ListenerRestartFailed,
                        AlertSeverity::Warning,
                        format!("Listener for {} keeps failing to restart", network),
                        format!("{} consecutive restart attempts failed: {}", failures, e),
                    )
                    .with_network(&network)
                    .with_details(serde_json::json!({ "failures": failures }));
                    self.alerts.raise(request).await;
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        let period = self.listener.health_check_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => self.health_sweep().await,
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Listener supervisor shutting down");
                    break;
                }
            }
        }
    }

    pub async fn stop(&self) {
        for connector in &self.connectors {
            connector.stop().await;
        }
        tracing::info!(count = self.connectors.len(), "All listeners stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::connector::tests::network;
    use crate::test_utils::alert_system;

    #[test]
    fn test_network_enablement() {
        assert!(is_network_enabled(&network("ethereum", 1, "wss://eth.node.io")));

        let mut disabled = network("ethereum", 1, "wss://eth.node.io");
        disabled.enabled = false;
        assert!(!is_network_enabled(&disabled));

        for placeholder in [
            "",
            "wss://mainnet.infura.io/ws/v3/YOUR_PROJECT_ID",
            "wss://your-node/ws",
            "<rpc url>",
            "wss://rpc.example.com",
        ] {
            assert!(!is_network_enabled(&network("ethereum", 1, placeholder)), "{}", placeholder);
        }

        let mut zero = network("ethereum", 1, "wss://eth.node.io");
        zero.bridge_address = format!("{:#x}", Address::ZERO);
        assert!(!is_network_enabled(&zero));

        let mut invalid = network("ethereum", 1, "wss://eth.node.io");
        invalid.bridge_address = "0x1234".into();
        assert!(!is_network_enabled(&invalid));
    }

    fn supervisor(rpc_ws: &str, listener: ListenerConfig) -> (ListenerSupervisor, Arc<crate::store::memory::MemoryStore>, LiveFeed) {
        let (alerts, store) = alert_system();
        let feed = LiveFeed::new(64);
        let (sink, _rx) = mpsc::channel(8);
        let mut disabled = network("polygon", 137, "wss://polygon.node.io");
        disabled.enabled = false;
        let networks = vec![network("ethereum", 1, rpc_ws), disabled];
        let sup = ListenerSupervisor::initialize(
            &networks,
            listener,
            sink,
            alerts,
            feed.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        (sup, store, feed)
    }

    #[tokio::test]
    async fn test_initialize_skips_disabled_networks() {
        let (sup, _, _) = supervisor("wss://eth.node.io", ListenerConfig::default());
        assert_eq!(sup.networks(), vec!["ethereum"]);

        let status = sup.status().await;
        assert_eq!(status.total, 1);
        assert_eq!(status.active, 0);
        assert!(!status.healthy());
        assert_eq!(status.networks[0].state, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_repeated_restart_failures_escalate() {
        let listener = ListenerConfig {
            restart_escalation_threshold: 2,
            ..ListenerConfig::default()
        };
        let (sup, store, feed) = supervisor("ws://not a valid endpoint", listener);
        let mut rx = feed.subscribe();

        sup.health_sweep().await;
        assert!(store.alerts().is_empty());
        assert_eq!(rx.recv().await.unwrap().kind(), "listener_status");
        assert_eq!(rx.recv().await.unwrap().kind(), "system_status");

        sup.health_sweep().await;
        let alerts = store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ListenerRestartFailed);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);

        // Further failures inside the dedup window collapse into the same alert
        sup.health_sweep().await;
        assert_eq!(store.alerts().len(), 1);
    }
}
