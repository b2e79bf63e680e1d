use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::alerts::system::AlertSystem;
use crate::alerts::types::{AlertRequest, AlertSeverity, AlertType};
use crate::anomaly::engine::AnomalyEngine;
use crate::config::NetworkConfig;
use crate::feed::{FeedEvent, LiveFeed};
use crate::listener::network::NetworkKind;
use crate::listener::types::BridgeTransaction;
use crate::store::Store;

/// What happened to one event handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored(Box<BridgeTransaction>),
    Duplicate,
    Failed,
}

/// Post-decode steps for every bridge event:
/// 1. Persist (duplicates are dropped silently)
/// 2. Broadcast to the live feed
/// 3. Network-specific secondary checks
/// 4. Queue for anomaly detection
pub struct IngestPipeline {
    store: Arc<dyn Store>,
    engine: Arc<AnomalyEngine>,
    alerts: Arc<AlertSystem>,
    feed: LiveFeed,
    kinds: HashMap<String, NetworkKind>,
    failure_alert_threshold: u32,
    consecutive_failures: AtomicU32,
}

impl IngestPipeline {
    pub fn new(
        networks: &[NetworkConfig],
        failure_alert_threshold: u32,
        store: Arc<dyn Store>,
        engine: Arc<AnomalyEngine>,
        alerts: Arc<AlertSystem>,
        feed: LiveFeed,
    ) -> Self {
        Self {
            store,
            engine,
            alerts,
            feed,
            kinds: networks.iter().map(|n| (n.name.clone(), n.kind)).collect(),
            failure_alert_threshold: failure_alert_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub async fn ingest(&self, tx: BridgeTransaction) -> IngestOutcome {
        let stored = match self.store.insert_transaction(&tx).await {
            Ok(Some(stored)) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                stored
            }
            Ok(None) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                tracing::debug!(network = %tx.network, tx_hash = %tx.tx_hash, log_index = tx.log_index, "Duplicate event ignored");
                return IngestOutcome::Duplicate;
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(
                    network = %tx.network,
                    tx_hash = %tx.tx_hash,
                    failures,
                    error = %e,
                    "Failed to persist bridge event"
                );
                if failures == self.failure_alert_threshold {
                    self.alerts
                        .raise(
                            AlertRequest::new(
                                AlertType::StoreUnavailable,
                                AlertSeverity::Critical,
                                "Transaction store unavailable",
                                format!("{} consecutive inserts failed, last error: {}", failures, e),
                            )
                            .with_details(serde_json::json!({ "failures": failures })),
                        )
                        .await;
                }
                return IngestOutcome::Failed;
            }
        };

        self.feed.publish(FeedEvent::Transaction(stored.clone()));

        let kind = self.kinds.get(&stored.network).copied().unwrap_or_default();
        for request in kind.secondary_checks(&stored) {
            self.alerts.raise(request).await;
        }

        self.engine.check_transaction(stored.clone());
        IngestOutcome::Stored(Box::new(stored))
    }

    /// Consume the connectors' channel until shutdown, then drain what is buffered.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<BridgeTransaction>,
        shutdown: CancellationToken,
    ) {
        let mut stored = 0u64;
        loop {
            tokio::select! {
                maybe_tx = rx.recv() => match maybe_tx {
                    Some(tx) => {
                        if matches!(self.ingest(tx).await, IngestOutcome::Stored(_)) {
                            stored += 1;
                        }
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(tx) = rx.recv().await {
                        if matches!(self.ingest(tx).await, IngestOutcome::Stored(_)) {
                            stored += 1;
                        }
                    }
                    break;
                }
            }
        }
        tracing::info!(stored, "Ingest pipeline stopped");
    }
}
