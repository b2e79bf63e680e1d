use chrono::{DateTime, Duration, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::blacklist::Blacklist;
use super::rules;
use super::types::{Anomaly, AnomalyStatus, AnomalyType, Finding};
use crate::alerts::system::AlertSystem;
use crate::alerts::types::{AlertRequest, AlertType};
use crate::config::{AnomalyDetectionConfig, NetworkConfig};
use crate::error::{MonitorError, Result};
use crate::feed::{FeedEvent, LiveFeed};
use crate::listener::types::BridgeTransaction;
use crate::store::Store;

type RuleFuture<'a> = BoxFuture<'a, (AnomalyType, Result<Option<Finding>>)>;

/// Runs every enabled rule against each ingested transaction.
pub struct AnomalyEngine {
    config: AnomalyDetectionConfig,
    store: Arc<dyn Store>,
    alerts: Arc<AlertSystem>,
    feed: LiveFeed,
    blacklist: Blacklist,
    /// Per-network (max gas used, max gas price in gwei) overrides.
    gas_limits: HashMap<String, (u64, f64)>,
    queue_tx: mpsc::UnboundedSender<BridgeTransaction>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<BridgeTransaction>>>,
}

impl AnomalyEngine {
    pub fn new(
        config: AnomalyDetectionConfig,
        networks: &[NetworkConfig],
        store: Arc<dyn Store>,
        alerts: Arc<AlertSystem>,
        feed: LiveFeed,
    ) -> eyre::Result<Self> {
        let blacklist = Blacklist::load(&config.suspicious_contract)?;
        Ok(Self::with_blacklist(config, networks, blacklist, store, alerts, feed))
    }

    pub fn with_blacklist(
        config: AnomalyDetectionConfig,
        networks: &[NetworkConfig],
        blacklist: Blacklist,
        store: Arc<dyn Store>,
        alerts: Arc<AlertSystem>,
        feed: LiveFeed,
    ) -> Self {
        let gas = &config.gas_anomaly;
        let gas_limits = networks
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    (
                        n.max_gas_used.unwrap_or(gas.max_gas_used),
                        n.max_gas_price_gwei.unwrap_or(gas.max_gas_price_gwei),
                    ),
                )
            })
            .collect();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Self {
            config,
            store,
            alerts,
            feed,
            blacklist,
            gas_limits,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    /// Queue a transaction for analysis. Processed in arrival order by `run`.
    pub fn check_transaction(&self, tx: BridgeTransaction) {
        if !self.config.enabled {
            return;
        }
        if self.queue_tx.send(tx).is_err() {
            tracing::warn!("Anomaly queue closed, transaction not analyzed");
        }
    }

    fn gas_limits(&self, network: &str) -> (u64, f64) {
        self.gas_limits.get(network).copied().unwrap_or((
            self.config.gas_anomaly.max_gas_used,
            self.config.gas_anomaly.max_gas_price_gwei,
        ))
    }

    /// Evaluate all enabled rules concurrently. A failing rule is logged and skipped.
    pub async fn analyze(&self, tx: &BridgeTransaction, now: DateTime<Utc>) -> Vec<Finding> {
        let cfg = &self.config;
        let store = self.store.as_ref();
        let mut checks: Vec<RuleFuture<'_>> = Vec::new();

        if cfg.bridge_timeout.enabled {
            let window = Duration::seconds(cfg.bridge_timeout.window_secs as i64);
            checks.push(
                async move {
                    (
                        AnomalyType::BridgeTimeout,
                        Ok(rules::check_bridge_timeout(tx, window, now)),
                    )
                }
                .boxed(),
            );
        }
        if cfg.value_mismatch.enabled {
            checks.push(
                async move {
                    (
                        AnomalyType::ValueMismatch,
                        rules::check_value_mismatch(store, tx, &cfg.value_mismatch).await,
                    )
                }
                .boxed(),
            );
        }
        if cfg.duplicate_transaction.enabled {
            let window = Duration::seconds(cfg.duplicate_transaction.window_secs as i64);
            checks.push(
                async move {
                    (
                        AnomalyType::DuplicateTransaction,
                        rules::check_duplicate(store, tx, window, now).await,
                    )
                }
                .boxed(),
            );
        }
        if cfg.suspicious_contract.enabled {
            let blacklist = &self.blacklist;
            checks.push(
                async move {
                    (
                        AnomalyType::SuspiciousContract,
                        rules::check_suspicious_contract(
                            store,
                            tx,
                            blacklist,
                            &cfg.suspicious_contract,
                            now,
                        )
                        .await,
                    )
                }
                .boxed(),
            );
        }
        if cfg.unusual_volume.enabled {
            checks.push(
                async move {
                    (
                        AnomalyType::UnusualVolume,
                        rules::check_unusual_volume(store, tx, &cfg.unusual_volume, now).await,
                    )
                }
                .boxed(),
            );
        }
        if cfg.failed_verification.enabled {
            checks.push(
                async move {
                    (
                        AnomalyType::FailedVerification,
                        Ok(rules::check_failed_verification(tx)),
                    )
                }
                .boxed(),
            );
        }
        if cfg.replay_attack.enabled {
            checks.push(
                async move {
                    (
                        AnomalyType::ReplayAttack,
                        rules::check_replay_attack(store, tx).await,
                    )
                }
                .boxed(),
            );
        }
        if cfg.gas_anomaly.enabled {
            let (max_gas, max_price) = self.gas_limits(&tx.network);
            checks.push(
                async move {
                    (
                        AnomalyType::GasAnomaly,
                        Ok(rules::check_gas_anomaly(tx, max_gas, max_price)),
                    )
                }
                .boxed(),
            );
        }

        let mut findings = Vec::new();
        for (rule, outcome) in join_all(checks).await {
            match outcome {
                Ok(Some(finding)) => findings.push(finding),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        rule = %rule,
                        network = %tx.network,
                        tx_hash = %tx.tx_hash,
                        error = %e,
                        "Anomaly rule failed"
                    );
                }
            }
        }
        findings
    }

    /// Persist, broadcast and alert on one finding.
    pub async fn record(
        &self,
        tx: &BridgeTransaction,
        finding: Finding,
        now: DateTime<Utc>,
    ) -> Anomaly {
        let anomaly = Anomaly::from_finding(tx, finding, now);
        let mut anomaly = match self.store.insert_anomaly(&anomaly).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(
                    anomaly_type = %anomaly.anomaly_type,
                    tx_hash = %tx.tx_hash,
                    error = %e,
                    "Failed to persist anomaly, alerting anyway"
                );
                anomaly
            }
        };

        tracing::warn!(
            anomaly_type = %anomaly.anomaly_type,
            severity = anomaly.severity.as_str(),
            network = %anomaly.network,
            tx_hash = %tx.tx_hash,
            "Anomaly detected"
        );
        self.feed.publish(FeedEvent::Anomaly(anomaly.clone()));

        let request = AlertRequest::new(
            AlertType::Anomaly(anomaly.anomaly_type),
            anomaly.severity.into(),
            anomaly.title.clone(),
            anomaly.description.clone(),
        )
        .with_transaction(tx)
        .with_anomaly(anomaly.id)
        .with_details(serde_json::json!({
            "confidence": anomaly.confidence,
            "data": anomaly.data,
        }));

        match self.alerts.send_alert(request).await {
            Ok(Some(alert)) => {
                if let (Some(anomaly_id), Some(alert_id)) = (anomaly.id, alert.id) {
                    match self.store.attach_alert(anomaly_id, alert_id).await {
                        Ok(()) => anomaly.alert_ids.push(alert_id),
                        Err(e) => {
                            tracing::warn!(anomaly_id, alert_id, error = %e, "Failed to link alert to anomaly");
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(anomaly_type = %anomaly.anomaly_type, error = %e, "Failed to raise anomaly alert");
            }
        }

        anomaly
    }

    pub async fn process(&self, tx: &BridgeTransaction) -> Vec<Anomaly> {
        let now = Utc::now();
        let findings = self.analyze(tx, now).await;
        let mut anomalies = Vec::with_capacity(findings.len());
        for finding in findings {
            anomalies.push(self.record(tx, finding, now).await);
        }
        anomalies
    }

    /// Operator status change, e.g. active -> investigating -> resolved.
    pub async fn update_status(
        &self,
        id: i64,
        status: AnomalyStatus,
        notes: Option<String>,
        user: Option<String>,
    ) -> Result<Anomaly> {
        let current = self
            .store
            .get_anomaly(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("anomaly", id))?;

        if !current.status.can_transition_to(status) {
            return Err(MonitorError::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let updated = self
            .store
            .update_anomaly_status(id, status, notes, user, Utc::now())
            .await?;
        tracing::info!(anomaly_id = id, status = status.as_str(), "Anomaly status updated");
        self.feed.publish(FeedEvent::Anomaly(updated.clone()));
        Ok(updated)
    }

    /// Drain the queue until shutdown, then finish whatever is already queued.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rx) = self.queue_rx.lock().await.take() else {
            tracing::error!("Anomaly engine already running");
            return;
        };

        loop {
            tokio::select! {
                maybe_tx = rx.recv() => match maybe_tx {
                    Some(tx) => {
                        self.process(&tx).await;
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(tx) = rx.recv().await {
                        self.process(&tx).await;
                    }
                    break;
                }
            }
        }
        tracing::info!("Anomaly engine stopped");
    }
}
