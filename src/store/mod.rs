pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use crate::alerts::types::{Alert, AlertSeverity, AlertStatus};
use crate::anomaly::types::{Anomaly, AnomalyStatus, Severity};
use crate::error::Result;
use crate::listener::types::{BridgeTransaction, TxStatus};

pub use postgres::PgStore;

/// Filters for `GET /api/v1/transactions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionQuery {
    pub network: Option<String>,
    pub status: Option<TxStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnomalyQuery {
    pub network: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<AnomalyStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertQuery {
    pub severity: Option<AlertSeverity>,
    pub status: Option<AlertStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Clamp a caller-supplied page to sane bounds.
pub fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (limit.unwrap_or(50).clamp(1, 1000), offset.unwrap_or(0).max(0))
}

/// Trailing activity for one token on one network.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolumeStats {
    pub samples: i64,
    pub average: f64,
}

/// Persistence for transactions, anomalies and alerts.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<()>;

    // ============================================================
    // Transactions
    // ============================================================

    /// Insert a new record. Returns `None` when `(tx_hash, log_index, network)` already exists.
    async fn insert_transaction(&self, tx: &BridgeTransaction) -> Result<Option<BridgeTransaction>>;

    async fn get_transaction(&self, id: i64) -> Result<Option<BridgeTransaction>>;

    /// Every record carrying this correlation id, on any network.
    async fn transactions_by_bridge_id(&self, bridge_id: &str) -> Result<Vec<BridgeTransaction>>;

    /// Pending, unmatched outbound records on `network` observed at or after `since`.
    async fn unmatched_outbound(
        &self,
        network: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>>;

    /// Unmatched records on other chains with the same token symbol in `[from, to]`,
    /// oldest first.
    async fn fuzzy_candidates(
        &self,
        exclude_chain_id: i64,
        token_symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>>;

    /// Pending, unmatched outbound records on any network observed before `before`.
    async fn stale_outbound(&self, before: DateTime<Utc>) -> Result<Vec<BridgeTransaction>>;

    /// Link both records as matched and completed, atomically. Fails with
    /// `Validation` and changes nothing if either side is already matched.
    async fn mark_matched(&self, a_id: i64, b_id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Move a pending record to `status`. Returns false if it was no longer pending.
    async fn set_transaction_status(&self, id: i64, status: TxStatus) -> Result<bool>;

    /// Number of records from `sender` on `network` since `since`.
    async fn sender_activity(&self, network: &str, sender: &str, since: DateTime<Utc>) -> Result<i64>;

    /// Count and mean formatted amount of `token` on `network` since `since`,
    /// excluding record `exclude_id`.
    async fn volume_stats(
        &self,
        network: &str,
        token: &str,
        since: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> Result<VolumeStats>;

    /// Other records on `network` with the same correlation id and raw amount since `since`.
    async fn duplicate_candidates(
        &self,
        network: &str,
        bridge_id: &str,
        amount_raw: &BigDecimal,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>>;

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<(Vec<BridgeTransaction>, i64)>;

    async fn transaction_counts(&self) -> Result<HashMap<String, i64>>;

    /// Delete completed, failed and timed-out records observed before `cutoff`.
    async fn delete_terminal_transactions(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ============================================================
    // Anomalies
    // ============================================================

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<Anomaly>;

    async fn get_anomaly(&self, id: i64) -> Result<Option<Anomaly>>;

    async fn attach_alert(&self, anomaly_id: i64, alert_id: i64) -> Result<()>;

    async fn update_anomaly_status(
        &self,
        id: i64,
        status: AnomalyStatus,
        notes: Option<String>,
        resolved_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Anomaly>;

    async fn list_anomalies(&self, query: &AnomalyQuery) -> Result<(Vec<Anomaly>, i64)>;

    /// Delete resolved and false-positive anomalies detected before `cutoff`.
    async fn delete_resolved_anomalies(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ============================================================
    // Alerts
    // ============================================================

    async fn insert_alert(&self, alert: &Alert) -> Result<Alert>;

    /// Persist the mutable part of an alert: status, deliveries, retry and operator fields.
    async fn update_alert(&self, alert: &Alert) -> Result<()>;

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>>;

    /// Whether an alert with `group_key` was created at or after `since`.
    async fn recent_alert_exists(&self, group_key: &str, since: DateTime<Utc>) -> Result<bool>;

    /// Pending alerts whose retry time has come and that still have retries left.
    async fn alerts_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Alert>>;

    /// Resolve every unresolved auto-resolve alert whose expiry has passed.
    async fn resolve_expired_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>>;

    async fn list_alerts(&self, query: &AlertQuery) -> Result<(Vec<Alert>, i64)>;

    /// Delete resolved alerts resolved before `cutoff`.
    async fn delete_resolved_alerts(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
