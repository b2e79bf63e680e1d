//! In-process store used by unit tests.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{page, AlertQuery, AnomalyQuery, Store, TransactionQuery, VolumeStats};
use crate::alerts::types::{Alert, AlertStatus};
use crate::anomaly::types::{Anomaly, AnomalyStatus};
use crate::error::{MonitorError, Result};
use crate::listener::types::{BridgeTransaction, TxStatus};
use crate::tokens::registry::symbols_equivalent;

#[derive(Default)]
struct Tables {
    transactions: Vec<BridgeTransaction>,
    anomalies: Vec<Anomaly>,
    alerts: Vec<Alert>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a transport error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MonitorError::transport("memory", "store unavailable"));
        }
        Ok(())
    }

    pub fn transactions(&self) -> Vec<BridgeTransaction> {
        self.tables.lock().unwrap().transactions.clone()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.tables.lock().unwrap().anomalies.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.tables.lock().unwrap().alerts.clone()
    }

    /// Overwrite the observed timestamp of a stored record.
    pub fn backdate(&self, id: i64, timestamp: DateTime<Utc>) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(tx) = tables.transactions.iter_mut().find(|t| t.id == Some(id)) {
            tx.timestamp = timestamp;
        }
    }

    pub fn backdate_alert(&self, id: i64, created_at: DateTime<Utc>) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(alert) = tables.alerts.iter_mut().find(|a| a.id == Some(id)) {
            alert.created_at = created_at;
        }
    }
}

fn paginate<T: Clone>(items: Vec<T>, limit: Option<i64>, offset: Option<i64>) -> (Vec<T>, i64) {
    let (limit, offset) = page(limit, offset);
    let total = items.len() as i64;
    let page = items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect();
    (page, total)
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn insert_transaction(&self, tx: &BridgeTransaction) -> Result<Option<BridgeTransaction>> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let exists = tables.transactions.iter().any(|t| {
            t.tx_hash == tx.tx_hash && t.log_index == tx.log_index && t.network == tx.network
        });
        if exists {
            return Ok(None);
        }
        let mut stored = tx.clone();
        stored.id = Some(tables.next_id());
        tables.transactions.push(stored.clone());
        Ok(Some(stored))
    }

    async fn get_transaction(&self, id: i64) -> Result<Option<BridgeTransaction>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables.transactions.iter().find(|t| t.id == Some(id)).cloned())
    }

    async fn transactions_by_bridge_id(&self, bridge_id: &str) -> Result<Vec<BridgeTransaction>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .transactions
            .iter()
            .filter(|t| t.bridge_id.as_deref() == Some(bridge_id))
            .cloned()
            .collect())
    }

    async fn unmatched_outbound(
        &self,
        network: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .transactions
            .iter()
            .filter(|t| {
                t.network == network
                    && t.timestamp >= since
                    && t.status == TxStatus::Pending
                    && !t.is_matched
                    && t.is_outbound()
            })
            .cloned()
            .collect())
    }

    async fn fuzzy_candidates(
        &self,
        exclude_chain_id: i64,
        token_symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut found: Vec<BridgeTransaction> = tables
            .transactions
            .iter()
            .filter(|t| {
                t.chain_id != exclude_chain_id
                    && symbols_equivalent(&t.token_symbol, token_symbol)
                    && t.timestamp >= from
                    && t.timestamp <= to
                    && !t.is_matched
            })
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.timestamp, t.id));
        Ok(found)
    }

    async fn stale_outbound(&self, before: DateTime<Utc>) -> Result<Vec<BridgeTransaction>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .transactions
            .iter()
            .filter(|t| {
                t.timestamp < before && t.status == TxStatus::Pending && !t.is_matched && t.is_outbound()
            })
            .cloned()
            .collect())
    }

    async fn mark_matched(&self, a_id: i64, b_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        for id in [a_id, b_id] {
            match tables.transactions.iter().find(|t| t.id == Some(id)) {
                None => return Err(MonitorError::not_found("transaction", id)),
                Some(t) if t.is_matched => {
                    return Err(MonitorError::Validation(format!(
                        "transaction {} is already matched",
                        id
                    )))
                }
                Some(_) => {}
            }
        }
        for tx in tables.transactions.iter_mut() {
            let partner = if tx.id == Some(a_id) {
                b_id
            } else if tx.id == Some(b_id) {
                a_id
            } else {
                continue;
            };
            tx.matched_transaction_id = Some(partner);
            tx.is_matched = true;
            tx.status = TxStatus::Completed;
            tx.matched_at = Some(now);
        }
        Ok(())
    }

    async fn set_transaction_status(&self, id: i64, status: TxStatus) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        match tables
            .transactions
            .iter_mut()
            .find(|t| t.id == Some(id) && t.status == TxStatus::Pending)
        {
            Some(tx) => {
                tx.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sender_activity(&self, network: &str, sender: &str, since: DateTime<Utc>) -> Result<i64> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .transactions
            .iter()
            .filter(|t| t.network == network && t.from_address == sender && t.timestamp >= since)
            .count() as i64)
    }

    async fn volume_stats(
        &self,
        network: &str,
        token: &str,
        since: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> Result<VolumeStats> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let amounts: Vec<f64> = tables
            .transactions
            .iter()
            .filter(|t| {
                t.network == network
                    && t.token_address == token
                    && t.timestamp >= since
                    && (exclude_id.is_none() || t.id != exclude_id)
            })
            .map(BridgeTransaction::amount_value)
            .collect();
        let samples = amounts.len() as i64;
        let average = if samples == 0 {
            0.0
        } else {
            amounts.iter().sum::<f64>() / samples as f64
        };
        Ok(VolumeStats { samples, average })
    }

    async fn duplicate_candidates(
        &self,
        network: &str,
        bridge_id: &str,
        amount_raw: &BigDecimal,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .transactions
            .iter()
            .filter(|t| {
                t.network == network
                    && t.bridge_id.as_deref() == Some(bridge_id)
                    && &t.amount_raw == amount_raw
                    && t.timestamp >= since
            })
            .cloned()
            .collect())
    }

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<(Vec<BridgeTransaction>, i64)> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut items: Vec<BridgeTransaction> = tables
            .transactions
            .iter()
            .filter(|t| query.network.as_ref().is_none_or(|n| &t.network == n))
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        items.reverse();
        Ok(paginate(items, query.limit, query.offset))
    }

    async fn transaction_counts(&self) -> Result<HashMap<String, i64>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut counts = HashMap::new();
        for tx in &tables.transactions {
            *counts.entry(tx.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_terminal_transactions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let before = tables.transactions.len();
        tables
            .transactions
            .retain(|t| !(t.timestamp < cutoff && t.status.is_terminal()));
        Ok((before - tables.transactions.len()) as u64)
    }

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<Anomaly> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let mut stored = anomaly.clone();
        stored.id = Some(tables.next_id());
        tables.anomalies.push(stored.clone());
        Ok(stored)
    }

    async fn get_anomaly(&self, id: i64) -> Result<Option<Anomaly>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables.anomalies.iter().find(|a| a.id == Some(id)).cloned())
    }

    async fn attach_alert(&self, anomaly_id: i64, alert_id: i64) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(anomaly) = tables.anomalies.iter_mut().find(|a| a.id == Some(anomaly_id)) {
            anomaly.alert_ids.push(alert_id);
        }
        Ok(())
    }

    async fn update_anomaly_status(
        &self,
        id: i64,
        status: AnomalyStatus,
        notes: Option<String>,
        resolved_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Anomaly> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let anomaly = tables
            .anomalies
            .iter_mut()
            .find(|a| a.id == Some(id))
            .ok_or_else(|| MonitorError::not_found("anomaly", id))?;
        anomaly.status = status;
        if notes.is_some() {
            anomaly.resolution_notes = notes;
        }
        if resolved_by.is_some() {
            anomaly.resolved_by = resolved_by;
        }
        if status.is_terminal() {
            anomaly.resolved_at = Some(now);
        }
        Ok(anomaly.clone())
    }

    async fn list_anomalies(&self, query: &AnomalyQuery) -> Result<(Vec<Anomaly>, i64)> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut items: Vec<Anomaly> = tables
            .anomalies
            .iter()
            .filter(|a| query.network.as_ref().is_none_or(|n| &a.network == n))
            .filter(|a| query.severity.is_none_or(|s| a.severity == s))
            .filter(|a| query.status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();
        items.reverse();
        Ok(paginate(items, query.limit, query.offset))
    }

    async fn delete_resolved_anomalies(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let before = tables.anomalies.len();
        tables
            .anomalies
            .retain(|a| !(a.detected_at < cutoff && a.status.is_terminal()));
        Ok((before - tables.anomalies.len()) as u64)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<Alert> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        if tables.alerts.iter().any(|a| a.alert_id == alert.alert_id) {
            return Err(MonitorError::Duplicate(alert.alert_id.clone()));
        }
        let mut stored = alert.clone();
        stored.id = Some(tables.next_id());
        tables.alerts.push(stored.clone());
        Ok(stored)
    }

    async fn update_alert(&self, alert: &Alert) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let slot = tables
            .alerts
            .iter_mut()
            .find(|a| a.id.is_some() && a.id == alert.id)
            .ok_or_else(|| MonitorError::not_found("alert", alert.alert_id.clone()))?;
        *slot = alert.clone();
        Ok(())
    }

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables.alerts.iter().find(|a| a.id == Some(id)).cloned())
    }

    async fn recent_alert_exists(&self, group_key: &str, since: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .alerts
            .iter()
            .any(|a| a.group_key == group_key && a.created_at >= since))
    }

    async fn alerts_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .alerts
            .iter()
            .filter(|a| {
                a.status == AlertStatus::Pending
                    && a.next_retry_at.is_some_and(|at| at <= now)
                    && a.retry_count < a.max_retries
            })
            .cloned()
            .collect())
    }

    async fn resolve_expired_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let mut resolved = Vec::new();
        for alert in tables.alerts.iter_mut() {
            if alert.auto_resolve
                && alert.expires_at.is_some_and(|at| at <= now)
                && alert.status != AlertStatus::Resolved
            {
                alert.status = AlertStatus::Resolved;
                alert.resolved_by = Some("system".to_string());
                alert.resolved_at = Some(now);
                resolved.push(alert.clone());
            }
        }
        Ok(resolved)
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<(Vec<Alert>, i64)> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut items: Vec<Alert> = tables
            .alerts
            .iter()
            .filter(|a| query.severity.is_none_or(|s| a.severity == s))
            .filter(|a| query.status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();
        items.reverse();
        Ok(paginate(items, query.limit, query.offset))
    }

    async fn delete_resolved_alerts(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let before = tables.alerts.len();
        tables.alerts.retain(|a| {
            !(a.status == AlertStatus::Resolved && a.resolved_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - tables.alerts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::types::EventKind;
    use crate::test_utils::sample_tx;

    #[tokio::test]
    async fn test_insert_is_unique_per_event() {
        let store = MemoryStore::new();
        let tx = sample_tx("ethereum", 1, EventKind::Lock, "100", Some("0x01"));

        let first = store.insert_transaction(&tx).await.unwrap();
        assert!(first.is_some());
        let second = store.insert_transaction(&tx).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.transactions().len(), 1);

        // Same hash and log index on another network is a different event
        let mut other = tx.clone();
        other.network = "polygon".into();
        assert!(store.insert_transaction(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_matched_is_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store
            .insert_transaction(&sample_tx("ethereum", 1, EventKind::Lock, "100", Some("0x01")))
            .await
            .unwrap()
            .unwrap();
        let b = store
            .insert_transaction(&sample_tx("polygon", 137, EventKind::Mint, "100", Some("0x01")))
            .await
            .unwrap()
            .unwrap();
        let c = store
            .insert_transaction(&sample_tx("bsc", 56, EventKind::Mint, "100", Some("0x01")))
            .await
            .unwrap()
            .unwrap();

        store.mark_matched(a.id.unwrap(), b.id.unwrap(), now).await.unwrap();
        let err = store.mark_matched(a.id.unwrap(), c.id.unwrap(), now).await;
        assert!(matches!(err, Err(MonitorError::Validation(_))));

        let c_after = store.get_transaction(c.id.unwrap()).await.unwrap().unwrap();
        assert!(!c_after.is_matched);
        assert_eq!(c_after.status, TxStatus::Pending);

        let a_after = store.get_transaction(a.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(a_after.matched_transaction_id, b.id);
        assert_eq!(a_after.status, TxStatus::Completed);
    }
}
