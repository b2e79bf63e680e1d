use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::matching::{match_rejection, MatchRules, MatchType, MatchedPair};
use crate::alerts::system::AlertSystem;
use crate::alerts::types::{AlertRequest, AlertSeverity, AlertType};
use crate::anomaly::types::AnomalyType;
use crate::config::MatcherConfig;
use crate::error::{MonitorError, Result};
use crate::feed::{FeedEvent, LiveFeed};
use crate::listener::types::{BridgeTransaction, TxStatus};
use crate::store::Store;

/// Periodically pairs outbound events with their inbound counterparts and
/// times out the ones that never get one.
pub struct TransactionMatcher {
    config: MatcherConfig,
    rules: MatchRules,
    networks: Vec<String>,
    store: Arc<dyn Store>,
    alerts: Arc<AlertSystem>,
    feed: LiveFeed,
}

impl TransactionMatcher {
    pub fn new(
        config: MatcherConfig,
        networks: Vec<String>,
        store: Arc<dyn Store>,
        alerts: Arc<AlertSystem>,
        feed: LiveFeed,
    ) -> Self {
        let rules = MatchRules {
            amount_tolerance: config.amount_tolerance,
            time_window: Duration::seconds(config.time_window_secs as i64),
        };
        Self {
            config,
            rules,
            networks,
            store,
            alerts,
            feed,
        }
    }

    /// One sweep over every network. Returns the number of new pairs.
    pub async fn match_pending(&self, now: DateTime<Utc>) -> Result<usize> {
        let since = now - Duration::seconds(self.config.max_age_secs as i64);
        let mut matched = 0;

        for network in &self.networks {
            let pending = self.store.unmatched_outbound(network, since).await?;
            if pending.is_empty() {
                continue;
            }
            tracing::debug!(network = %network, pending = pending.len(), "Matching pending transfers");

            for tx in pending {
                match self.try_match(&tx, now).await {
                    Ok(Some(_)) => matched += 1,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(network = %network, tx_hash = %tx.tx_hash, error = %e, "Match attempt failed");
                    }
                }
            }
        }

        if matched > 0 {
            tracing::info!(matched, "Matched bridge transfers");
        }
        Ok(matched)
    }

    /// Exact match on correlation id first, then the fuzzy fallback.
    pub async fn try_match(
        &self,
        tx: &BridgeTransaction,
        now: DateTime<Utc>,
    ) -> Result<Option<MatchedPair>> {
        if tx.is_matched {
            return Ok(None);
        }

        if let Some(bridge_id) = tx.bridge_id.as_deref() {
            let candidates = self.store.transactions_by_bridge_id(bridge_id).await?;
            if let Some(other) = candidates
                .into_iter()
                .find(|c| match_rejection(tx, c, &self.rules).is_none())
            {
                return self.confirm(tx, &other, MatchType::Exact, now).await;
            }
        }

        // TODO: rank fuzzy candidates by amount and time distance instead of taking the oldest valid one
        let window = Duration::seconds(self.config.fuzzy_window_secs as i64);
        let candidates = self
            .store
            .fuzzy_candidates(tx.chain_id, &tx.token_symbol, tx.timestamp - window, tx.timestamp + window)
            .await?;
        match candidates
            .into_iter()
            .find(|c| match_rejection(tx, c, &self.rules).is_none())
        {
            Some(other) => self.confirm(tx, &other, MatchType::Fuzzy, now).await,
            None => Ok(None),
        }
    }

    /// Link both sides atomically. A concurrent match on either side aborts it.
    async fn confirm(
        &self,
        a: &BridgeTransaction,
        b: &BridgeTransaction,
        match_type: MatchType,
        now: DateTime<Utc>,
    ) -> Result<Option<MatchedPair>> {
        let (Some(a_id), Some(b_id)) = (a.id, b.id) else {
            return Err(MonitorError::Validation("cannot match unsaved transactions".into()));
        };

        match self.store.mark_matched(a_id, b_id, now).await {
            Ok(()) => {}
            Err(MonitorError::Validation(reason)) => {
                tracing::debug!(a_id, b_id, reason = %reason, "Match aborted");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let refreshed_a = self.store.get_transaction(a_id).await?.unwrap_or_else(|| a.clone());
        let refreshed_b = self.store.get_transaction(b_id).await?.unwrap_or_else(|| b.clone());
        let pair = MatchedPair::new(refreshed_a, refreshed_b, match_type);

        tracing::info!(
            source_network = %pair.source.network,
            destination_network = %pair.destination.network,
            source_tx = %pair.source.tx_hash,
            destination_tx = %pair.destination.tx_hash,
            match_type = ?match_type,
            amount = %pair.source.amount,
            "Bridge transfer matched"
        );
        self.feed.publish(FeedEvent::TransactionMatched(pair.clone()));

        if pair.source.amount_value() > self.config.success_alert_threshold {
            let request = AlertRequest::new(
                AlertType::BridgeSuccess,
                AlertSeverity::Info,
                format!(
                    "{} {} bridged from {} to {}",
                    pair.source.amount,
                    pair.source.token_symbol,
                    pair.source.network,
                    pair.destination.network
                ),
                format!(
                    "Transfer {} completed by {}",
                    pair.source.tx_hash, pair.destination.tx_hash
                ),
            )
            .with_transaction(&pair.source)
            .with_details(serde_json::json!({
                "destination_tx_hash": pair.destination.tx_hash,
                "match_type": match_type,
                "confidence": pair.confidence,
            }));
            self.alerts.raise(request).await;
        }

        Ok(Some(pair))
    }

    /// Mark overdue outbound transfers as timed out and alert on each.
    pub async fn check_for_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = Duration::seconds(self.config.timeout_secs as i64);
        let stale = self.store.stale_outbound(now - timeout).await?;
        let mut timed_out = 0;

        for tx in stale {
            let Some(id) = tx.id else { continue };
            if !self.store.set_transaction_status(id, TxStatus::Timeout).await? {
                continue;
            }
            timed_out += 1;

            tracing::warn!(
                network = %tx.network,
                tx_hash = %tx.tx_hash,
                age_mins = tx.age(now).num_minutes(),
                "Bridge transfer timed out"
            );

            let request = AlertRequest::new(
                AlertType::Anomaly(AnomalyType::BridgeTimeout),
                AlertSeverity::High,
                format!("Bridge transfer on {} has no counterpart", tx.network),
                format!(
                    "{} of {} {} timed out after {} minutes",
                    tx.event_kind,
                    tx.amount,
                    tx.token_symbol,
                    tx.age(now).num_minutes()
                ),
            )
            .with_transaction(&tx)
            .with_details(serde_json::json!({
                "bridge_id": tx.bridge_id,
                "timeout_secs": self.config.timeout_secs,
            }));
            self.alerts.raise(request).await;
        }
        Ok(timed_out)
    }

    /// Operator-requested pairing of two stored transactions.
    pub async fn manual_match(&self, a_id: i64, b_id: i64) -> Result<MatchedPair> {
        let a = self
            .store
            .get_transaction(a_id)
            .await?
            .ok_or_else(|| MonitorError::not_found("transaction", a_id))?;
        let b = self
            .store
            .get_transaction(b_id)
            .await?
            .ok_or_else(|| MonitorError::not_found("transaction", b_id))?;

        if let Some(reason) = match_rejection(&a, &b, &self.rules) {
            return Err(MonitorError::Validation(format!(
                "transactions {} and {} cannot be matched: {}",
                a_id, b_id, reason
            )));
        }

        self.confirm(&a, &b, MatchType::Manual, Utc::now())
            .await?
            .ok_or_else(|| {
                MonitorError::Validation(format!("transaction {} or {} is already matched", a_id, b_id))
            })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Transaction matcher disabled");
            return;
        }

        let period = self.config.interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.match_pending(now).await {
                        tracing::error!(error = %e, "Matching sweep failed");
                    }
                    if let Err(e) = self.check_for_timeouts(now).await {
                        tracing::error!(error = %e, "Timeout sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Transaction matcher shutting down");
                    break;
                }
            }
        }
    }
}
