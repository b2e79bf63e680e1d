use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::channels::Dispatch;
use super::dedup::DedupCache;
use super::types::{
    Alert, AlertRequest, AlertSeverity, AlertStatus, AlertType, ChannelDelivery, ChannelType,
    DeliveryStatus,
};
use crate::config::AlertConfig;
use crate::error::{MonitorError, Result};
use crate::feed::{FeedEvent, LiveFeed};
use crate::store::Store;

/// Counters since process start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStats {
    pub received: u64,
    pub suppressed: u64,
    pub created: u64,
    pub sent: u64,
    pub failed: u64,
    pub dedup_cache_size: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    suppressed: AtomicU64,
    created: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Central intake for every finding: deduplicates, persists, queues and drives delivery.
pub struct AlertSystem {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn Dispatch>,
    feed: LiveFeed,
    config: AlertConfig,
    /// Held across the dedup check, the insert and the cache update so two
    /// identical requests can never both pass.
    dedup: Mutex<DedupCache>,
    queue_tx: mpsc::UnboundedSender<Alert>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Alert>>>,
    counters: Counters,
}

impl AlertSystem {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn Dispatch>,
        feed: LiveFeed,
        config: AlertConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let dedup = DedupCache::new(
            config.dedup_cache_capacity,
            ChronoDuration::seconds(config.dedup_window_secs as i64),
            ChronoDuration::seconds(config.dedup_cache_ttl_secs as i64),
        );
        Self {
            store,
            dispatcher,
            feed,
            config,
            dedup: Mutex::new(dedup),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            counters: Counters::default(),
        }
    }

    /// Submit an alert. Returns `Ok(None)` when it was suppressed as a duplicate.
    pub async fn send_alert(&self, mut request: AlertRequest) -> Result<Option<Alert>> {
        if request.title.trim().is_empty() || request.message.trim().is_empty() {
            return Err(MonitorError::Validation(
                "alert title and message must not be empty".into(),
            ));
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        let key = request.group_key();
        let window = ChronoDuration::seconds(self.config.dedup_window_secs as i64);

        let mut dedup = self.dedup.lock().await;

        if dedup.is_recent(&key, now) {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(group_key = %key, "Alert suppressed by dedup cache");
            return Ok(None);
        }
        match self.store.recent_alert_exists(&key, now - window).await {
            Ok(true) => {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(group_key = %key, "Alert suppressed by recent stored alert");
                return Ok(None);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(group_key = %key, error = %e, "Dedup lookup failed, relying on cache");
            }
        }

        if request.auto_resolve_after.is_none()
            && (request.severity == AlertSeverity::Info
                || request.alert_type == AlertType::BridgeSuccess)
        {
            request.auto_resolve_after = Some(ChronoDuration::seconds(
                self.config.auto_resolve_after_secs as i64,
            ));
        }

        let channels = self.assign_channels(request.severity, now);
        let alert = Alert::from_request(request, channels, self.config.max_retries, now);

        let alert = match self.store.insert_alert(&alert).await {
            Ok(stored) => stored,
            Err(e) if alert.severity == AlertSeverity::Critical => {
                tracing::error!(
                    alert_id = %alert.alert_id,
                    error = %e,
                    "Failed to persist critical alert, dispatching without persistence"
                );
                alert
            }
            Err(e) => return Err(e),
        };

        dedup.record(key, now);
        drop(dedup);

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        if alert.status == AlertStatus::Sent {
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(
            alert_id = %alert.alert_id,
            alert_type = %alert.alert_type,
            severity = alert.severity.as_str(),
            channels = alert.channels.len(),
            "Alert created"
        );

        self.feed.publish(FeedEvent::Alert(alert.clone()));
        if self.queue_tx.send(alert.clone()).is_err() {
            tracing::warn!(alert_id = %alert.alert_id, "Alert queue closed, delivery left to retry sweep");
        }

        Ok(Some(alert))
    }

    /// `send_alert` for callers that only need the outcome logged.
    pub async fn raise(&self, request: AlertRequest) {
        let alert_type = request.alert_type;
        if let Err(e) = self.send_alert(request).await {
            tracing::error!(alert_type = %alert_type, error = %e, "Failed to raise alert");
        }
    }

    fn assign_channels(&self, severity: AlertSeverity, now: DateTime<Utc>) -> Vec<ChannelDelivery> {
        severity
            .channels()
            .iter()
            .filter_map(|&channel| {
                let target = self.dispatcher.target(channel)?;
                let mut delivery = ChannelDelivery::new(channel, target);
                if channel == ChannelType::LiveFeed {
                    delivery.mark_sent(now);
                }
                Some(delivery)
            })
            .collect()
    }

    /// Run one delivery round for `alert` and persist the outcome.
    pub async fn deliver(&self, mut alert: Alert, now: DateTime<Utc>) -> Alert {
        if !alert.has_due_channels() {
            // Nothing left to send; only a stale pending status needs settling
            if alert.status == AlertStatus::Pending {
                self.settle(&mut alert);
                self.persist_delivery(&alert).await;
            }
            return alert;
        }

        let due: Vec<usize> = alert
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_due(alert.max_retries))
            .map(|(i, _)| i)
            .collect();

        let snapshot = alert.clone();
        let results = futures::future::join_all(due.iter().map(|&i| {
            let channel = snapshot.channels[i].channel;
            let snapshot = &snapshot;
            async move { (i, self.dispatcher.dispatch(snapshot, channel).await) }
        }))
        .await;

        let mut any_failed = false;
        for (i, result) in results {
            let delivery = &mut alert.channels[i];
            match result {
                Ok(()) => delivery.mark_sent(now),
                Err(e) => {
                    tracing::warn!(
                        alert_id = %alert.alert_id,
                        channel = %delivery.channel,
                        error = %e,
                        "Channel delivery failed"
                    );
                    delivery.mark_failed(e.to_string());
                    any_failed = true;
                }
            }
        }

        if any_failed {
            alert.retry_count += 1;
            alert.next_retry_at = (alert.retry_count < alert.max_retries).then(|| {
                now + ChronoDuration::seconds(
                    alert.retry_count as i64 * self.config.retry_base_delay_secs as i64,
                )
            });
        } else {
            alert.next_retry_at = None;
        }

        self.settle(&mut alert);
        self.persist_delivery(&alert).await;
        alert
    }

    /// Derive the alert status from its channel states.
    fn settle(&self, alert: &mut Alert) {
        if alert.all_channels_sent() {
            alert.status = AlertStatus::Sent;
            alert.next_retry_at = None;
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
        } else if alert.retry_count >= alert.max_retries || !alert.has_due_channels() {
            for channel in alert.channels.iter_mut() {
                if channel.status != DeliveryStatus::Sent {
                    channel.status = DeliveryStatus::Failed;
                }
            }
            alert.status = AlertStatus::Failed;
            alert.next_retry_at = None;
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                alert_id = %alert.alert_id,
                retries = alert.retry_count,
                "Alert delivery exhausted its retries"
            );
        }
    }

    async fn persist_delivery(&self, alert: &Alert) {
        if alert.id.is_some() {
            if let Err(e) = self.store.update_alert(alert).await {
                tracing::error!(alert_id = %alert.alert_id, error = %e, "Failed to persist delivery state");
            }
        }
    }

    /// Deliver a queued or reloaded alert unless an operator already closed it.
    async fn process(&self, alert: Alert, now: DateTime<Utc>) {
        let alert = match alert.id {
            Some(id) => match self.store.get_alert(id).await {
                Ok(Some(fresh)) => fresh,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(alert_id = %alert.alert_id, error = %e, "Reload before delivery failed");
                    alert
                }
            },
            None => alert,
        };
        if matches!(alert.status, AlertStatus::Acknowledged | AlertStatus::Resolved) {
            return;
        }
        self.deliver(alert, now).await;
    }

    /// Deliver every stored alert whose retry time has come. Returns how many were tried.
    pub async fn retry_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.alerts_due_for_retry(now).await?;
        let count = due.len();
        for alert in due {
            self.deliver(alert, now).await;
        }
        if count > 0 {
            tracing::info!(count, "Retried pending alerts");
        }
        Ok(count)
    }

    /// Delete old resolved alerts and resolve expired auto-resolve alerts.
    pub async fn housekeeping(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - ChronoDuration::days(self.config.resolved_retention_days);
        let deleted = self.store.delete_resolved_alerts(cutoff).await?;

        let resolved = self.store.resolve_expired_alerts(now).await?;
        let auto_resolved = resolved.len();
        for alert in resolved {
            self.feed.publish(FeedEvent::Alert(alert));
        }

        if deleted > 0 || auto_resolved > 0 {
            tracing::info!(deleted, auto_resolved, "Alert housekeeping complete");
        }
        Ok(())
    }

    pub async fn prune_dedup(&self, now: DateTime<Utc>) -> usize {
        let pruned = self.dedup.lock().await.prune(now);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned dedup cache");
        }
        pruned
    }

    pub async fn acknowledge(&self, id: i64, user: Option<String>) -> Result<Alert> {
        let mut alert = self
            .store
            .get_alert(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("alert", id))?;

        match alert.status {
            AlertStatus::Acknowledged => return Ok(alert),
            AlertStatus::Resolved => {
                return Err(MonitorError::InvalidTransition {
                    from: alert.status.as_str().to_string(),
                    to: AlertStatus::Acknowledged.as_str().to_string(),
                })
            }
            AlertStatus::Pending | AlertStatus::Sent | AlertStatus::Failed => {}
        }

        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_by = Some(user.unwrap_or_else(|| "operator".to_string()));
        alert.acknowledged_at = Some(Utc::now());
        alert.next_retry_at = None;
        self.store.update_alert(&alert).await?;

        tracing::info!(alert_id = %alert.alert_id, by = ?alert.acknowledged_by, "Alert acknowledged");
        self.feed.publish(FeedEvent::Alert(alert.clone()));
        Ok(alert)
    }

    pub async fn resolve(&self, id: i64, user: Option<String>, notes: Option<String>) -> Result<Alert> {
        let mut alert = self
            .store
            .get_alert(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("alert", id))?;

        if alert.status == AlertStatus::Resolved {
            return Ok(alert);
        }

        alert.status = AlertStatus::Resolved;
        alert.resolved_by = Some(user.unwrap_or_else(|| "operator".to_string()));
        alert.resolved_at = Some(Utc::now());
        alert.next_retry_at = None;
        if notes.is_some() {
            alert.notes = notes;
        }
        self.store.update_alert(&alert).await?;

        tracing::info!(alert_id = %alert.alert_id, by = ?alert.resolved_by, "Alert resolved");
        self.feed.publish(FeedEvent::Alert(alert.clone()));
        Ok(alert)
    }

    pub async fn stats(&self) -> AlertStats {
        AlertStats {
            received: self.counters.received.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dedup_cache_size: self.dedup.lock().await.len(),
        }
    }

    /// Single delivery task. On cancellation it drains the queue before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut queue) = self.queue_rx.lock().await.take() else {
            tracing::error!("Alert system is already running");
            return;
        };

        let mut retry = ticker(self.config.retry_check_interval_secs);
        let mut housekeeping = ticker(self.config.cleanup_interval_secs);
        let mut prune = ticker(self.config.dedup_prune_interval_secs);

        tracing::info!("Alert system started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(alert) = queue.recv() => {
                    self.process(alert, Utc::now()).await;
                }
                _ = retry.tick() => {
                    if let Err(e) = self.retry_due(Utc::now()).await {
                        tracing::error!(error = %e, "Retry sweep failed");
                    }
                }
                _ = housekeeping.tick() => {
                    if let Err(e) = self.housekeeping(Utc::now()).await {
                        tracing::error!(error = %e, "Alert housekeeping failed");
                    }
                }
                _ = prune.tick() => {
                    self.prune_dedup(Utc::now()).await;
                }
            }
        }

        queue.close();
        let mut drained = 0usize;
        while let Some(alert) = queue.recv().await {
            self.process(alert, Utc::now()).await;
            drained += 1;
        }
        tracing::info!(drained, "Alert system stopped");
    }
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
