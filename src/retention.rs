use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub transactions_deleted: u64,
    pub anomalies_deleted: u64,
}

/// Age-based cleanup of finished transactions and closed anomalies.
pub struct RetentionSweeper {
    config: RetentionConfig,
    store: Arc<dyn Store>,
}

impl RetentionSweeper {
    pub fn new(config: RetentionConfig, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let transactions_deleted = self
            .store
            .delete_terminal_transactions(now - Duration::days(self.config.transaction_days))
            .await?;
        let anomalies_deleted = self
            .store
            .delete_resolved_anomalies(now - Duration::days(self.config.anomaly_days))
            .await?;

        if transactions_deleted > 0 || anomalies_deleted > 0 {
            tracing::info!(transactions_deleted, anomalies_deleted, "Retention sweep complete");
        }
        Ok(RetentionReport {
            transactions_deleted,
            anomalies_deleted,
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = StdDuration::from_secs(self.config.interval_secs.max(60));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
