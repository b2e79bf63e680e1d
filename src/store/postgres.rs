use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;

use super::{page, AlertQuery, AnomalyQuery, Store, TransactionQuery, VolumeStats};
use crate::alerts::types::{Alert, ChannelDelivery};
use crate::anomaly::types::{Anomaly, AnomalyStatus};
use crate::config::DatabaseConfig;
use crate::error::{MonitorError, Result};
use crate::listener::types::{BridgeTransaction, TxStatus};
use crate::tokens::registry::normalize_symbol;

const TX_COLUMNS: &str = "id, network, chain_id, block_number, block_hash, tx_hash, log_index, \
     event_kind, bridge_contract, token_address, token_symbol, token_decimals, amount_raw, amount, \
     from_address, to_address, bridge_id, target_chain_id, status, observed_at, gas_used, gas_price, \
     matched_transaction_id, is_matched, matched_at";

const ANOMALY_COLUMNS: &str = "id, anomaly_type, severity, status, transaction_id, \
     related_transaction_ids, network, contract_address, title, description, data, confidence, \
     resolution_notes, resolved_by, resolved_at, alert_ids, detected_at";

const ALERT_COLUMNS: &str = "id, alert_id, alert_type, severity, title, message, details, \
     anomaly_id, transaction_id, transaction_ref, network, contract_address, status, group_key, \
     channels, retry_count, max_retries, next_retry_at, auto_resolve, expires_at, acknowledged_by, \
     acknowledged_at, resolved_by, resolved_at, notes, created_at";

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    network: String,
    chain_id: i64,
    block_number: i64,
    block_hash: String,
    tx_hash: String,
    log_index: i32,
    event_kind: String,
    bridge_contract: String,
    token_address: String,
    token_symbol: String,
    token_decimals: i16,
    amount_raw: BigDecimal,
    amount: String,
    from_address: String,
    to_address: String,
    bridge_id: Option<String>,
    target_chain_id: Option<i64>,
    status: String,
    observed_at: DateTime<Utc>,
    gas_used: Option<i64>,
    gas_price: Option<i64>,
    matched_transaction_id: Option<i64>,
    is_matched: bool,
    matched_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for BridgeTransaction {
    type Error = MonitorError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            network: row.network,
            chain_id: row.chain_id,
            block_number: row.block_number,
            block_hash: row.block_hash,
            tx_hash: row.tx_hash,
            log_index: row.log_index,
            event_kind: row.event_kind.parse()?,
            bridge_contract: row.bridge_contract,
            token_address: row.token_address,
            token_symbol: row.token_symbol,
            token_decimals: row.token_decimals,
            amount_raw: row.amount_raw,
            amount: row.amount,
            from_address: row.from_address,
            to_address: row.to_address,
            bridge_id: row.bridge_id,
            target_chain_id: row.target_chain_id,
            status: row.status.parse()?,
            timestamp: row.observed_at,
            gas_used: row.gas_used,
            gas_price: row.gas_price,
            matched_transaction_id: row.matched_transaction_id,
            is_matched: row.is_matched,
            matched_at: row.matched_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnomalyRow {
    id: i64,
    anomaly_type: String,
    severity: String,
    status: String,
    transaction_id: Option<i64>,
    related_transaction_ids: Vec<i64>,
    network: String,
    contract_address: Option<String>,
    title: String,
    description: String,
    data: JsonValue,
    confidence: f64,
    resolution_notes: Option<String>,
    resolved_by: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    alert_ids: Vec<i64>,
    detected_at: DateTime<Utc>,
}

impl TryFrom<AnomalyRow> for Anomaly {
    type Error = MonitorError;

    fn try_from(row: AnomalyRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            anomaly_type: row.anomaly_type.parse()?,
            severity: row.severity.parse()?,
            status: row.status.parse()?,
            transaction_id: row.transaction_id,
            related_transaction_ids: row.related_transaction_ids,
            network: row.network,
            contract_address: row.contract_address,
            title: row.title,
            description: row.description,
            data: row.data,
            confidence: row.confidence,
            resolution_notes: row.resolution_notes,
            resolved_by: row.resolved_by,
            resolved_at: row.resolved_at,
            alert_ids: row.alert_ids,
            detected_at: row.detected_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    alert_id: String,
    alert_type: String,
    severity: String,
    title: String,
    message: String,
    details: JsonValue,
    anomaly_id: Option<i64>,
    transaction_id: Option<i64>,
    transaction_ref: Option<String>,
    network: Option<String>,
    contract_address: Option<String>,
    status: String,
    group_key: String,
    channels: Json<Vec<ChannelDelivery>>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    auto_resolve: bool,
    expires_at: Option<DateTime<Utc>>,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = MonitorError;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            alert_id: row.alert_id,
            alert_type: row.alert_type.parse()?,
            severity: row.severity.parse()?,
            title: row.title,
            message: row.message,
            details: row.details,
            anomaly_id: row.anomaly_id,
            transaction_id: row.transaction_id,
            transaction_ref: row.transaction_ref,
            network: row.network,
            contract_address: row.contract_address,
            status: row.status.parse()?,
            group_key: row.group_key,
            channels: row.channels.0,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            next_retry_at: row.next_retry_at,
            auto_resolve: row.auto_resolve,
            expires_at: row.expires_at,
            acknowledged_by: row.acknowledged_by,
            acknowledged_at: row.acknowledged_at,
            resolved_by: row.resolved_by,
            resolved_at: row.resolved_at,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = MonitorError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the embedded migrations.
    pub async fn connect(config: &DatabaseConfig) -> eyre::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

        tracing::info!("Connected to PostgreSQL");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

        tracing::info!("Database migrations complete");
        Ok(Self::new(pool))
    }

    async fn fetch_transactions(&self, sql: &str, binds: TxBinds<'_>) -> Result<Vec<BridgeTransaction>> {
        let query = sqlx::query_as::<_, TransactionRow>(sql);
        let query = match binds {
            TxBinds::Network(network, since) => query.bind(network).bind(since),
            TxBinds::Before(before) => query.bind(before),
        };
        convert_all(query.fetch_all(&self.pool).await?)
    }
}

enum TxBinds<'a> {
    Network(&'a str, DateTime<Utc>),
    Before(DateTime<Utc>),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ============================================================
    // Transactions
    // ============================================================

    async fn insert_transaction(&self, tx: &BridgeTransaction) -> Result<Option<BridgeTransaction>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO bridge_transactions (network, chain_id, block_number, block_hash, tx_hash, \
             log_index, event_kind, bridge_contract, token_address, token_symbol, token_decimals, \
             amount_raw, amount, amount_value, from_address, to_address, bridge_id, target_chain_id, \
             status, observed_at, gas_used, gas_price) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
             $19, $20, $21, $22) \
             ON CONFLICT (tx_hash, log_index, network) DO NOTHING \
             RETURNING id",
        )
        .bind(&tx.network)
        .bind(tx.chain_id)
        .bind(tx.block_number)
        .bind(&tx.block_hash)
        .bind(&tx.tx_hash)
        .bind(tx.log_index)
        .bind(tx.event_kind.as_str())
        .bind(&tx.bridge_contract)
        .bind(&tx.token_address)
        .bind(&tx.token_symbol)
        .bind(tx.token_decimals)
        .bind(&tx.amount_raw)
        .bind(&tx.amount)
        .bind(tx.amount_value())
        .bind(&tx.from_address)
        .bind(&tx.to_address)
        .bind(&tx.bridge_id)
        .bind(tx.target_chain_id)
        .bind(tx.status.as_str())
        .bind(tx.timestamp)
        .bind(tx.gas_used)
        .bind(tx.gas_price)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| {
            let mut stored = tx.clone();
            stored.id = Some(id);
            stored
        }))
    }

    async fn get_transaction(&self, id: i64) -> Result<Option<BridgeTransaction>> {
        let sql = format!("SELECT {} FROM bridge_transactions WHERE id = $1", TX_COLUMNS);
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BridgeTransaction::try_from).transpose()
    }

    async fn transactions_by_bridge_id(&self, bridge_id: &str) -> Result<Vec<BridgeTransaction>> {
        let sql = format!(
            "SELECT {} FROM bridge_transactions WHERE bridge_id = $1 ORDER BY observed_at, id",
            TX_COLUMNS
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(bridge_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn unmatched_outbound(
        &self,
        network: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>> {
        let sql = format!(
            "SELECT {} FROM bridge_transactions \
             WHERE network = $1 AND observed_at >= $2 AND status = 'pending' AND NOT is_matched \
               AND event_kind IN ('lock', 'burn') \
             ORDER BY observed_at, id",
            TX_COLUMNS
        );
        self.fetch_transactions(&sql, TxBinds::Network(network, since)).await
    }

    async fn fuzzy_candidates(
        &self,
        exclude_chain_id: i64,
        token_symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>> {
        let sql = format!(
            "SELECT {} FROM bridge_transactions \
             WHERE chain_id <> $1 AND REGEXP_REPLACE(UPPER(BTRIM(token_symbol)), '\\.E$', '') = $2 \
               AND observed_at BETWEEN $3 AND $4 AND NOT is_matched \
             ORDER BY observed_at, id",
            TX_COLUMNS
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(exclude_chain_id)
            .bind(normalize_symbol(token_symbol))
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn stale_outbound(&self, before: DateTime<Utc>) -> Result<Vec<BridgeTransaction>> {
        let sql = format!(
            "SELECT {} FROM bridge_transactions \
             WHERE observed_at < $1 AND status = 'pending' AND NOT is_matched \
               AND event_kind IN ('lock', 'burn') \
             ORDER BY observed_at, id",
            TX_COLUMNS
        );
        self.fetch_transactions(&sql, TxBinds::Before(before)).await
    }

    async fn mark_matched(&self, a_id: i64, b_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;

        let rows: Vec<(i64, bool)> = sqlx::query_as(
            "SELECT id, is_matched FROM bridge_transactions WHERE id = ANY($1) FOR UPDATE",
        )
        .bind(vec![a_id, b_id])
        .fetch_all(&mut *db_tx)
        .await?;

        for id in [a_id, b_id] {
            match rows.iter().find(|(row_id, _)| *row_id == id) {
                None => return Err(MonitorError::not_found("transaction", id)),
                Some((_, true)) => {
                    return Err(MonitorError::Validation(format!(
                        "transaction {} is already matched",
                        id
                    )))
                }
                Some(_) => {}
            }
        }

        sqlx::query(
            "UPDATE bridge_transactions \
             SET matched_transaction_id = CASE WHEN id = $1 THEN $2 ELSE $1 END, \
                 is_matched = TRUE, status = 'completed', matched_at = $3 \
             WHERE id IN ($1, $2)",
        )
        .bind(a_id)
        .bind(b_id)
        .bind(now)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn set_transaction_status(&self, id: i64, status: TxStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE bridge_transactions SET status = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sender_activity(&self, network: &str, sender: &str, since: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bridge_transactions \
             WHERE network = $1 AND from_address = $2 AND observed_at >= $3",
        )
        .bind(network)
        .bind(sender)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn volume_stats(
        &self,
        network: &str,
        token: &str,
        since: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> Result<VolumeStats> {
        let (samples, average): (i64, f64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(AVG(amount_value), 0)::DOUBLE PRECISION \
             FROM bridge_transactions \
             WHERE network = $1 AND token_address = $2 AND observed_at >= $3 \
               AND ($4::BIGINT IS NULL OR id <> $4)",
        )
        .bind(network)
        .bind(token)
        .bind(since)
        .bind(exclude_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(VolumeStats { samples, average })
    }

    async fn duplicate_candidates(
        &self,
        network: &str,
        bridge_id: &str,
        amount_raw: &BigDecimal,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>> {
        let sql = format!(
            "SELECT {} FROM bridge_transactions \
             WHERE network = $1 AND bridge_id = $2 AND amount_raw = $3 AND observed_at >= $4 \
             ORDER BY observed_at, id",
            TX_COLUMNS
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(network)
            .bind(bridge_id)
            .bind(amount_raw)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<(Vec<BridgeTransaction>, i64)> {
        let (limit, offset) = page(query.limit, query.offset);
        let status = query.status.map(|s| s.as_str());

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bridge_transactions \
             WHERE ($1::TEXT IS NULL OR network = $1) AND ($2::TEXT IS NULL OR status = $2)",
        )
        .bind(&query.network)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM bridge_transactions \
             WHERE ($1::TEXT IS NULL OR network = $1) AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY observed_at DESC, id DESC \
             LIMIT $3 OFFSET $4",
            TX_COLUMNS
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(&query.network)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok((convert_all(rows)?, total))
    }

    async fn transaction_counts(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM bridge_transactions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn delete_terminal_transactions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM bridge_transactions \
             WHERE observed_at < $1 AND status IN ('completed', 'failed', 'timeout')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ============================================================
    // Anomalies
    // ============================================================

    async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<Anomaly> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO anomalies (anomaly_type, severity, status, transaction_id, \
             related_transaction_ids, network, contract_address, title, description, data, \
             confidence, detected_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING id",
        )
        .bind(anomaly.anomaly_type.as_str())
        .bind(anomaly.severity.as_str())
        .bind(anomaly.status.as_str())
        .bind(anomaly.transaction_id)
        .bind(&anomaly.related_transaction_ids)
        .bind(&anomaly.network)
        .bind(&anomaly.contract_address)
        .bind(&anomaly.title)
        .bind(&anomaly.description)
        .bind(&anomaly.data)
        .bind(anomaly.confidence)
        .bind(anomaly.detected_at)
        .fetch_one(&self.pool)
        .await?;

        let mut stored = anomaly.clone();
        stored.id = Some(id);
        Ok(stored)
    }

    async fn get_anomaly(&self, id: i64) -> Result<Option<Anomaly>> {
        let sql = format!("SELECT {} FROM anomalies WHERE id = $1", ANOMALY_COLUMNS);
        let row: Option<AnomalyRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Anomaly::try_from).transpose()
    }

    async fn attach_alert(&self, anomaly_id: i64, alert_id: i64) -> Result<()> {
        sqlx::query("UPDATE anomalies SET alert_ids = array_append(alert_ids, $2) WHERE id = $1")
            .bind(anomaly_id)
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
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
        let resolved_at = status.is_terminal().then_some(now);
        let sql = format!(
            "UPDATE anomalies \
             SET status = $2, resolution_notes = COALESCE($3, resolution_notes), \
                 resolved_by = COALESCE($4, resolved_by), resolved_at = COALESCE($5, resolved_at) \
             WHERE id = $1 \
             RETURNING {}",
            ANOMALY_COLUMNS
        );
        let row: Option<AnomalyRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(notes)
            .bind(resolved_by)
            .bind(resolved_at)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Anomaly::try_from)
            .transpose()?
            .ok_or_else(|| MonitorError::not_found("anomaly", id))
    }

    async fn list_anomalies(&self, query: &AnomalyQuery) -> Result<(Vec<Anomaly>, i64)> {
        let (limit, offset) = page(query.limit, query.offset);
        let severity = query.severity.map(|s| s.as_str());
        let status = query.status.map(|s| s.as_str());

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM anomalies \
             WHERE ($1::TEXT IS NULL OR network = $1) \
               AND ($2::TEXT IS NULL OR severity = $2) \
               AND ($3::TEXT IS NULL OR status = $3)",
        )
        .bind(&query.network)
        .bind(severity)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM anomalies \
             WHERE ($1::TEXT IS NULL OR network = $1) \
               AND ($2::TEXT IS NULL OR severity = $2) \
               AND ($3::TEXT IS NULL OR status = $3) \
             ORDER BY detected_at DESC, id DESC \
             LIMIT $4 OFFSET $5",
            ANOMALY_COLUMNS
        );
        let rows: Vec<AnomalyRow> = sqlx::query_as(&sql)
            .bind(&query.network)
            .bind(severity)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok((convert_all(rows)?, total))
    }

    async fn delete_resolved_anomalies(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM anomalies \
             WHERE detected_at < $1 AND status IN ('resolved', 'false_positive')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ============================================================
    // Alerts
    // ============================================================

    async fn insert_alert(&self, alert: &Alert) -> Result<Alert> {
        let inserted: std::result::Result<(i64,), sqlx::Error> = sqlx::query_as(
            "INSERT INTO alerts (alert_id, alert_type, severity, title, message, details, anomaly_id, \
             transaction_id, transaction_ref, network, contract_address, status, group_key, channels, \
             retry_count, max_retries, next_retry_at, auto_resolve, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20) \
             RETURNING id",
        )
        .bind(&alert.alert_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.details)
        .bind(alert.anomaly_id)
        .bind(alert.transaction_id)
        .bind(&alert.transaction_ref)
        .bind(&alert.network)
        .bind(&alert.contract_address)
        .bind(alert.status.as_str())
        .bind(&alert.group_key)
        .bind(Json(&alert.channels))
        .bind(alert.retry_count)
        .bind(alert.max_retries)
        .bind(alert.next_retry_at)
        .bind(alert.auto_resolve)
        .bind(alert.expires_at)
        .bind(alert.created_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok((id,)) => {
                let mut stored = alert.clone();
                stored.id = Some(id);
                Ok(stored)
            }
            Err(e) if is_unique_violation(&e) => Err(MonitorError::Duplicate(alert.alert_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_alert(&self, alert: &Alert) -> Result<()> {
        let id = alert
            .id
            .ok_or_else(|| MonitorError::Validation("cannot update an unsaved alert".into()))?;

        sqlx::query(
            "UPDATE alerts SET status = $2, channels = $3, retry_count = $4, next_retry_at = $5, \
             acknowledged_by = $6, acknowledged_at = $7, resolved_by = $8, resolved_at = $9, \
             notes = $10 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(alert.status.as_str())
        .bind(Json(&alert.channels))
        .bind(alert.retry_count)
        .bind(alert.next_retry_at)
        .bind(&alert.acknowledged_by)
        .bind(alert.acknowledged_at)
        .bind(&alert.resolved_by)
        .bind(alert.resolved_at)
        .bind(&alert.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        let sql = format!("SELECT {} FROM alerts WHERE id = $1", ALERT_COLUMNS);
        let row: Option<AlertRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Alert::try_from).transpose()
    }

    async fn recent_alert_exists(&self, group_key: &str, since: DateTime<Utc>) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM alerts WHERE group_key = $1 AND created_at >= $2)",
        )
        .bind(group_key)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn alerts_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let sql = format!(
            "SELECT {} FROM alerts \
             WHERE status = 'pending' AND next_retry_at IS NOT NULL AND next_retry_at <= $1 \
               AND retry_count < max_retries \
             ORDER BY next_retry_at \
             LIMIT 100",
            ALERT_COLUMNS
        );
        let rows: Vec<AlertRow> = sqlx::query_as(&sql).bind(now).fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn resolve_expired_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let sql = format!(
            "UPDATE alerts SET status = 'resolved', resolved_by = 'system', resolved_at = $1 \
             WHERE auto_resolve AND expires_at IS NOT NULL AND expires_at <= $1 \
               AND status <> 'resolved' \
             RETURNING {}",
            ALERT_COLUMNS
        );
        let rows: Vec<AlertRow> = sqlx::query_as(&sql).bind(now).fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<(Vec<Alert>, i64)> {
        let (limit, offset) = page(query.limit, query.offset);
        let severity = query.severity.map(|s| s.as_str());
        let status = query.status.map(|s| s.as_str());

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM alerts \
             WHERE ($1::TEXT IS NULL OR severity = $1) AND ($2::TEXT IS NULL OR status = $2)",
        )
        .bind(severity)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM alerts \
             WHERE ($1::TEXT IS NULL OR severity = $1) AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3 OFFSET $4",
            ALERT_COLUMNS
        );
        let rows: Vec<AlertRow> = sqlx::query_as(&sql)
            .bind(severity)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok((convert_all(rows)?, total))
    }

    async fn delete_resolved_alerts(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM alerts WHERE status = 'resolved' AND resolved_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
