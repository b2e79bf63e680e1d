use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::decoder::{bridge_event_signatures, decode_bridge_log, DecodedBridgeEvent};
use super::types::{BridgeTransaction, ListenerHealth, ListenerState, TxStatus};
use crate::alerts::system::AlertSystem;
use crate::alerts::types::{AlertRequest, AlertSeverity, AlertType};
use crate::config::{ListenerConfig, NetworkConfig};
use crate::error::{MonitorError, Result};
use crate::tokens::amount::{format_amount, to_big_decimal};
use crate::tokens::cache::{fetch_token_meta, TokenCache};
use crate::tokens::registry::{build_token_seed, TokenMeta};

/// Block-level context resolved for a decoded event.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub gas_used: Option<i64>,
    pub gas_price: Option<i64>,
}

/// Combine a decoded log, its token metadata and block context into the canonical record.
pub fn build_transaction(
    network: &NetworkConfig,
    event: &DecodedBridgeEvent,
    token: &TokenMeta,
    ctx: &EventContext,
) -> BridgeTransaction {
    BridgeTransaction {
        id: None,
        network: network.name.clone(),
        chain_id: network.chain_id as i64,
        block_number: ctx.block_number as i64,
        block_hash: event
            .block_hash
            .map(|h| format!("{:#x}", h))
            .unwrap_or_default(),
        tx_hash: format!("{:#x}", event.tx_hash),
        log_index: event.log_index as i32,
        event_kind: event.kind,
        bridge_contract: format!("{:#x}", event.contract),
        token_address: format!("{:#x}", event.token),
        token_symbol: token.symbol.clone(),
        token_decimals: token.decimals as i16,
        amount_raw: to_big_decimal(event.amount),
        amount: format_amount(event.amount, token.decimals),
        from_address: format!("{:#x}", event.from),
        to_address: format!("{:#x}", event.to),
        bridge_id: event.bridge_id.map(|id| format!("{:#x}", id)),
        target_chain_id: if event.kind.is_outbound() {
            event.counterpart_chain_id.map(|id| id as i64)
        } else {
            None
        },
        status: TxStatus::Pending,
        timestamp: ctx.timestamp,
        gas_used: ctx.gas_used,
        gas_price: ctx.gas_price,
        matched_transaction_id: None,
        is_matched: false,
        matched_at: None,
    }
}

/// Event time from its block header. A missing block or a zero timestamp
/// fails normalization instead of dating the event to the epoch.
pub fn block_time(block_number: u64, seconds: Option<u64>) -> Result<DateTime<Utc>> {
    let seconds = seconds
        .filter(|&s| s > 0)
        .ok_or_else(|| MonitorError::Decode(format!("block {} not found", block_number)))?;
    i64::try_from(seconds)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .ok_or_else(|| MonitorError::Decode(format!("block {} has invalid timestamp {}", block_number, seconds)))
}

/// Retry an RPC call with exponential backoff, mapping the final failure to `Transport`.
pub async fn retry_rpc<F, Fut, T, E>(endpoint: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = Duration::from_millis(500);
    let max_retries = 3;

    for attempt in 0..max_retries {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                tracing::warn!(
                    network = %endpoint,
                    attempt = attempt + 1,
                    max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "RPC call failed, retrying..."
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(10));
            }
        }
    }

    f().await.map_err(|e| MonitorError::transport(endpoint, e))
}

/// One streaming session per network. Restartable: the supervisor calls
/// `start_listening` again on the same instance after the task has ended.
pub struct ChainConnector {
    config: NetworkConfig,
    listener: ListenerConfig,
    bridge_address: Address,
    health: RwLock<ListenerHealth>,
    tokens: Mutex<TokenCache>,
    sink: mpsc::Sender<BridgeTransaction>,
    alerts: Arc<AlertSystem>,
    backfill_done: AtomicBool,
    session: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ChainConnector {
    pub fn new(
        config: NetworkConfig,
        listener: ListenerConfig,
        sink: mpsc::Sender<BridgeTransaction>,
        alerts: Arc<AlertSystem>,
    ) -> Result<Self> {
        let bridge_address = Address::from_str(&config.bridge_address).map_err(|e| {
            MonitorError::Validation(format!(
                "invalid bridge address '{}' for {}: {}",
                config.bridge_address, config.name, e
            ))
        })?;
        let tokens = TokenCache::seeded(listener.token_cache_capacity, build_token_seed(&config));
        let health = ListenerHealth::new(&config.name, config.chain_id as i64);

        Ok(Self {
            config,
            listener,
            bridge_address,
            health: RwLock::new(health),
            tokens: Mutex::new(tokens),
            sink,
            alerts,
            backfill_done: AtomicBool::new(false),
            session: Mutex::new(None),
        })
    }

    pub fn network(&self) -> &str {
        &self.config.name
    }

    pub async fn health(&self) -> ListenerHealth {
        self.health.read().await.clone()
    }

    /// Open a WebSocket session to the node.
    pub async fn connect(&self) -> Result<DynProvider> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.config.rpc_ws.clone()))
            .await
            .map_err(|e| MonitorError::transport(&self.config.name, e))?;
        Ok(provider.erased())
    }

    /// Spawn the listening task. No-op while a previous task is still running.
    pub async fn start_listening(self: &Arc<Self>, parent: &CancellationToken) {
        let mut session = self.session.lock().await;
        if let Some((_, handle)) = session.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let token = parent.child_token();
        let connector = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move { connector.run(task_token).await });
        *session = Some((token, handle));
    }

    /// Cancel the listening task and wait for it to close its session.
    pub async fn stop(&self) {
        let session = self.session.lock().await.take();
        if let Some((token, handle)) = session {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(network = %self.config.name, error = %e, "Connector task panicked");
            }
        }
        self.set_state(ListenerState::Stopped).await;
    }

    async fn set_state(&self, state: ListenerState) {
        self.health.write().await.state = state;
    }

    async fn record_error(&self, error: &MonitorError) {
        self.health.write().await.last_error = Some(error.to_string());
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let name = self.config.name.clone();
        let mut attempt: u32 = 0;

        loop {
            self.set_state(if attempt == 0 {
                ListenerState::Connecting
            } else {
                ListenerState::Reconnecting
            })
            .await;

            let mut subscribed = false;
            match self.connect().await {
                Ok(provider) => match self.listen(&provider, &token, &mut subscribed).await {
                    Ok(()) => {
                        tracing::info!(network = %name, "Listener stopped");
                        self.set_state(ListenerState::Stopped).await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(network = %name, error = %e, "Listener session ended");
                        self.record_error(&e).await;
                    }
                },
                Err(e) => {
                    tracing::warn!(network = %name, attempt, error = %e, "Failed to connect");
                    self.record_error(&e).await;
                }
            }

            if token.is_cancelled() {
                self.set_state(ListenerState::Stopped).await;
                return;
            }

            if subscribed {
                attempt = 0;
            }
            attempt += 1;

            if attempt > self.listener.max_reconnect_attempts {
                self.fail().await;
                return;
            }

            {
                let mut health = self.health.write().await;
                health.state = ListenerState::Reconnecting;
                health.reconnect_attempts = attempt;
            }

            let delay = self.listener.reconnect_delay() * attempt;
            tracing::info!(
                network = %name,
                attempt,
                max_attempts = self.listener.max_reconnect_attempts,
                delay_secs = delay.as_secs(),
                "Reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    self.set_state(ListenerState::Stopped).await;
                    return;
                }
            }
        }
    }

    async fn fail(&self) {
        let last_error = {
            let mut health = self.health.write().await;
            health.state = ListenerState::Failed;
            health.last_error.clone().unwrap_or_default()
        };
        tracing::error!(
            network = %self.config.name,
            attempts = self.listener.max_reconnect_attempts,
            error = %last_error,
            "Listener exhausted its reconnect attempts"
        );

        let mut request = AlertRequest::new(
            AlertType::ListenerFailed,
            AlertSeverity::Critical,
            format!("Listener for {} failed", self.config.name),
            format!(
                "Gave up after {} reconnect attempts: {}",
                self.listener.max_reconnect_attempts, last_error
            ),
        )
        .with_network(&self.config.name)
        .with_details(serde_json::json!({
            "chain_id": self.config.chain_id,
            "last_error": last_error,
        }));
        request.contract_address = Some(format!("{:#x}", self.bridge_address));
        self.alerts.raise(request).await;
    }

    fn base_filter(&self) -> Filter {
        Filter::new()
            .address(self.bridge_address)
            .event_signature(bridge_event_signatures())
    }

    /// Subscribe, catch up on history, then stream until cancelled or the stream ends.
    async fn listen(
        &self,
        provider: &DynProvider,
        token: &CancellationToken,
        subscribed: &mut bool,
    ) -> Result<()> {
        let name = &self.config.name;
        let subscription = provider
            .subscribe_logs(&self.base_filter())
            .await
            .map_err(|e| MonitorError::transport(name, e))?;
        let mut stream = subscription.into_stream();
        *subscribed = true;

        {
            let mut health = self.health.write().await;
            health.state = ListenerState::Listening;
            health.subscriptions = bridge_event_signatures().len();
            health.reconnect_attempts = 0;
            health.last_error = None;
        }
        tracing::info!(network = %name, bridge = %self.bridge_address, "Subscribed to bridge events");

        self.catch_up(provider, token).await?;

        loop {
            tokio::select! {
                maybe_log = stream.next() => match maybe_log {
                    Some(log) => self.handle_log(provider, log).await,
                    None => return Err(MonitorError::transport(name, "log subscription closed")),
                },
                _ = token.cancelled() => return Ok(()),
            }
        }
    }

    /// First session: backfill from `start_block`. Later sessions: replay the blocks
    /// missed since the last processed one.
    async fn catch_up(&self, provider: &DynProvider, token: &CancellationToken) -> Result<()> {
        let name = &self.config.name;
        let head = retry_rpc(name, || provider.get_block_number()).await?;
        let last_processed = self.health.read().await.last_processed_block;
        let first_session = !self.backfill_done.load(Ordering::SeqCst);

        // Determine where to resume from
        let from = match last_processed {
            Some(last) => Some(last + 1),
            None if first_session => self.config.start_block,
            None => None,
        };

        if let Some(from) = from.filter(|f| *f <= head) {
            tracing::info!(
                network = %name,
                from,
                to = head,
                kind = if first_session { "backfill" } else { "gap replay" },
                "Replaying historical blocks"
            );
            self.replay(provider, from, head, token).await?;
        }

        // Everything up to the head seen here is covered; the live stream takes over
        if !token.is_cancelled() {
            let mut health = self.health.write().await;
            health.last_processed_block = Some(health.last_processed_block.unwrap_or(0).max(head));
            if first_session {
                tracing::info!(network = %name, head, "Backfill complete");
            }
            self.backfill_done.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn replay(
        &self,
        provider: &DynProvider,
        start_block: u64,
        end_block: u64,
        token: &CancellationToken,
    ) -> Result<()> {
        let name = &self.config.name;
        let batch_size = self.config.batch_size.max(1);
        let mut current = start_block;
        let total_blocks = end_block - start_block + 1;

        while current <= end_block && !token.is_cancelled() {
            let to_block = std::cmp::min(current + batch_size - 1, end_block);
            let progress = ((current - start_block) as f64 / total_blocks as f64 * 100.0) as u32;

            tracing::info!(
                network = %name,
                from = current,
                to = to_block,
                progress = %format!("{}%", progress),
                "Replaying block range"
            );

            // Fetch every bridge event emitted by the contract in this range
            let filter = self.base_filter().from_block(current).to_block(to_block);
            let logs = retry_rpc(name, || provider.get_logs(&filter)).await?;

            // Normalize and forward; bad logs are skipped inside handle_log
            tracing::debug!(network = %name, logs = logs.len(), "Fetched bridge logs");
            for log in logs {
                self.handle_log(provider, log).await;
            }

            // Update checkpoint
            self.health.write().await.last_processed_block = Some(to_block);
            current = to_block + 1;
        }
        Ok(())
    }

    /// Normalize and emit one log. Failures skip only this event.
    async fn handle_log(&self, provider: &DynProvider, log: Log) {
        if log.removed {
            tracing::debug!(network = %self.config.name, "Ignoring removed log");
            return;
        }

        match self.normalize(provider, &log).await {
            Ok(tx) => {
                {
                    let mut health = self.health.write().await;
                    health.last_event_at = Some(Utc::now());
                    let block = tx.block_number as u64;
                    if health.last_processed_block.map_or(true, |b| b < block) {
                        health.last_processed_block = Some(block);
                    }
                }
                tracing::info!(
                    network = %tx.network,
                    kind = %tx.event_kind,
                    tx_hash = %tx.tx_hash,
                    amount = %tx.amount,
                    token = %tx.token_symbol,
                    "Bridge event"
                );
                if self.sink.send(tx).await.is_err() {
                    tracing::error!(network = %self.config.name, "Ingest channel closed, dropping event");
                }
            }
            Err(e) => {
                tracing::warn!(
                    network = %self.config.name,
                    tx_hash = ?log.transaction_hash,
                    error = %e,
                    "Skipping bridge event"
                );
            }
        }
    }

    async fn normalize(&self, provider: &DynProvider, log: &Log) -> Result<BridgeTransaction> {
        let name = &self.config.name;
        let event = decode_bridge_log(log)?;
        let block_number = event
            .block_number
            .ok_or_else(|| MonitorError::Decode("log has no block number".into()))?;

        let receipt = retry_rpc(name, || provider.get_transaction_receipt(event.tx_hash)).await?;
        let (gas_used, gas_price) = match receipt {
            Some(r) => (
                i64::try_from(r.gas_used).ok(),
                i64::try_from(r.effective_gas_price).ok(),
            ),
            None => (None, None),
        };

        let seconds = match event.block_timestamp {
            Some(ts) => Some(ts),
            None => {
                let block = retry_rpc(name, || async {
                    provider
                        .get_block_by_number(BlockNumberOrTag::Number(block_number))
                        .await
                })
                .await?;
                block.map(|b| b.header.timestamp)
            }
        };
        let timestamp = block_time(block_number, seconds)?;

        let token = self.resolve_token(provider, event.token).await;
        let ctx = EventContext {
            block_number,
            timestamp,
            gas_used,
            gas_price,
        };
        Ok(build_transaction(&self.config, &event, &token, &ctx))
    }

    /// Cached metadata, else ERC-20 calls, else `UNKNOWN`/18.
    async fn resolve_token(&self, provider: &DynProvider, token: Address) -> TokenMeta {
        if let Some(meta) = self.tokens.lock().await.get(&token) {
            return meta;
        }

        match fetch_token_meta(provider, token).await {
            Ok(meta) => {
                tracing::info!(
                    network = %self.config.name,
                    token = %token,
                    symbol = %meta.symbol,
                    decimals = meta.decimals,
                    "Resolved token metadata"
                );
                self.tokens.lock().await.insert(token, meta.clone());
                meta
            }
            Err(e) => {
                tracing::warn!(
                    network = %self.config.name,
                    token = %token,
                    error = %e,
                    "Token metadata lookup failed, using UNKNOWN"
                );
                TokenMeta::unknown()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::listener::decoder::tests::{lock_event, rpc_log, USDC};
    use crate::listener::network::NetworkKind;
    use crate::listener::types::EventKind;
    use alloy::primitives::B256;
    use alloy::sol_types::SolEvent;

    pub(crate) fn network(name: &str, chain_id: u64, rpc_ws: &str) -> NetworkConfig {
        NetworkConfig {
            name: name.to_string(),
            chain_id,
            kind: NetworkKind::Ethereum,
            rpc_ws: rpc_ws.to_string(),
            bridge_address: "0x1111111111111111111111111111111111111111".to_string(),
            start_block: None,
            batch_size: 1000,
            enabled: true,
            tokens: vec![],
            max_gas_used: None,
            max_gas_price_gwei: None,
        }
    }

    fn context() -> EventContext {
        EventContext {
            block_number: 19_000_000,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            gas_used: Some(85_000),
            gas_price: Some(25_000_000_000),
        }
    }

    #[test]
    fn test_build_transaction_normalizes_lock() {
        let id = B256::repeat_byte(0x11);
        let decoded = decode_bridge_log(&rpc_log(lock_event(1_500_000, id).encode_log_data(), 7)).unwrap();
        let tx = build_transaction(
            &network("ethereum", 1, "wss://node"),
            &decoded,
            &TokenMeta::new("USDC", 6),
            &context(),
        );

        assert_eq!(tx.network, "ethereum");
        assert_eq!(tx.chain_id, 1);
        assert_eq!(tx.event_kind, EventKind::Lock);
        assert_eq!(tx.amount, "1.5");
        assert_eq!(tx.amount_raw.to_string(), "1500000");
        assert_eq!(tx.token_address, format!("{:#x}", USDC));
        assert_eq!(tx.bridge_contract, "0x1111111111111111111111111111111111111111");
        assert_eq!(tx.bridge_id, Some(format!("{:#x}", id)));
        assert_eq!(tx.target_chain_id, Some(137));
        assert_eq!(tx.log_index, 7);
        assert_eq!(tx.block_number, 19_000_000);
        assert_eq!(tx.status, TxStatus::Pending);
        assert!(tx.tx_hash.starts_with("0xaaaa"));
        assert_eq!(tx.gas_price_gwei(), Some(25.0));
    }

    #[test]
    fn test_block_time_requires_a_block() {
        let ts = block_time(19_000_000, Some(1_700_000_000)).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);

        assert!(matches!(block_time(19_000_000, None), Err(MonitorError::Decode(_))));
        assert!(matches!(block_time(19_000_000, Some(0)), Err(MonitorError::Decode(_))));
        assert!(matches!(block_time(19_000_000, Some(u64::MAX)), Err(MonitorError::Decode(_))));
    }

    #[test]
    fn test_unknown_token_uses_18_decimals() {
        let decoded = decode_bridge_log(&rpc_log(
            lock_event(2_000_000_000_000_000_000, B256::ZERO).encode_log_data(),
            0,
        ))
        .unwrap();
        let tx = build_transaction(
            &network("ethereum", 1, "wss://node"),
            &decoded,
            &TokenMeta::unknown(),
            &context(),
        );
        assert_eq!(tx.token_symbol, "UNKNOWN");
        assert_eq!(tx.amount, "2");
        assert_eq!(tx.bridge_id, None);
    }

    #[test]
    fn test_rejects_invalid_bridge_address() {
        let (sink, _rx) = mpsc::channel(1);
        let (alerts, _) = crate::test_utils::alert_system();
        let mut config = network("ethereum", 1, "wss://node");
        config.bridge_address = "nope".into();
        assert!(ChainConnector::new(config, ListenerConfig::default(), sink, alerts).is_err());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_transport_error() {
        let (sink, _rx) = mpsc::channel(1);
        let (alerts, _) = crate::test_utils::alert_system();
        let connector = ChainConnector::new(
            network("ethereum", 1, "not a websocket url"),
            ListenerConfig::default(),
            sink,
            alerts,
        )
        .unwrap();

        assert!(matches!(
            connector.connect().await,
            Err(MonitorError::Transport { .. })
        ));
        assert_eq!(connector.health().await.state, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_raise_critical_alert() {
        let (sink, _rx) = mpsc::channel(1);
        let (alerts, store) = crate::test_utils::alert_system();
        let listener = ListenerConfig {
            max_reconnect_attempts: 1,
            reconnect_delay_secs: 0,
            ..ListenerConfig::default()
        };
        let connector = Arc::new(
            ChainConnector::new(network("polygon", 137, "not a websocket url"), listener, sink, alerts)
                .unwrap(),
        );

        let root = CancellationToken::new();
        connector.start_listening(&root).await;
        let handle = connector.session.lock().await.take().unwrap().1;
        handle.await.unwrap();

        assert_eq!(connector.health().await.state, ListenerState::Failed);
        let stored = store.alerts();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].alert_type, AlertType::ListenerFailed);
        assert_eq!(stored[0].severity, AlertSeverity::Critical);
        assert_eq!(stored[0].network.as_deref(), Some("polygon"));
    }
}
