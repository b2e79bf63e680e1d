//! Builders shared by unit tests across modules.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::alerts::channels::Dispatch;
use crate::alerts::system::AlertSystem;
use crate::alerts::types::{Alert, ChannelType};
use crate::config::AlertConfig;
use crate::error::{MonitorError, Result};
use crate::feed::LiveFeed;
use crate::listener::types::{BridgeTransaction, EventKind, TxStatus};
use crate::store::memory::MemoryStore;

static NEXT_HASH: AtomicU64 = AtomicU64::new(1);

/// A pending USDC (6 decimals) bridge event with a unique tx hash.
pub fn sample_tx(
    network: &str,
    chain_id: i64,
    kind: EventKind,
    amount: &str,
    bridge_id: Option<&str>,
) -> BridgeTransaction {
    let n = NEXT_HASH.fetch_add(1, Ordering::Relaxed);
    let amount_raw = BigDecimal::from_str(amount).unwrap() * BigDecimal::from(1_000_000u64);

    BridgeTransaction {
        id: None,
        network: network.to_string(),
        chain_id,
        block_number: 100 + n as i64,
        block_hash: format!("0x{:064x}", n + 1_000_000),
        tx_hash: format!("0x{:064x}", n),
        log_index: 0,
        event_kind: kind,
        bridge_contract: "0x1111111111111111111111111111111111111111".to_string(),
        token_address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string(),
        token_symbol: "USDC".to_string(),
        token_decimals: 6,
        amount_raw: amount_raw.with_scale(0),
        amount: amount.to_string(),
        from_address: "0x000000000000000000000000000000000000aaaa".to_string(),
        to_address: "0x000000000000000000000000000000000000bbbb".to_string(),
        bridge_id: bridge_id.map(str::to_string),
        target_chain_id: None,
        status: TxStatus::Pending,
        timestamp: Utc::now(),
        gas_used: Some(120_000),
        gas_price: Some(30_000_000_000),
        matched_transaction_id: None,
        is_matched: false,
        matched_at: None,
    }
}

/// Dispatcher that records calls and fails on demand.
#[derive(Default)]
pub struct MockDispatcher {
    configured: Mutex<HashSet<ChannelType>>,
    failing: Mutex<HashSet<ChannelType>>,
    calls: Mutex<Vec<(String, ChannelType)>>,
}

impl MockDispatcher {
    pub fn with_channels(channels: &[ChannelType]) -> Self {
        let mock = Self::default();
        mock.configured.lock().unwrap().extend(channels.iter().copied());
        mock
    }

    pub fn fail(&self, channel: ChannelType, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(channel);
        } else {
            set.remove(&channel);
        }
    }

    pub fn calls(&self) -> Vec<(String, ChannelType)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatch for MockDispatcher {
    fn target(&self, channel: ChannelType) -> Option<String> {
        if channel == ChannelType::LiveFeed || self.configured.lock().unwrap().contains(&channel) {
            Some(format!("mock-{}", channel))
        } else {
            None
        }
    }

    async fn dispatch(&self, alert: &Alert, channel: ChannelType) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((alert.alert_id.clone(), channel));
        if self.failing.lock().unwrap().contains(&channel) {
            return Err(MonitorError::delivery(channel, "mock failure"));
        }
        Ok(())
    }
}

/// Alert system over an in-memory store with only the live feed configured.
pub fn alert_system() -> (Arc<AlertSystem>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let system = AlertSystem::new(
        store.clone(),
        Arc::new(MockDispatcher::default()),
        LiveFeed::new(64),
        AlertConfig::default(),
    );
    (Arc::new(system), store)
}
