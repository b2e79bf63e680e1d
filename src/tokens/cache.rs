use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::sol;
use chrono::Utc;
use std::collections::HashMap;

use crate::cache::BoundedCache;
use crate::error::MonitorError;

use super::registry::TokenMeta;

sol! {
    #[sol(rpc)]
    interface IERC20Metadata {
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

/// Per-connector token metadata cache, bounded with oldest-first eviction.
/// Capacity is never smaller than the seed, so construction keeps every seeded token.
pub struct TokenCache {
    entries: BoundedCache<Address, TokenMeta>,
}

impl TokenCache {
    pub fn seeded(capacity: usize, seed: HashMap<Address, TokenMeta>) -> Self {
        let now = Utc::now();
        let mut entries = BoundedCache::new(capacity.max(seed.len()));
        for (address, meta) in seed {
            entries.insert(address, meta, now);
        }
        Self { entries }
    }

    pub fn get(&self, address: &Address) -> Option<TokenMeta> {
        self.entries.get(address).cloned()
    }

    pub fn insert(&mut self, address: Address, meta: TokenMeta) {
        self.entries.insert(address, meta, Utc::now());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read `symbol()` and `decimals()` from an ERC-20 contract.
pub async fn fetch_token_meta<P: Provider + Clone>(
    provider: &P,
    token: Address,
) -> Result<TokenMeta, MonitorError> {
    let contract = IERC20Metadata::new(token, provider.clone());

    let symbol = contract
        .symbol()
        .call()
        .await
        .map_err(|e| MonitorError::transport(format!("token {:#x}", token), e))?;
    let decimals = contract
        .decimals()
        .call()
        .await
        .map_err(|e| MonitorError::transport(format!("token {:#x}", token), e))?;

    Ok(TokenMeta::new(symbol, decimals))
}
