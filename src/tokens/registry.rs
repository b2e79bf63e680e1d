use alloy::primitives::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::NetworkConfig;
use crate::listener::network::NetworkKind;

/// Symbol and decimal count for a token contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenMeta {
    pub symbol: String,
    pub decimals: u8,
}

impl TokenMeta {
    pub fn new(symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
        }
    }

    /// Placeholder used when a token contract does not answer metadata calls.
    pub fn unknown() -> Self {
        Self::new("UNKNOWN", 18)
    }
}

/// Well-known tokens per network, as (address, symbol, decimals).
pub fn well_known_tokens(kind: NetworkKind) -> &'static [(&'static str, &'static str, u8)] {
    match kind {
        NetworkKind::Ethereum => &[
            ("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", "USDC", 6),
            ("0xdAC17F958D2ee523a2206206994597C13D831ec7", "USDT", 6),
            ("0x6B175474E89094C44Da98b954EedeAC495271d0F", "DAI", 18),
            ("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", "WETH", 18),
            ("0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", "WBTC", 8),
        ],
        NetworkKind::Polygon => &[
            ("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359", "USDC", 6),
            ("0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174", "USDC.e", 6),
            ("0xc2132D05D31c914a87C6611C10748AEb04B58e8F", "USDT", 6),
            ("0x8f3Cf7ad23Cd3CaDbD9735AFf958023239c6A063", "DAI", 18),
            ("0x7ceB23fD6bC0adD59E62ac25578270cFf1b9f619", "WETH", 18),
        ],
        NetworkKind::Bsc => &[
            ("0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d", "USDC", 18),
            ("0x55d398326f99059fF775485246999027B3197955", "USDT", 18),
            ("0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56", "BUSD", 18),
            ("0x2170Ed0880ac9A755fd29B2688956BD959F933F8", "ETH", 18),
        ],
        NetworkKind::Generic => &[],
    }
}

/// Build the initial token map for a network: the network's well-known tokens,
/// overridden by anything listed in its config.
pub fn build_token_seed(config: &NetworkConfig) -> HashMap<Address, TokenMeta> {
    let mut map = HashMap::new();

    for (address, symbol, decimals) in well_known_tokens(config.kind) {
        if let Ok(address) = Address::from_str(address) {
            map.insert(address, TokenMeta::new(*symbol, *decimals));
        }
    }

    for token in &config.tokens {
        match Address::from_str(&token.address) {
            Ok(address) => {
                map.insert(address, TokenMeta::new(token.symbol.clone(), token.decimals));
            }
            Err(e) => {
                tracing::error!(
                    network = %config.name,
                    symbol = %token.symbol,
                    address = %token.address,
                    error = %e,
                    "Invalid token address in config, skipping"
                );
            }
        }
    }

    map
}

/// Canonical form used when comparing symbols across chains.
/// Bridged variants such as `USDC.e` compare equal to `USDC`.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_ascii_uppercase();
    upper
        .strip_suffix(".E")
        .map(str::to_string)
        .unwrap_or(upper)
}

pub fn symbols_equivalent(a: &str, b: &str) -> bool {
    normalize_symbol(a) == normalize_symbol(b)
}
