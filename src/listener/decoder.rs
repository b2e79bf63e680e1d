use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;

use super::types::EventKind;
use crate::error::MonitorError;

// Bridge contract ABI. Outbound events carry the destination chain,
// inbound events the chain the funds came from.
sol! {
    event TokensLocked(
        address indexed token,
        address indexed sender,
        address recipient,
        uint256 amount,
        uint256 targetChainId,
        bytes32 bridgeId
    );

    event TokensUnlocked(
        address indexed token,
        address indexed recipient,
        address sender,
        uint256 amount,
        uint256 sourceChainId,
        bytes32 bridgeId
    );

    event TokensMinted(
        address indexed token,
        address indexed recipient,
        address sender,
        uint256 amount,
        uint256 sourceChainId,
        bytes32 bridgeId
    );

    event TokensBurned(
        address indexed token,
        address indexed sender,
        address recipient,
        uint256 amount,
        uint256 targetChainId,
        bytes32 bridgeId
    );
}

/// topic0 of the four bridge events, in `EventKind` order.
pub fn bridge_event_signatures() -> Vec<B256> {
    vec![
        TokensLocked::SIGNATURE_HASH,
        TokensUnlocked::SIGNATURE_HASH,
        TokensMinted::SIGNATURE_HASH,
        TokensBurned::SIGNATURE_HASH,
    ]
}

/// A bridge event with its ABI fields decoded but not yet enriched.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBridgeEvent {
    pub kind: EventKind,
    pub contract: Address,
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub bridge_id: Option<B256>,
    /// Target chain for outbound events, source chain for inbound ones.
    pub counterpart_chain_id: Option<u64>,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub block_timestamp: Option<u64>,
}

fn decode_err(kind: &str, e: impl std::fmt::Display) -> MonitorError {
    MonitorError::Decode(format!("{} log: {}", kind, e))
}

fn non_zero(id: B256) -> Option<B256> {
    (id != B256::ZERO).then_some(id)
}

/// Decode a raw log emitted by the bridge contract.
pub fn decode_bridge_log(log: &Log) -> Result<DecodedBridgeEvent, MonitorError> {
    let topic0 = log
        .topic0()
        .copied()
        .ok_or_else(|| MonitorError::Decode("log has no topics".into()))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| MonitorError::Decode("log has no transaction hash".into()))?;

    let (kind, token, from, to, amount, chain, bridge_id) = if topic0 == TokensLocked::SIGNATURE_HASH {
        let e = log.log_decode::<TokensLocked>().map_err(|e| decode_err("TokensLocked", e))?.inner.data;
        (EventKind::Lock, e.token, e.sender, e.recipient, e.amount, e.targetChainId, e.bridgeId)
    } else if topic0 == TokensUnlocked::SIGNATURE_HASH {
        let e = log.log_decode::<TokensUnlocked>().map_err(|e| decode_err("TokensUnlocked", e))?.inner.data;
        (EventKind::Unlock, e.token, e.sender, e.recipient, e.amount, e.sourceChainId, e.bridgeId)
    } else if topic0 == TokensMinted::SIGNATURE_HASH {
        let e = log.log_decode::<TokensMinted>().map_err(|e| decode_err("TokensMinted", e))?.inner.data;
        (EventKind::Mint, e.token, e.sender, e.recipient, e.amount, e.sourceChainId, e.bridgeId)
    } else if topic0 == TokensBurned::SIGNATURE_HASH {
        let e = log.log_decode::<TokensBurned>().map_err(|e| decode_err("TokensBurned", e))?.inner.data;
        (EventKind::Burn, e.token, e.sender, e.recipient, e.amount, e.targetChainId, e.bridgeId)
    } else {
        return Err(MonitorError::Decode(format!("unknown event signature {}", topic0)));
    };

    Ok(DecodedBridgeEvent {
        kind,
        contract: log.address(),
        token,
        from,
        to,
        amount,
        bridge_id: non_zero(bridge_id),
        counterpart_chain_id: u64::try_from(chain).ok().filter(|id| *id != 0),
        tx_hash,
        log_index: log.log_index.unwrap_or(0),
        block_number: log.block_number,
        block_hash: log.block_hash,
        block_timestamp: log.block_timestamp,
    })
}
