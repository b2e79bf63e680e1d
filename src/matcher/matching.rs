use chrono::Duration;
use serde::Serialize;

use crate::listener::types::BridgeTransaction;
use crate::tokens::registry::symbols_equivalent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Manual,
}

impl MatchType {
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Exact | Self::Manual => 1.0,
            Self::Fuzzy => 0.7,
        }
    }
}

/// Two sides of one cross-chain transfer. `source` is the outbound event.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedPair {
    pub source: BridgeTransaction,
    pub destination: BridgeTransaction,
    pub match_type: MatchType,
    pub confidence: f64,
}

impl MatchedPair {
    /// Orders the pair so the outbound event comes first.
    pub fn new(a: BridgeTransaction, b: BridgeTransaction, match_type: MatchType) -> Self {
        let (source, destination) = if a.is_outbound() { (a, b) } else { (b, a) };
        Self {
            source,
            destination,
            match_type,
            confidence: match_type.confidence(),
        }
    }
}

/// Limits applied when pairing two events.
#[derive(Debug, Clone, Copy)]
pub struct MatchRules {
    /// Accepted relative difference against the larger amount.
    pub amount_tolerance: f64,
    pub time_window: Duration,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            amount_tolerance: 0.01,
            time_window: Duration::hours(1),
        }
    }
}

fn amounts_within(a: f64, b: f64, tolerance: f64) -> bool {
    let larger = a.max(b);
    if larger <= 0.0 {
        return a == b;
    }
    (a - b).abs() / larger <= tolerance
}

/// First reason the two events cannot be sides of one transfer, if any.
/// Symmetric in `a` and `b`.
pub fn match_rejection(
    a: &BridgeTransaction,
    b: &BridgeTransaction,
    rules: &MatchRules,
) -> Option<&'static str> {
    if a.same_record(b) {
        return Some("same transaction");
    }
    if a.is_matched && b.is_matched {
        return Some("both already matched");
    }
    if a.chain_id == b.chain_id {
        return Some("same chain");
    }
    if !a.event_kind.is_complementary(b.event_kind) {
        return Some("event kinds are not complementary");
    }
    if let (Some(x), Some(y)) = (&a.bridge_id, &b.bridge_id) {
        if !x.eq_ignore_ascii_case(y) {
            return Some("correlation ids differ");
        }
    }
    if !symbols_equivalent(&a.token_symbol, &b.token_symbol) {
        return Some("token symbols differ");
    }
    if !amounts_within(a.amount_value(), b.amount_value(), rules.amount_tolerance) {
        return Some("amounts differ beyond tolerance");
    }
    if (a.timestamp - b.timestamp).abs() > rules.time_window {
        return Some("timestamps too far apart");
    }
    let targets_ok = a.target_chain_id.is_none_or(|t| t == b.chain_id)
        && b.target_chain_id.is_none_or(|t| t == a.chain_id);
    if !targets_ok {
        return Some("declared target chain differs");
    }
    None
}

pub fn is_valid_match(a: &BridgeTransaction, b: &BridgeTransaction, rules: &MatchRules) -> bool {
    match_rejection(a, b, rules).is_none()
}
