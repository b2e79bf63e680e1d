use alloy::primitives::Address;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use std::str::FromStr;

use super::blacklist::Blacklist;
use super::types::{AnomalyType, Finding, Severity};
use crate::config::{SuspiciousContractConfig, UnusualVolumeConfig, ValueMismatchConfig};
use crate::error::Result;
use crate::listener::types::BridgeTransaction;
use crate::store::Store;

fn finding(
    anomaly_type: AnomalyType,
    severity: Severity,
    title: impl Into<String>,
    description: impl Into<String>,
    data: serde_json::Value,
) -> Finding {
    Finding {
        anomaly_type,
        severity,
        title: title.into(),
        description: description.into(),
        confidence: 1.0,
        data,
        related_transaction_ids: Vec::new(),
    }
}

fn is_zero_address(value: &str) -> bool {
    Address::from_str(value).map_or(true, |a| a == Address::ZERO)
}

/// Relative difference against the mean of both amounts.
pub fn discrepancy(a: f64, b: f64) -> Option<f64> {
    let mean = (a + b) / 2.0;
    (mean > 0.0).then(|| (a - b).abs() / mean)
}

/// Outbound transfer still unmatched after `window`.
pub fn check_bridge_timeout(
    tx: &BridgeTransaction,
    window: Duration,
    now: DateTime<Utc>,
) -> Option<Finding> {
    if !tx.is_outbound() || tx.is_matched {
        return None;
    }
    let age = tx.age(now);
    if age <= window {
        return None;
    }

    Some(finding(
        AnomalyType::BridgeTimeout,
        Severity::High,
        format!("Bridge transfer on {} has no counterpart", tx.network),
        format!(
            "{} of {} {} has been pending for {} minutes without a matching release",
            tx.event_kind, tx.amount, tx.token_symbol, age.num_minutes()
        ),
        serde_json::json!({
            "tx_hash": tx.tx_hash,
            "age_secs": age.num_seconds(),
            "window_secs": window.num_seconds(),
            "bridge_id": tx.bridge_id,
        }),
    ))
}

/// Locate the other side of a transfer: the linked partner, else the
/// complementary event carrying the same correlation id on another network.
pub async fn find_counterpart(
    store: &dyn Store,
    tx: &BridgeTransaction,
) -> Result<Option<BridgeTransaction>> {
    if let Some(partner_id) = tx.matched_transaction_id {
        if let Some(partner) = store.get_transaction(partner_id).await? {
            return Ok(Some(partner));
        }
    }
    let Some(bridge_id) = tx.bridge_id.as_deref() else {
        return Ok(None);
    };
    Ok(store
        .transactions_by_bridge_id(bridge_id)
        .await?
        .into_iter()
        .find(|other| {
            other.network != tx.network
                && tx.event_kind.is_complementary(other.event_kind)
                && !other.same_record(tx)
        }))
}

pub async fn check_value_mismatch(
    store: &dyn Store,
    tx: &BridgeTransaction,
    config: &ValueMismatchConfig,
) -> Result<Option<Finding>> {
    let Some(counterpart) = find_counterpart(store, tx).await? else {
        return Ok(None);
    };

    let (ours, theirs) = (tx.amount_value(), counterpart.amount_value());
    let Some(diff) = discrepancy(ours, theirs) else {
        return Ok(None);
    };
    if diff <= config.tolerance {
        return Ok(None);
    }

    let severity = if diff > config.critical_threshold {
        Severity::Critical
    } else {
        Severity::High
    };

    let mut f = finding(
        AnomalyType::ValueMismatch,
        severity,
        format!("Value mismatch between {} and {}", tx.network, counterpart.network),
        format!(
            "{} {} on {} vs {} {} on {} ({:.2}% discrepancy)",
            tx.amount,
            tx.token_symbol,
            tx.network,
            counterpart.amount,
            counterpart.token_symbol,
            counterpart.network,
            diff * 100.0
        ),
        serde_json::json!({
            "amount": tx.amount,
            "counterpart_amount": counterpart.amount,
            "counterpart_network": counterpart.network,
            "counterpart_tx_hash": counterpart.tx_hash,
            "discrepancy": diff,
            "tolerance": config.tolerance,
        }),
    );
    f.related_transaction_ids = counterpart.id.into_iter().collect();
    Ok(Some(f))
}

/// Same correlation id and raw amount seen twice on one network.
pub async fn check_duplicate(
    store: &dyn Store,
    tx: &BridgeTransaction,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<Option<Finding>> {
    let Some(bridge_id) = tx.bridge_id.as_deref() else {
        return Ok(None);
    };
    let others: Vec<BridgeTransaction> = store
        .duplicate_candidates(&tx.network, bridge_id, &tx.amount_raw, now - window)
        .await?
        .into_iter()
        .filter(|other| !other.same_record(tx))
        .collect();
    if others.is_empty() {
        return Ok(None);
    }

    let mut f = finding(
        AnomalyType::DuplicateTransaction,
        Severity::High,
        format!("Duplicate bridge transfer on {}", tx.network),
        format!(
            "Correlation id {} with amount {} {} appears {} times",
            bridge_id,
            tx.amount,
            tx.token_symbol,
            others.len() + 1
        ),
        serde_json::json!({
            "bridge_id": bridge_id,
            "duplicates": others.iter().map(|o| &o.tx_hash).collect::<Vec<_>>(),
        }),
    );
    f.related_transaction_ids = others.iter().filter_map(|o| o.id).collect();
    Ok(Some(f))
}

/// Blacklisted participants first, then sender burst activity.
pub async fn check_suspicious_contract(
    store: &dyn Store,
    tx: &BridgeTransaction,
    blacklist: &Blacklist,
    config: &SuspiciousContractConfig,
    now: DateTime<Utc>,
) -> Result<Option<Finding>> {
    let roles = [
        ("sender", &tx.from_address),
        ("recipient", &tx.to_address),
        ("token", &tx.token_address),
        ("bridge_contract", &tx.bridge_contract),
    ];
    let flagged: Vec<serde_json::Value> = roles
        .iter()
        .filter(|(_, address)| blacklist.contains(address))
        .map(|(role, address)| {
            serde_json::json!({
                "role": role,
                "address": address,
                "label": blacklist.label(address),
            })
        })
        .collect();

    if !flagged.is_empty() {
        return Ok(Some(finding(
            AnomalyType::SuspiciousContract,
            Severity::Critical,
            format!("Blacklisted address in bridge transfer on {}", tx.network),
            format!("{} blacklisted participant(s) in {}", flagged.len(), tx.tx_hash),
            serde_json::json!({ "flagged": flagged }),
        )));
    }

    let window = Duration::seconds(config.sender_window_secs as i64);
    let count = store
        .sender_activity(&tx.network, &tx.from_address, now - window)
        .await?;
    if count <= config.max_sender_transactions as i64 {
        return Ok(None);
    }

    let mut f = finding(
        AnomalyType::SuspiciousContract,
        Severity::Medium,
        format!("High-frequency sender on {}", tx.network),
        format!(
            "{} sent {} bridge transfers in {} seconds",
            tx.from_address, count, config.sender_window_secs
        ),
        serde_json::json!({
            "sender": tx.from_address,
            "transaction_count": count,
            "window_secs": config.sender_window_secs,
            "max_allowed": config.max_sender_transactions,
        }),
    );
    f.confidence = 0.6;
    Ok(Some(f))
}

pub async fn check_unusual_volume(
    store: &dyn Store,
    tx: &BridgeTransaction,
    config: &UnusualVolumeConfig,
    now: DateTime<Utc>,
) -> Result<Option<Finding>> {
    let since = now - Duration::seconds(config.window_secs as i64);
    let stats = store
        .volume_stats(&tx.network, &tx.token_address, since, tx.id)
        .await?;
    if stats.samples < config.min_samples || stats.average <= 0.0 {
        return Ok(None);
    }

    let amount = tx.amount_value();
    let ratio = amount / stats.average;
    if ratio <= config.multiplier {
        return Ok(None);
    }

    let severity = if ratio > config.critical_multiplier {
        Severity::Critical
    } else {
        Severity::High
    };

    let mut f = finding(
        AnomalyType::UnusualVolume,
        severity,
        format!("Unusual {} volume on {}", tx.token_symbol, tx.network),
        format!(
            "{} {} is {:.1}x the trailing average of {:.2}",
            tx.amount, tx.token_symbol, ratio, stats.average
        ),
        serde_json::json!({
            "amount": amount,
            "average": stats.average,
            "samples": stats.samples,
            "ratio": ratio,
        }),
    );
    f.confidence = 0.8;
    Ok(Some(f))
}

pub fn check_failed_verification(tx: &BridgeTransaction) -> Option<Finding> {
    let mut reasons = Vec::new();
    if tx.bridge_id.is_none() {
        reasons.push("missing correlation id");
    }
    if tx.amount_raw == BigDecimal::from(0u8) {
        reasons.push("zero amount");
    }
    if is_zero_address(&tx.token_address) {
        reasons.push("zero token address");
    }
    if reasons.is_empty() {
        return None;
    }

    Some(finding(
        AnomalyType::FailedVerification,
        Severity::High,
        format!("Bridge event failed verification on {}", tx.network),
        format!("{}: {}", tx.tx_hash, reasons.join(", ")),
        serde_json::json!({ "reasons": reasons }),
    ))
}

/// Same correlation id emitted in the same direction on more than one network.
pub async fn check_replay_attack(
    store: &dyn Store,
    tx: &BridgeTransaction,
) -> Result<Option<Finding>> {
    let Some(bridge_id) = tx.bridge_id.as_deref() else {
        return Ok(None);
    };
    let replays: Vec<BridgeTransaction> = store
        .transactions_by_bridge_id(bridge_id)
        .await?
        .into_iter()
        .filter(|other| other.network != tx.network && other.is_outbound() == tx.is_outbound())
        .collect();
    if replays.is_empty() {
        return Ok(None);
    }

    let mut networks: Vec<&str> = replays.iter().map(|r| r.network.as_str()).collect();
    networks.push(&tx.network);
    networks.sort_unstable();
    networks.dedup();

    let mut f = finding(
        AnomalyType::ReplayAttack,
        Severity::Critical,
        "Possible replay of bridge message",
        format!(
            "Correlation id {} emitted as {} on {} networks: {}",
            bridge_id,
            if tx.is_outbound() { "outbound" } else { "inbound" },
            networks.len(),
            networks.join(", ")
        ),
        serde_json::json!({
            "bridge_id": bridge_id,
            "networks": networks,
        }),
    );
    f.related_transaction_ids = replays.iter().filter_map(|r| r.id).collect();
    Ok(Some(f))
}

pub fn check_gas_anomaly(
    tx: &BridgeTransaction,
    max_gas_used: u64,
    max_gas_price_gwei: f64,
) -> Option<Finding> {
    let gas_used = tx.gas_used.filter(|g| *g as u64 > max_gas_used);
    let gas_price = tx.gas_price_gwei().filter(|p| *p > max_gas_price_gwei);
    if gas_used.is_none() && gas_price.is_none() {
        return None;
    }

    let mut parts = Vec::new();
    if let Some(g) = gas_used {
        parts.push(format!("gas used {} > {}", g, max_gas_used));
    }
    if let Some(p) = gas_price {
        parts.push(format!("gas price {:.1} gwei > {:.1}", p, max_gas_price_gwei));
    }

    let mut f = finding(
        AnomalyType::GasAnomaly,
        Severity::Medium,
        format!("Abnormal gas on {}", tx.network),
        format!("{}: {}", tx.tx_hash, parts.join("; ")),
        serde_json::json!({
            "gas_used": tx.gas_used,
            "gas_price_gwei": tx.gas_price_gwei(),
            "max_gas_used": max_gas_used,
            "max_gas_price_gwei": max_gas_price_gwei,
        }),
    );
    f.confidence = 0.7;
    Some(f)
}
