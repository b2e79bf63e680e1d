use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::alerts::system::AlertStats;
use crate::anomaly::types::AnomalyStatus;
use crate::listener::supervisor::ListenerStatusReport;

// ============================================================
// Responses
// ============================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub listeners_active: usize,
    pub listeners_total: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub listeners: ListenerStatusReport,
    pub alerts: AlertStats,
    pub transaction_counts: HashMap<String, i64>,
    pub feed_subscribers: usize,
    pub uptime_secs: i64,
}

/// One page of a list endpoint.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

// ============================================================
// Request bodies
// ============================================================

#[derive(Debug, Default, Deserialize)]
pub struct AcknowledgeRequest {
    pub user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub user: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyStatusRequest {
    pub status: AnomalyStatus,
    pub notes: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualMatchRequest {
    pub source_id: i64,
    pub destination_id: i64,
}
