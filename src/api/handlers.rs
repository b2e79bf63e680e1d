use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::types::*;
use super::AppState;
use crate::alerts::types::Alert;
use crate::anomaly::types::Anomaly;
use crate::error::MonitorError;
use crate::listener::types::BridgeTransaction;
use crate::matcher::matching::MatchedPair;
use crate::store::{page, AlertQuery, AnomalyQuery, TransactionQuery};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
        }),
    )
}

fn monitor_error(e: MonitorError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        MonitorError::NotFound { .. } => StatusCode::NOT_FOUND,
        MonitorError::Validation(_) | MonitorError::Decode(_) => StatusCode::BAD_REQUEST,
        MonitorError::InvalidTransition { .. } | MonitorError::Duplicate(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "API request failed");
    }
    api_error(status, e.to_string())
}

/// Operator bodies are optional; an empty body means all defaults.
fn optional_body<T: DeserializeOwned + Default>(
    body: &Bytes,
) -> Result<T, (StatusCode, Json<ErrorResponse>)> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e)))
}

// ============================================================
// Health & Status
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let database = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check: store unreachable");
            false
        }
    };
    let listeners = state.supervisor.status().await;
    let status = if database && listeners.healthy() {
        "healthy"
    } else {
        "degraded"
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        database,
        listeners_active: listeners.active,
        listeners_total: listeners.total,
        timestamp: Utc::now(),
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    let transaction_counts = state
        .store
        .transaction_counts()
        .await
        .map_err(monitor_error)?;

    Ok(Json(StatusResponse {
        listeners: state.supervisor.status().await,
        alerts: state.alerts.stats().await,
        transaction_counts,
        feed_subscribers: state.feed.subscriber_count(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    }))
}

// ============================================================
// Transactions
// ============================================================

pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TransactionQuery>,
) -> ApiResult<Page<BridgeTransaction>> {
    let (limit, offset) = page(params.limit, params.offset);
    let (items, total) = state
        .store
        .list_transactions(&params)
        .await
        .map_err(monitor_error)?;
    Ok(Json(Page { items, total, limit, offset }))
}

pub async fn manual_match(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ManualMatchRequest>,
) -> ApiResult<MatchedPair> {
    state
        .matcher
        .manual_match(body.source_id, body.destination_id)
        .await
        .map(Json)
        .map_err(monitor_error)
}

// ============================================================
// Anomalies
// ============================================================

pub async fn list_anomalies(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnomalyQuery>,
) -> ApiResult<Page<Anomaly>> {
    let (limit, offset) = page(params.limit, params.offset);
    let (items, total) = state
        .store
        .list_anomalies(&params)
        .await
        .map_err(monitor_error)?;
    Ok(Json(Page { items, total, limit, offset }))
}

pub async fn update_anomaly_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AnomalyStatusRequest>,
) -> ApiResult<Anomaly> {
    state
        .engine
        .update_status(id, body.status, body.notes, body.user)
        .await
        .map(Json)
        .map_err(monitor_error)
}

// ============================================================
// Alerts
// ============================================================

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertQuery>,
) -> ApiResult<Page<Alert>> {
    let (limit, offset) = page(params.limit, params.offset);
    let (items, total) = state
        .store
        .list_alerts(&params)
        .await
        .map_err(monitor_error)?;
    Ok(Json(Page { items, total, limit, offset }))
}

pub async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<Alert> {
    let body: AcknowledgeRequest = optional_body(&body)?;
    state
        .alerts
        .acknowledge(id, body.user)
        .await
        .map(Json)
        .map_err(monitor_error)
}

pub async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<Alert> {
    let body: ResolveRequest = optional_body(&body)?;
    state
        .alerts
        .resolve(id, body.user, body.notes)
        .await
        .map(Json)
        .map_err(monitor_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::{AlertRequest, AlertSeverity, AlertStatus, AlertType};
    use crate::anomaly::types::AnomalyStatus;
    use crate::api::tests::test_state;
    use crate::listener::types::{EventKind, TxStatus};
    use crate::store::Store;
    use crate::test_utils::sample_tx;

    #[tokio::test]
    async fn test_health_reports_degraded_without_listeners() {
        let (state, store) = test_state();
        let Json(resp) = health(State(state.clone())).await.unwrap();
        assert!(resp.database);
        assert_eq!(resp.status, "degraded");

        store.set_unavailable(true);
        let Json(resp) = health(State(state)).await.unwrap();
        assert!(!resp.database);
    }

    #[tokio::test]
    async fn test_list_transactions_pages() {
        let (state, store) = test_state();
        for _ in 0..3 {
            store
                .insert_transaction(&sample_tx("ethereum", 1, EventKind::Lock, "1", None))
                .await
                .unwrap();
        }
        let query = TransactionQuery {
            network: Some("ethereum".into()),
            status: Some(TxStatus::Pending),
            limit: Some(2),
            offset: None,
        };
        let Json(page) = list_transactions(State(state), Query(query)).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 3);
        assert_eq!(page.limit, 2);
    }

    #[tokio::test]
    async fn test_acknowledge_and_resolve_alert() {
        let (state, _) = test_state();
        let alert = state
            .alerts
            .send_alert(AlertRequest::new(AlertType::Manual, AlertSeverity::High, "t", "m"))
            .await
            .unwrap()
            .unwrap();
        let id = alert.id.unwrap();

        let Json(acked) = acknowledge_alert(
            State(state.clone()),
            Path(id),
            Bytes::from_static(br#"{"user": "ops"}"#),
        )
        .await
        .unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("ops"));

        let Json(resolved) = resolve_alert(State(state.clone()), Path(id), Bytes::new()).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);

        let (status, _) = acknowledge_alert(State(state), Path(id), Bytes::new()).await.unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (state, _) = test_state();
        let (status, _) = resolve_alert(State(state), Path(1), Bytes::from_static(b"{not json"))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_404() {
        let (state, _) = test_state();
        let (status, _) = resolve_alert(State(state.clone()), Path(42), Bytes::new()).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = AnomalyStatusRequest {
            status: AnomalyStatus::Resolved,
            notes: None,
            user: None,
        };
        let (status, _) = update_anomaly_status(State(state.clone()), Path(42), Json(body))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = ManualMatchRequest { source_id: 1, destination_id: 2 };
        let (status, _) = manual_match(State(state), Json(body)).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_manual_match_endpoint() {
        let (state, store) = test_state();
        let lock = store
            .insert_transaction(&sample_tx("ethereum", 1, EventKind::Lock, "10", None))
            .await
            .unwrap()
            .unwrap();
        let unlock = store
            .insert_transaction(&sample_tx("polygon", 137, EventKind::Unlock, "10", None))
            .await
            .unwrap()
            .unwrap();

        let body = ManualMatchRequest {
            source_id: lock.id.unwrap(),
            destination_id: unlock.id.unwrap(),
        };
        let Json(pair) = manual_match(State(state), Json(body)).await.unwrap();
        assert_eq!(pair.destination.id, unlock.id);
        assert_eq!(pair.source.status, TxStatus::Completed);
    }
}
