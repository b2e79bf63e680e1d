use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use super::AppState;
use crate::feed::{DashboardData, FeedFilter, FeedRequest, FeedResponse};
use crate::store::{AlertQuery, AnomalyQuery};

const DASHBOARD_ITEMS: i64 = 20;

pub async fn feed_socket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| accept_connection(state, socket))
}

/// One live-feed client: forwards matching events and answers inbound requests.
async fn accept_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();
    let mut events = state.feed.subscribe();
    let mut filter = FeedFilter::default();
    tracing::debug!(subscribers = state.feed.subscriber_count(), "Live-feed client connected");

    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let response = handle_text(&state, text.as_str(), &mut filter).await;
                    let Ok(value) = serde_json::to_string(&response) else { continue };
                    if tx.send(Message::Text(value.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Live-feed socket error");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if !filter.matches(&event) {
                        continue;
                    }
                    let value = match serde_json::to_string(&event) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(kind = event.kind(), error = %e, "Failed to serialize feed event");
                            continue;
                        }
                    };
                    if tx.send(Message::Text(value.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Live-feed client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Live-feed client disconnected");
}

/// Parse and answer one inbound message. `subscribe` replaces the client's filter.
pub async fn handle_text(state: &AppState, text: &str, filter: &mut FeedFilter) -> FeedResponse {
    match serde_json::from_str::<FeedRequest>(text) {
        Ok(FeedRequest::Subscribe { filter: next }) => {
            *filter = next.clone();
            FeedResponse::Subscribed(next)
        }
        Ok(request) => handle_request(state, request).await,
        Err(e) => {
            tracing::warn!(error = %e, "Got invalid live-feed payload");
            FeedResponse::Error(e.to_string())
        }
    }
}

pub async fn handle_request(state: &AppState, request: FeedRequest) -> FeedResponse {
    let outcome = match request {
        FeedRequest::Subscribe { filter } => Ok(FeedResponse::Subscribed(filter)),
        FeedRequest::AcknowledgeAlert { alert_id, user } => state
            .alerts
            .acknowledge(alert_id, user)
            .await
            .map(FeedResponse::AlertAcknowledged),
        FeedRequest::ResolveAlert {
            alert_id,
            user,
            notes,
        } => state
            .alerts
            .resolve(alert_id, user, notes)
            .await
            .map(FeedResponse::AlertResolved),
        FeedRequest::RequestDashboardData => dashboard_data(state)
            .await
            .map(|d| FeedResponse::DashboardData(Box::new(d))),
    };
    outcome.unwrap_or_else(|e| FeedResponse::Error(e.to_string()))
}

async fn dashboard_data(state: &AppState) -> crate::error::Result<DashboardData> {
    let alerts = AlertQuery {
        limit: Some(DASHBOARD_ITEMS),
        ..AlertQuery::default()
    };
    let anomalies = AnomalyQuery {
        limit: Some(DASHBOARD_ITEMS),
        ..AnomalyQuery::default()
    };
    let (recent_alerts, _) = state.store.list_alerts(&alerts).await?;
    let (recent_anomalies, _) = state.store.list_anomalies(&anomalies).await?;

    Ok(DashboardData {
        recent_alerts,
        recent_anomalies,
        listener_status: state.supervisor.status().await,
        alert_stats: state.alerts.stats().await,
        transaction_counts: state.store.transaction_counts().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::{AlertRequest, AlertSeverity, AlertStatus, AlertType};
    use crate::api::tests::test_state;
    use crate::listener::types::EventKind;
    use crate::store::Store;
    use crate::test_utils::sample_tx;

    #[tokio::test]
    async fn test_subscribe_sets_filter() {
        let (state, _) = test_state();
        let mut filter = FeedFilter::default();
        let resp = handle_text(
            &state,
            r#"{"type": "subscribe", "networks": ["polygon"], "types": ["alert"]}"#,
            &mut filter,
        )
        .await;

        assert!(matches!(resp, FeedResponse::Subscribed(_)));
        assert_eq!(filter.networks, vec!["polygon"]);
        assert_eq!(filter.types, vec!["alert"]);
        assert!(filter.severities.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_error_response() {
        let (state, _) = test_state();
        let mut filter = FeedFilter::default();
        let resp = handle_text(&state, r#"{"type": "launch_missiles"}"#, &mut filter).await;
        assert!(matches!(resp, FeedResponse::Error(_)));

        let resp = handle_text(&state, r#"{"type": "acknowledge_alert", "alert_id": 77}"#, &mut filter).await;
        match resp {
            FeedResponse::Error(msg) => assert!(msg.contains("not found")),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acknowledge_over_feed() {
        let (state, _) = test_state();
        let alert = state
            .alerts
            .send_alert(AlertRequest::new(AlertType::Manual, AlertSeverity::Warning, "t", "m"))
            .await
            .unwrap()
            .unwrap();
        let mut filter = FeedFilter::default();
        let text = format!(r#"{{"type": "acknowledge_alert", "alert_id": {}, "user": "alice"}}"#, alert.id.unwrap());

        match handle_text(&state, &text, &mut filter).await {
            FeedResponse::AlertAcknowledged(acked) => {
                assert_eq!(acked.status, AlertStatus::Acknowledged);
                assert_eq!(acked.acknowledged_by.as_deref(), Some("alice"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dashboard_data() {
        let (state, store) = test_state();
        store
            .insert_transaction(&sample_tx("ethereum", 1, EventKind::Lock, "1", None))
            .await
            .unwrap();
        state
            .alerts
            .send_alert(AlertRequest::new(AlertType::Manual, AlertSeverity::Info, "t", "m"))
            .await
            .unwrap();

        match handle_request(&state, FeedRequest::RequestDashboardData).await {
            FeedResponse::DashboardData(data) => {
                assert_eq!(data.recent_alerts.len(), 1);
                assert_eq!(data.transaction_counts.get("pending"), Some(&1));
                assert_eq!(data.alert_stats.created, 1);
                assert_eq!(data.listener_status.total, 0);
            }
            other => panic!("unexpected response {:?}", other),
        }

        let json = serde_json::to_value(FeedResponse::Error("boom".into())).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"], "boom");
    }
}
