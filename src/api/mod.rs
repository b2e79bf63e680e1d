pub mod handlers;
pub mod types;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::alerts::system::AlertSystem;
use crate::anomaly::engine::AnomalyEngine;
use crate::feed::LiveFeed;
use crate::listener::supervisor::ListenerSupervisor;
use crate::matcher::service::TransactionMatcher;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub alerts: Arc<AlertSystem>,
    pub engine: Arc<AnomalyEngine>,
    pub matcher: Arc<TransactionMatcher>,
    pub supervisor: Arc<ListenerSupervisor>,
    pub feed: LiveFeed,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/transactions", get(handlers::list_transactions))
        .route("/api/v1/transactions/match", post(handlers::manual_match))
        .route("/api/v1/anomalies", get(handlers::list_anomalies))
        .route(
            "/api/v1/anomalies/{id}/status",
            post(handlers::update_anomaly_status),
        )
        .route("/api/v1/alerts", get(handlers::list_alerts))
        .route(
            "/api/v1/alerts/{id}/acknowledge",
            post(handlers::acknowledge_alert),
        )
        .route("/api/v1/alerts/{id}/resolve", post(handlers::resolve_alert))
        .route("/api/v1/ws", get(ws::feed_socket))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::anomaly::blacklist::Blacklist;
    use crate::config::{AnomalyDetectionConfig, ListenerConfig, MatcherConfig};
    use crate::store::memory::MemoryStore;
    use crate::test_utils::alert_system;
    use tokio::sync::mpsc;

    /// Full application state over an in-memory store, with no listeners.
    pub(crate) fn test_state() -> (Arc<AppState>, Arc<MemoryStore>) {
        let (alerts, store) = alert_system();
        let feed = LiveFeed::new(64);
        let engine = AnomalyEngine::with_blacklist(
            AnomalyDetectionConfig::default(),
            &[],
            Blacklist::default(),
            store.clone(),
            alerts.clone(),
            feed.clone(),
        );
        let matcher = TransactionMatcher::new(
            MatcherConfig::default(),
            vec!["ethereum".into(), "polygon".into()],
            store.clone(),
            alerts.clone(),
            feed.clone(),
        );
        let (sink, _rx) = mpsc::channel(1);
        let supervisor = ListenerSupervisor::initialize(
            &[],
            ListenerConfig::default(),
            sink,
            alerts.clone(),
            feed.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        let state = AppState {
            store: store.clone(),
            alerts,
            engine: Arc::new(engine),
            matcher: Arc::new(matcher),
            supervisor: Arc::new(supervisor),
            feed,
            started_at: Utc::now(),
        };
        (Arc::new(state), store)
    }

    #[test]
    fn test_router_builds() {
        let (state, _) = test_state();
        let _ = router(state);
    }
}
