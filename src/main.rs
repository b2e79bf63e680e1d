use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bridgewatch_monitor::alerts::{AlertSystem, ChannelDispatcher};
use bridgewatch_monitor::anomaly::engine::AnomalyEngine;
use bridgewatch_monitor::api::{self, AppState};
use bridgewatch_monitor::config::{Config, LogFormat};
use bridgewatch_monitor::feed::LiveFeed;
use bridgewatch_monitor::listener::supervisor::ListenerSupervisor;
use bridgewatch_monitor::matcher::service::TransactionMatcher;
use bridgewatch_monitor::pipeline::IngestPipeline;
use bridgewatch_monitor::retention::RetentionSweeper;
use bridgewatch_monitor::store::{PgStore, Store};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Load configuration before logging so the output format can be chosen
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    // Structured logging (set RUST_LOG to override the level)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }

    tracing::info!(
        networks = config.networks.len(),
        "BridgeWatch monitor starting, configuration loaded from {}",
        config_path
    );

    // Connect to PostgreSQL and run migrations
    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database).await?);
    tracing::info!("Connected to PostgreSQL, migrations complete");

    let listener_token = CancellationToken::new();
    let feed = LiveFeed::new(config.api.feed_capacity);

    // Alert delivery
    let dispatcher = Arc::new(ChannelDispatcher::new(config.channels.clone())?);
    let alerts = Arc::new(AlertSystem::new(
        store.clone(),
        dispatcher,
        feed.clone(),
        config.alerts.clone(),
    ));

    // Anomaly rules
    let engine = Arc::new(AnomalyEngine::new(
        config.anomaly_detection.clone(),
        &config.networks,
        store.clone(),
        alerts.clone(),
        feed.clone(),
    )?);

    // Listeners feed the ingest pipeline through a bounded channel
    let (sink, rx) = mpsc::channel(config.listener.ingest_buffer.max(1));
    let supervisor = Arc::new(ListenerSupervisor::initialize(
        &config.networks,
        config.listener.clone(),
        sink,
        alerts.clone(),
        feed.clone(),
        listener_token.clone(),
    )?);

    let pipeline = Arc::new(IngestPipeline::new(
        &config.networks,
        config.database.failure_alert_threshold,
        store.clone(),
        engine.clone(),
        alerts.clone(),
        feed.clone(),
    ));

    let matcher = Arc::new(TransactionMatcher::new(
        config.matcher.clone(),
        supervisor.networks().into_iter().map(String::from).collect(),
        store.clone(),
        alerts.clone(),
        feed.clone(),
    ));

    let retention = Arc::new(RetentionSweeper::new(config.retention.clone(), store.clone()));

    // One token per stage; shutdown stops them upstream first
    let pipeline_token = CancellationToken::new();
    let engine_token = CancellationToken::new();
    let services_token = CancellationToken::new();
    let alerts_token = CancellationToken::new();

    let alerts_handle = tokio::spawn(alerts.clone().run(alerts_token.clone()));
    let engine_handle = tokio::spawn(engine.clone().run(engine_token.clone()));
    let pipeline_handle = tokio::spawn(pipeline.run(rx, pipeline_token.clone()));
    let mut service_handles = vec![
        tokio::spawn(matcher.clone().run(services_token.clone())),
        tokio::spawn(retention.run(services_token.clone())),
    ];

    supervisor.start().await;
    let supervisor_handle = tokio::spawn(supervisor.clone().run());

    // Spawn API server
    if config.api.enabled {
        let state = Arc::new(AppState {
            store: store.clone(),
            alerts: alerts.clone(),
            engine: engine.clone(),
            matcher: matcher.clone(),
            supervisor: supervisor.clone(),
            feed: feed.clone(),
            started_at: Utc::now(),
        });
        let host = config.api.host.clone();
        let port = config.api.port;
        let api_shutdown = services_token.clone();
        service_handles.push(tokio::spawn(async move {
            if let Err(e) = api::serve(state, &host, port, api_shutdown).await {
                tracing::error!(error = %e, "API server failed");
            }
        }));
    }

    tracing::info!("All services started. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping listeners and services...");

    listener_token.cancel();
    supervisor.stop().await;
    let _ = supervisor_handle.await;

    pipeline_token.cancel();
    let _ = pipeline_handle.await;

    engine_token.cancel();
    let _ = engine_handle.await;

    services_token.cancel();
    for handle in service_handles {
        let _ = handle.await;
    }

    alerts_token.cancel();
    let _ = alerts_handle.await;

    tracing::info!("BridgeWatch monitor stopped gracefully");
    Ok(())
}
