use axum::{routing::get, Router};
use bridge::broker::{Backoff, Transport};
use bridge::config::Config;
use bridge::db::{self, PgStore};
use bridge::feed;
use bridge::ingest::{self, IngestConfig};
use bridge::metrics;
use bridge::mqtt;
use bridge::relay::{CommandRelay, RelayConfig};
use bridge::rest::{self, AppState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting flood bridge");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!(
        "Telemetry topic: {}, command topic: {}",
        config.telemetry_topic, config.command_topic
    );
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());
    if !config.notify_channel_matches_trigger() {
        warn!(
            "COMMAND_NOTIFY_CHANNEL={} but the command_queue trigger notifies {}; no commands will be relayed",
            config.command_notify_channel,
            feed::TRIGGER_NOTIFY_CHANNEL
        );
    }

    metrics::init_metrics();

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };
    let store = Arc::new(PgStore::new(pool.clone(), config.store_timeout));

    let client_id = format!("flood-bridge-{}", uuid::Uuid::new_v4());
    let transport: Arc<dyn Transport> = Arc::new(mqtt::connect_with_retry(&config, client_id).await);

    let telemetry_rx = match transport.subscribe(&config.telemetry_topic).await {
        Ok(rx) => rx,
        Err(e) => {
            error!("Failed to subscribe to {}: {}", config.telemetry_topic, e);
            std::process::exit(1);
        }
    };

    let ingest_handle = tokio::spawn(ingest::run_ingest(
        telemetry_rx,
        store.clone(),
        IngestConfig::from(&config),
    ));

    let (feed_tx, feed_rx) = mpsc::channel(config.channel_capacity);
    let feed_handle = tokio::spawn(feed::run_command_feed(
        pool,
        config.command_notify_channel.clone(),
        store.clone(),
        feed_tx,
        Backoff::new(config.reconnect_backoff_initial, config.reconnect_backoff_max),
    ));

    let relay = CommandRelay::new(transport.clone(), store.clone(), RelayConfig::from(&config));
    let relay_handle = tokio::spawn(relay.run(feed_rx));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .merge(rest::create_router(AppState {
            telemetry: store.clone(),
            commands: store,
            transport: transport.clone(),
            staleness_threshold_ms: config.staleness_threshold_ms,
        }));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = ingest_handle => {
            error!("Ingest pipeline terminated");
        }
        _ = feed_handle => {
            error!("Command feed terminated");
        }
        _ = relay_handle => {
            error!("Command relay terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
