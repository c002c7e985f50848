use crate::broker::Transport;
use crate::model::{
    CommandRow, DeviceState, NewCommand, StatusResponse, StoredSample, TelemetryResponse,
};
use crate::store::{CommandStore, TelemetryStore};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_LIMIT: usize = 30;
const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub telemetry: Arc<dyn TelemetryStore>,
    pub commands: Arc<dyn CommandStore>,
    pub transport: Arc<dyn Transport>,
    pub staleness_threshold_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    limit: Option<usize>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/telemetry", get(get_telemetry))
        .route("/api/v1/telemetry/latest", get(get_latest))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/commands", post(post_command))
        .with_state(state)
}

async fn get_telemetry(
    State(state): State<AppState>,
    Query(params): Query<TelemetryQuery>,
) -> Result<Json<TelemetryResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let data: Vec<StoredSample> = state.telemetry.recent_samples(limit).await?;

    Ok(Json(TelemetryResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn get_latest(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.telemetry.latest_sample().await? {
        Some(sample) => Ok(Json(sample).into_response()),
        None => Ok((StatusCode::NOT_FOUND, "No telemetry recorded yet").into_response()),
    }
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let latest = state.telemetry.latest_sample().await?;
    let now = Utc::now();

    Ok(Json(StatusResponse {
        online: latest
            .as_ref()
            .is_some_and(|s| s.is_online(now, state.staleness_threshold_ms)),
        last_seen: latest.as_ref().map(|s| s.created_at),
        age_ms: latest.as_ref().map(|s| s.age_ms(now)),
        staleness_threshold_ms: state.staleness_threshold_ms,
        broker: state.transport.state().to_string(),
        device: latest.as_ref().map(|s| DeviceState::from(&s.sample)),
    }))
}

async fn post_command(
    State(state): State<AppState>,
    Json(command): Json<NewCommand>,
) -> Result<(StatusCode, Json<CommandRow>), AppError> {
    let row = state.commands.insert_command(&command.command_type).await?;
    info!("Command {} queued: {:?}", row.id, command.command_type);
    Ok((StatusCode::CREATED, Json(row)))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectionState, MemoryTransport};
    use crate::feed::FeedEvent;
    use crate::model::{LedColor, RainStatus, TelemetrySample};
    use crate::store::InMemoryStore;
    use axum::body::{self, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn app(store: Arc<InMemoryStore>, transport: Arc<MemoryTransport>) -> Router {
        create_router(AppState {
            telemetry: store.clone(),
            commands: store,
            transport,
            staleness_threshold_ms: 15_000,
        })
    }

    fn sample(river_level: f64) -> TelemetrySample {
        TelemetrySample {
            river_level,
            tank1_level: 300.0,
            tank2_level: 200.0,
            rain_status: RainStatus::Raining,
            status: "FLOOD WARNING - PUMPING OUT".to_string(),
            buzzer_state: true,
            led_color: LedColor::Red,
            flow_rate1: 12.5,
            flow_rate2: 8.0,
            valve1_state: 1.0,
            valve2_state: 0.0,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(router: Router, uri: &str) -> (StatusCode, Option<T>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).ok())
    }

    #[tokio::test]
    async fn test_latest_is_404_when_empty() {
        let router = app(Arc::new(InMemoryStore::new()), Arc::new(MemoryTransport::default()));
        let (status, _) = get_json::<StoredSample>(router, "/api/v1/telemetry/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_telemetry_window_is_newest_first() {
        let store = Arc::new(InMemoryStore::new());
        for level in 1..=31 {
            store.append_sample(&sample(level as f64)).await.unwrap();
        }
        let router = app(store, Arc::new(MemoryTransport::default()));

        let (status, body) = get_json::<TelemetryResponse>(router.clone(), "/api/v1/telemetry").await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        assert_eq!(body.total, 30);
        assert_eq!(body.data.first().unwrap().sample.river_level, 31.0);
        assert_eq!(body.data.last().unwrap().sample.river_level, 2.0);

        let (_, body) = get_json::<TelemetryResponse>(router, "/api/v1/telemetry?limit=5000").await;
        assert_eq!(body.unwrap().limit, 1000);
    }

    #[tokio::test]
    async fn test_status_reports_online_device() {
        let store = Arc::new(InMemoryStore::new());
        store.append_sample(&sample(450.0)).await.unwrap();
        let transport = Arc::new(MemoryTransport::default());
        transport.set_state(ConnectionState::Disconnected);
        let router = app(store, transport);

        let (status, body) = get_json::<StatusResponse>(router, "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        assert!(body.online);
        assert_eq!(body.broker, "DISCONNECTED");
        let device = body.device.unwrap();
        assert!(device.critical);
        assert!(device.pump_active);
        assert!(device.valve1_open);
        assert!(!device.valve2_open);
    }

    #[tokio::test]
    async fn test_status_offline_without_telemetry() {
        let router = app(Arc::new(InMemoryStore::new()), Arc::new(MemoryTransport::default()));
        let (_, body) = get_json::<StatusResponse>(router, "/api/v1/status").await;
        let body = body.unwrap();
        assert!(!body.online);
        assert!(body.last_seen.is_none());
        assert!(body.device.is_none());
    }

    #[tokio::test]
    async fn test_post_command_queues_row() {
        let store = Arc::new(InMemoryStore::new());
        let mut events = store.command_events(4).await;
        let router = app(store.clone(), Arc::new(MemoryTransport::default()));

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"command_type":"PUMP_ON"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let commands = store.commands().await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command_type.as_deref(), Some("PUMP_ON"));
        assert!(matches!(events.recv().await, Some(FeedEvent::Inserted(_))));
    }
}
