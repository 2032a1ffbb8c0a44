use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use shared::protocol::API_PREFIX;
use shared::types::{HistoryEntry, RegistryStats, ServerRecord, ServerView};
use crate::discovery::engine::DiscoveryEngine;
use crate::registry_manager::RegistryHandle;
use crate::view::{hash, ViewPublisher};

const DEFAULT_ACTIVE_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SERVER_HISTORY_LIMIT: u32 = 50;
const DEFAULT_ALL_HISTORY_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub engine: Arc<Mutex<DiscoveryEngine>>,
    pub publisher: ViewPublisher,
    /// Window used for the active count in stats
    pub active_window: Duration,
    /// Ends open event streams so graceful shutdown can complete
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}

impl CommandResponse {
    fn ok(message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                message: message.into(),
                is_favorite: None,
            }),
        )
    }

    fn failed(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                message: message.into(),
                is_favorite: None,
            }),
        )
    }

    fn not_found(id: &str) -> (StatusCode, Json<Self>) {
        Self::failed(StatusCode::NOT_FOUND, format!("Server {} not found", id))
    }
}

type CommandResult = Result<(StatusCode, Json<CommandResponse>), StatusCode>;

#[derive(Deserialize)]
pub struct ActiveQuery {
    pub timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct IpUpdate {
    pub ip: String,
}

#[derive(Deserialize)]
pub struct NotesUpdate {
    pub notes: String,
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/servers", get(get_servers))
        .route("/servers/active", get(get_active))
        .route("/servers/favorites", get(get_favorites))
        .route("/servers/hash", get(get_hash))
        .route("/servers/stream", get(stream_servers))
        .route("/servers/:id", get(get_server).delete(delete_server))
        .route("/servers/:id/ip", put(update_ip))
        .route("/servers/:id/favorite", post(toggle_favorite))
        .route("/servers/:id/notes", put(update_notes))
        .route("/servers/:id/history", get(get_server_history))
        .route("/history", get(get_all_history))
        .route("/discovery/start", post(start_discovery))
        .route("/discovery/stop", post(stop_discovery))
        .route("/stats", get(get_stats));

    Router::new().nest(API_PREFIX, v1).with_state(state)
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    tracing::error!("Registry request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Push the merged view after a command changed the registry
async fn republish(state: &AppState) {
    if let Err(e) = state.publisher.publish().await {
        tracing::error!("Failed to publish view: {}", e);
    }
}

async fn get_servers(State(state): State<AppState>) -> Result<Json<Vec<ServerView>>, StatusCode> {
    state.publisher.current().await.map(Json).map_err(internal_error)
}

async fn get_active(
    State(state): State<AppState>,
    Query(params): Query<ActiveQuery>,
) -> Result<Json<Vec<ServerView>>, StatusCode> {
    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_ACTIVE_TIMEOUT_MS));
    let records = state.registry.get_active(timeout).await.map_err(internal_error)?;
    Ok(Json(state.publisher.merge(records)))
}

async fn get_favorites(State(state): State<AppState>) -> Result<Json<Vec<ServerView>>, StatusCode> {
    let records = state.registry.get_favorites().await.map_err(internal_error)?;
    Ok(Json(state.publisher.merge(records)))
}

async fn get_hash(State(state): State<AppState>) -> Result<String, StatusCode> {
    let view = state.publisher.current().await.map_err(internal_error)?;
    Ok(hash::fingerprint(&view))
}

/// Server-sent events: the current view first, then every push
async fn stream_servers(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = view_stream(&state.publisher, state.shutdown.clone())
        .map(|view| Ok::<_, Infallible>(view_event(&view)));

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Published views until the publisher goes away or `shutdown` fires
fn view_stream(
    publisher: &ViewPublisher,
    shutdown: CancellationToken,
) -> impl Stream<Item = Vec<ServerView>> {
    let mut rx = publisher.subscribe();
    let initial = rx.borrow_and_update().clone();

    let updates = stream::unfold(rx, |mut rx| async move {
        rx.changed().await.ok()?;
        let view = rx.borrow_and_update().clone();
        Some((view, rx))
    });

    stream::once(async move { initial })
        .chain(updates)
        .take_until(shutdown.cancelled_owned())
}

fn view_event(view: &[ServerView]) -> Event {
    match Event::default().event("servers-updated").json_data(view) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!("Failed to encode view event: {}", e);
            Event::default().comment("encoding failed")
        }
    }
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerRecord>, (StatusCode, Json<CommandResponse>)> {
    match state.registry.get_one(id.clone()).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(CommandResponse::not_found(&id)),
        Err(e) => Err(CommandResponse::failed(internal_error(e), "Registry unavailable")),
    }
}

async fn update_ip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<IpUpdate>,
) -> CommandResult {
    let ip = body.ip.trim().to_string();
    if ip.is_empty() {
        return Ok(CommandResponse::failed(StatusCode::BAD_REQUEST, "IP must not be empty"));
    }

    if !state.registry.update_ip(id.clone(), ip.clone()).await.map_err(internal_error)? {
        return Ok(CommandResponse::not_found(&id));
    }

    tracing::info!("Updated server {} IP to {}", id, ip);
    republish(&state).await;
    Ok(CommandResponse::ok("IP updated successfully"))
}

async fn toggle_favorite(State(state): State<AppState>, Path(id): Path<String>) -> CommandResult {
    let Some(is_favorite) = state.registry.toggle_favorite(id.clone()).await.map_err(internal_error)? else {
        return Ok(CommandResponse::not_found(&id));
    };

    republish(&state).await;
    let (status, Json(mut response)) = CommandResponse::ok("Favorite updated");
    response.is_favorite = Some(is_favorite);
    Ok((status, Json(response)))
}

async fn update_notes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NotesUpdate>,
) -> CommandResult {
    if !state.registry.update_notes(id.clone(), body.notes).await.map_err(internal_error)? {
        return Ok(CommandResponse::not_found(&id));
    }

    republish(&state).await;
    Ok(CommandResponse::ok("Notes updated"))
}

async fn delete_server(State(state): State<AppState>, Path(id): Path<String>) -> CommandResult {
    let removed = state.registry.delete(id.clone()).await.map_err(internal_error)?;
    state.engine.lock().await.forget(&id);

    if !removed {
        return Ok(CommandResponse::not_found(&id));
    }

    tracing::info!("Deleted server {}", id);
    republish(&state).await;
    Ok(CommandResponse::ok("Server deleted"))
}

async fn get_server_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<HistoryEntry>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_SERVER_HISTORY_LIMIT);
    state.registry.history_for(id, limit).await.map(Json).map_err(internal_error)
}

async fn get_all_history(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<HistoryEntry>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_ALL_HISTORY_LIMIT);
    state.registry.all_history(limit).await.map(Json).map_err(internal_error)
}

async fn start_discovery(State(state): State<AppState>) -> (StatusCode, Json<CommandResponse>) {
    match state.engine.lock().await.start().await {
        Ok(()) => CommandResponse::ok("Discovery running"),
        Err(e) => {
            tracing::error!("Failed to start discovery: {:#}", e);
            CommandResponse::failed(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

async fn stop_discovery(State(state): State<AppState>) -> (StatusCode, Json<CommandResponse>) {
    let mut engine = state.engine.lock().await;
    if !engine.is_running() {
        return CommandResponse::ok("Discovery not running");
    }
    engine.stop().await;
    CommandResponse::ok("Discovery stopped")
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<RegistryStats>, StatusCode> {
    state.registry.stats(state.active_window).await.map(Json).map_err(internal_error)
}
