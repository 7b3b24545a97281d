use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use server_api::{
    decrement_count, increment_count, parse_amount, read_count, reset_count, ApiContext,
};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{CountResponse, ServerEvent},
};
use storage::{CounterStore, MemoryStore, Storage};
use tokio::sync::{broadcast, Mutex};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url, Settings, StoreBackend};

struct AppState {
    api: ApiContext,
    events: broadcast::Sender<ServerEvent>,
    /// Held across a mutation and its broadcast so events leave in commit order.
    commit: Mutex<()>,
}

impl AppState {
    fn new(api: ApiContext, events: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            api,
            events,
            commit: Mutex::new(()),
        }
    }
}

const MAX_REQUEST_BYTES: usize = 4 * 1024;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let api = open_store(&settings).await?;
    let (events, _) = broadcast::channel(settings.event_capacity());

    let state = AppState::new(api, events);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server_bind))?;
    info!(%addr, backend = ?settings.store_backend, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn open_store(settings: &Settings) -> anyhow::Result<ApiContext> {
    match settings.store_backend {
        StoreBackend::Memory => Ok(ApiContext::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let database_url = prepare_database_url(&settings.database_url)?;
            let storage = Storage::with_timeout(&database_url, settings.store_timeout())
                .await
                .map_err(|error| {
                    error!(
                        %database_url,
                        %error,
                        "failed to open SQLite database; verify parent directory exists and permissions are correct"
                    );
                    error
                })?;
            Ok(ApiContext::new(storage))
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/count", get(http_read_count))
        .route("/api/count/increment", post(http_increment))
        .route("/api/count/decrement", post(http_decrement))
        .route("/api/count/reset", post(http_reset))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidAmount => StatusCode::BAD_REQUEST,
        ErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

fn publish(state: &AppState, count: u64) {
    // No subscribers is not an error.
    if state.events.send(ServerEvent::count_changed(count)).is_err() {
        debug!(count, "no event subscribers");
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.store.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn http_read_count(State(state): State<Arc<AppState>>) -> HttpResult<Json<CountResponse>> {
    let response = read_count(&state.api).await.map_err(reject)?;
    Ok(Json(response))
}

async fn http_increment(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> HttpResult<Json<CountResponse>> {
    let amount = parse_amount(&body).map_err(reject)?;
    let _commit = state.commit.lock().await;
    let response = increment_count(&state.api, amount)
        .await
        .map_err(reject)?;
    publish(&state, response.count);
    Ok(Json(response))
}

async fn http_decrement(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> HttpResult<Json<CountResponse>> {
    let amount = parse_amount(&body).map_err(reject)?;
    let _commit = state.commit.lock().await;
    let response = decrement_count(&state.api, amount)
        .await
        .map_err(reject)?;
    publish(&state, response.count);
    Ok(Json(response))
}

async fn http_reset(State(state): State<Arc<AppState>>) -> HttpResult<Json<CountResponse>> {
    let _commit = state.commit.lock().await;
    let response = reset_count(&state.api).await.map_err(reject)?;
    publish(&state, response.count);
    Ok(Json(response))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::broadcast::error::RecvError;

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; skipping ahead");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
