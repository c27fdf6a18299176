//! `RelayServer`: axum HTTP + WebSocket front end for the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::Dialect;
use relay_hub::Hub;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::errors::HandshakeError;
use crate::health::{self, HealthResponse};
use crate::session::{self, WsSink};
use crate::settings::ServerSettings;
use crate::shutdown::ShutdownCoordinator;

/// Bot self id header.
pub const SELF_ID_HEADER: &str = "x-self-id";
/// Bot platform header.
pub const PLATFORM_HEADER: &str = "x-platform";
/// Worker id header.
pub const WORKER_ID_HEADER: &str = "x-worker-id";
/// Wire dialect header (`flat_text` or `structured`).
pub const DIALECT_HEADER: &str = "x-dialect";

/// Platform recorded for bots that do not name one.
const UNKNOWN_PLATFORM: &str = "unknown";

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The message hub.
    pub hub: Hub,
    /// Prometheus handle rendered by `/metrics`.
    pub metrics: PrometheusHandle,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Listener settings.
    pub settings: Arc<ServerSettings>,
}

/// Query-string fallbacks for the identity headers.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Bot self id.
    pub self_id: Option<String>,
    /// Bot platform.
    pub platform: Option<String>,
    /// Worker id.
    pub worker_id: Option<String>,
    /// Wire dialect.
    pub dialect: Option<String>,
}

/// Who a bot upgrade request claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    /// Bot self id.
    pub self_id: String,
    /// Chat platform.
    pub platform: String,
    /// Wire dialect.
    pub dialect: Dialect,
}

/// Who a worker upgrade request claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Worker id.
    pub worker_id: String,
    /// Wire dialect.
    pub dialect: Dialect,
}

fn lookup(headers: &HeaderMap, name: &str, fallback: Option<&str>) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .or(fallback)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn dialect_of(headers: &HeaderMap, query: &ConnectQuery) -> Result<Dialect, HandshakeError> {
    match lookup(headers, DIALECT_HEADER, query.dialect.as_deref()) {
        Some(name) => Dialect::parse(&name).ok_or(HandshakeError::UnknownDialect(name)),
        None => Ok(Dialect::default()),
    }
}

/// Resolve a bot's identity from headers, falling back to the query string.
pub fn bot_identity(headers: &HeaderMap, query: &ConnectQuery) -> Result<BotIdentity, HandshakeError> {
    let self_id = lookup(headers, SELF_ID_HEADER, query.self_id.as_deref())
        .ok_or(HandshakeError::MissingIdentity("X-Self-ID"))?;
    let platform = lookup(headers, PLATFORM_HEADER, query.platform.as_deref())
        .unwrap_or_else(|| UNKNOWN_PLATFORM.to_string());
    Ok(BotIdentity {
        self_id,
        platform,
        dialect: dialect_of(headers, query)?,
    })
}

/// Resolve a worker's identity from headers, falling back to the query string.
pub fn worker_identity(
    headers: &HeaderMap,
    query: &ConnectQuery,
) -> Result<WorkerIdentity, HandshakeError> {
    let worker_id = lookup(headers, WORKER_ID_HEADER, query.worker_id.as_deref())
        .ok_or(HandshakeError::MissingIdentity("X-Worker-ID"))?;
    Ok(WorkerIdentity {
        worker_id,
        dialect: dialect_of(headers, query)?,
    })
}

/// The relay server.
pub struct RelayServer {
    settings: Arc<ServerSettings>,
    hub: Hub,
    metrics: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a server around `hub`.
    pub fn new(settings: ServerSettings, hub: Hub, metrics: PrometheusHandle) -> Self {
        Self {
            settings: Arc::new(settings),
            hub,
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            metrics: self.metrics.clone(),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            settings: Arc::clone(&self.settings),
        };

        Router::new()
            .route("/ws/bot", get(bot_ws_handler))
            .route("/ws/worker", get(worker_ws_handler))
            .route("/ws/observer", get(observer_ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
    }

    /// The hub behind this server.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Bind and serve until the shutdown coordinator fires. Returns the bound
    /// address and the serving task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), std::io::Error> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(address = %local_addr, "relay server listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "server exited with error");
            }
            info!("relay server stopped");
        });
        Ok((local_addr, handle))
    }
}

fn refuse(error: &HandshakeError) -> Response {
    warn!(error = %error, "refusing WebSocket upgrade");
    (StatusCode::BAD_REQUEST, error.to_string()).into_response()
}

/// GET /ws/bot
async fn bot_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    match bot_identity(&headers, &query) {
        Ok(identity) => ws
            .max_message_size(state.settings.max_message_bytes)
            .on_upgrade(move |socket| bot_session(socket, identity, state)),
        Err(e) => refuse(&e),
    }
}

/// GET /ws/worker
async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    match worker_identity(&headers, &query) {
        Ok(identity) => ws
            .max_message_size(state.settings.max_message_bytes)
            .on_upgrade(move |socket| worker_session(socket, identity, state)),
        Err(e) => refuse(&e),
    }
}

/// GET /ws/observer
async fn observer_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.settings.max_message_bytes)
        .on_upgrade(move |socket| observer_session(socket, state))
}

async fn bot_session(socket: WebSocket, identity: BotIdentity, state: AppState) {
    let (tx, rx) = socket.split();
    let conn = state
        .hub
        .register_bot(
            &identity.self_id,
            &identity.platform,
            identity.dialect,
            Box::new(WsSink::new(tx)),
        )
        .await;
    run(&state, &conn, rx).await;
}

async fn worker_session(socket: WebSocket, identity: WorkerIdentity, state: AppState) {
    let (tx, rx) = socket.split();
    let conn = state
        .hub
        .register_worker(
            &identity.worker_id,
            identity.dialect,
            Vec::new(),
            Box::new(WsSink::new(tx)),
        )
        .await;
    run(&state, &conn, rx).await;
}

async fn observer_session(socket: WebSocket, state: AppState) {
    let (tx, rx) = socket.split();
    let conn = state.hub.register_observer(Box::new(WsSink::new(tx))).await;
    run(&state, &conn, rx).await;
}

async fn run(
    state: &AppState,
    conn: &Arc<relay_hub::Connection>,
    rx: futures::stream::SplitStream<WebSocket>,
) {
    session::read_loop(
        &state.hub,
        conn,
        rx,
        state.settings.ping_interval(),
        state.shutdown.token(),
    )
    .await;
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        &state.hub.stats(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        relay_telemetry::metrics::render(&state.metrics),
    )
}
