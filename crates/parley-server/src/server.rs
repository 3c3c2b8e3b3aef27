//! axum surface: `/ws` upgrades into sessions, `/health` reports counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use parley_settings::ServerSettings;

use crate::health::{self, HealthResponse};
use crate::pump;
use crate::services::Services;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;

/// Listener address.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
        }
    }
}

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub sessions: TaskTracker,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind, start the queue consumers, and serve until shut down.
pub async fn start(config: ServerConfig, services: Arc<Services>) -> Result<ServerHandle, std::io::Error> {
    let shutdown = ShutdownCoordinator::new();
    let sessions = TaskTracker::new();
    let consumers = services.spawn_background(&shutdown.token());

    let router = build_router(AppState {
        services: Arc::clone(&services),
        sessions: sessions.clone(),
        started_at: Instant::now(),
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "parley server listening");

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        services,
        shutdown,
        sessions,
        server,
        consumers,
    })
}

/// Handle returned by [`start`]; owns every background task.
pub struct ServerHandle {
    pub port: u16,
    services: Arc<Services>,
    shutdown: ShutdownCoordinator,
    sessions: TaskTracker,
    server: JoinHandle<()>,
    consumers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Stop accepting, stop consumers, close every session, and wait up to
    /// `timeout` for it all to wind down.
    pub async fn shutdown(self, timeout: Option<Duration>) {
        let mut handles = self.consumers;
        handles.push(self.server);
        self.shutdown
            .graceful_shutdown(&self.services.registry, &self.sessions, handles, timeout)
            .await;
        info!("parley server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // Protocol-level ceiling only; the inbound pump enforces the real limit
    // so oversized frames are reported as such.
    let ceiling = state.services.session.max_frame_bytes.saturating_mul(4).max(4096);
    ws.max_message_size(ceiling)
        .on_upgrade(move |socket| state.sessions.track_future(serve_socket(socket, state.services)))
}

/// Run one upgraded socket as a session until it closes.
pub async fn serve_socket(socket: WebSocket, services: Arc<Services>) {
    let (session, rx) = Session::new(services.session.outbound_capacity);
    let (sink, stream) = socket.split();
    pump::drive(
        session,
        rx,
        sink,
        stream,
        &services.registry,
        services.dispatcher.clone(),
        &services.session,
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.services.registry;
    Json(health::health_check(
        state.started_at,
        registry.count(),
        registry.online_users(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Backends;
    use parley_settings::Settings;

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let services = Arc::new(Services::new(Backends::in_memory(), &Settings::default()));
        let handle = start(ServerConfig::default(), services).await.unwrap();

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["online_users"], 0);

        handle.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let services = Arc::new(Services::new(Backends::in_memory(), &Settings::default()));
        let handle = start(ServerConfig::default(), services).await.unwrap();

        let url = format!("http://127.0.0.1:{}/nope", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        handle.shutdown(Some(Duration::from_secs(5))).await;
    }
}
