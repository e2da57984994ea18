//! Control surface: loopback HTTP routes that forward pause/resume/start to
//! the supervisor, plus the client the CLI and the watchdog use.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ControlError;
use crate::supervisor::{Supervisor, SupervisorStatus};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the router with the worker control and status routes.
pub fn control_routes(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/worker/pause", post(pause_worker))
        .route("/v1/worker/resume", post(resume_worker))
        .route("/v1/lifecycle/start", post(start_service))
        .route("/v1/lifecycle/cancel-respawn", post(cancel_respawn))
        .route("/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Bind the control listener. Done before the service registers itself so a
/// second instance on a taken port never touches the restart registration.
pub async fn bind_control(addr: SocketAddr) -> Result<TcpListener, ControlError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ControlError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let local = listener.local_addr().unwrap_or(addr);
    info!(addr = %local, "Control surface listening");
    Ok(listener)
}

/// Serve `router` on a bound listener until `shutdown` resolves.
pub async fn serve_control(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ControlError> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ControlError::Serve)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "worker-keeper"
    }))
}

// ── Worker control ──────────────────────────────────────────────────────

async fn pause_worker(State(supervisor): State<Arc<Supervisor>>) -> StatusCode {
    supervisor.pause().await;
    StatusCode::NO_CONTENT
}

async fn resume_worker(State(supervisor): State<Arc<Supervisor>>) -> StatusCode {
    supervisor.resume().await;
    StatusCode::NO_CONTENT
}

async fn start_service(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    let disposition = supervisor.on_start().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "disposition": disposition })),
    )
}

async fn cancel_respawn(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    match supervisor.cancel_respawn().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn status(State(supervisor): State<Arc<Supervisor>>) -> Json<SupervisorStatus> {
    Json(supervisor.status().await)
}

// ── Client ──────────────────────────────────────────────────────────────

/// Something that can deliver a start request to a running service.
#[async_trait]
pub trait StartTrigger: Send + Sync {
    async fn start(&self) -> Result<(), ControlError>;
}

/// HTTP client for a keeper's control surface.
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: reqwest::Client,
    base: String,
}

impl ControlClient {
    pub fn new(addr: SocketAddr) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base: format!("http://{addr}"),
        }
    }

    pub async fn pause_worker(&self) -> Result<(), ControlError> {
        self.post("/v1/worker/pause").await
    }

    pub async fn resume_worker(&self) -> Result<(), ControlError> {
        self.post("/v1/worker/resume").await
    }

    pub async fn cancel_respawn(&self) -> Result<(), ControlError> {
        self.post("/v1/lifecycle/cancel-respawn").await
    }

    pub async fn status(&self) -> Result<SupervisorStatus, ControlError> {
        let url = format!("{}/v1/status", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ControlError::RequestFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ControlError::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        response
            .json::<SupervisorStatus>()
            .await
            .map_err(|e| ControlError::RequestFailed {
                url,
                reason: e.to_string(),
            })
    }

    async fn post(&self, path: &str) -> Result<(), ControlError> {
        let url = format!("{}{path}", self.base);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ControlError::RequestFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ControlError::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StartTrigger for ControlClient {
    async fn start(&self) -> Result<(), ControlError> {
        self.post("/v1/lifecycle/start").await
    }
}
