//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints, plus
//! `/version` describing the running build.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::ClusterApi;
use crate::operator::{BootState, BootStateCell};

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for health check endpoints.
pub struct HealthState<C: ClusterApi> {
    /// Boot state published by the operator.
    boot: Arc<BootStateCell>,
    /// Client for checking API server connectivity.
    client: Arc<C>,
}

impl<C: ClusterApi> HealthState<C> {
    pub fn new(boot: Arc<BootStateCell>, client: Arc<C>) -> Self {
        Self { boot, client }
    }

    /// Whether boot has reached the watch loop.
    pub fn is_watching(&self) -> bool {
        self.boot.get() == BootState::Watching
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

/// Run the health check HTTP server.
///
/// Runs until the server encounters a fatal error. Spawn it alongside the
/// operator boot loop.
pub async fn run_health_server<C: ClusterApi + 'static>(
    state: Arc<HealthState<C>>,
    port: u16,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<C>))
        .route("/version", get(version))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");

    axum::serve(listener, app).await
}

/// Liveness probe endpoint.
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Build information endpoint.
///
/// `git_commit` comes from the `GIT_COMMIT` variable at compile time.
async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "version": env!("CARGO_PKG_VERSION"),
        "git_commit": option_env!("GIT_COMMIT").unwrap_or("unknown"),
        "source": env!("CARGO_PKG_REPOSITORY"),
    }))
}

/// Readiness probe endpoint.
///
/// Returns 503 Service Unavailable until the operator is watching pods and
/// while the API server is unreachable.
async fn readyz<C: ClusterApi + 'static>(State(state): State<Arc<HealthState<C>>>) -> StatusCode {
    if !state.is_watching() {
        debug!(boot_state = ?state.boot.get(), "Readiness probe: NOT READY (not watching)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.client().check_readiness().await {
        Ok(true) => {
            debug!("Readiness probe: OK");
            StatusCode::OK
        }
        Ok(false) => {
            debug!("Readiness probe: NOT READY (API server not ready)");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (API server unreachable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
