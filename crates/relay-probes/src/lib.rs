//! Kubernetes-style HTTP probes.
//!
//! Three endpoints on the probes port reflect the relay's state:
//!
//! | Path | 200 when | 503 when |
//! |---|---|---|
//! | `/startup` | wiring finished | still starting |
//! | `/readiness` | every worker is `Ready` | any `TransientFailure` or `Shutdown` |
//! | `/liveness` | no worker is `Shutdown` | any `Shutdown` |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use relay_health::{HealthChecker, ServingState};
use relay_worker::Manager;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The worker-name view the probes need from the manager.
pub trait WorkerNames: Send + Sync {
    fn worker_names(&self) -> Vec<String>;
}

impl WorkerNames for Manager {
    fn worker_names(&self) -> Vec<String> {
        Manager::worker_names(self)
    }
}

/// The per-worker state view the probes need from the health checker.
pub trait ServerStates: Send + Sync {
    fn server_state(&self, name: &str) -> ServingState;
}

impl ServerStates for HealthChecker {
    fn server_state(&self, name: &str) -> ServingState {
        HealthChecker::server_state(self, name)
    }
}

#[derive(Clone)]
struct ProbesState {
    started: Arc<AtomicBool>,
    manager: Arc<dyn WorkerNames>,
    checker: Arc<dyn ServerStates>,
}

/// The probes HTTP server.
pub struct Probes {
    port: u16,
    state: ProbesState,
}

impl Probes {
    pub fn new(
        port: u16,
        started: Arc<AtomicBool>,
        manager: Arc<dyn WorkerNames>,
        checker: Arc<dyn ServerStates>,
    ) -> Self {
        Self {
            port,
            state: ProbesState {
                started,
                manager,
                checker,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/startup", get(handle_startup))
            .route("/readiness", get(handle_readiness))
            .route("/liveness", get(handle_liveness))
            .with_state(self.state.clone())
    }

    /// Serve the probe endpoints until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(port = self.port, "starting probes server");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("probes server stopped");
        Ok(())
    }
}

async fn handle_startup(State(state): State<ProbesState>) -> StatusCode {
    if state.started.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn handle_readiness(State(state): State<ProbesState>) -> StatusCode {
    for name in state.manager.worker_names() {
        let worker_state = state.checker.server_state(&name);
        if matches!(
            worker_state,
            ServingState::TransientFailure | ServingState::Shutdown
        ) {
            warn!(worker = %name, state = %worker_state, "readiness probe failed");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    StatusCode::OK
}

async fn handle_liveness(State(state): State<ProbesState>) -> StatusCode {
    for name in state.manager.worker_names() {
        let worker_state = state.checker.server_state(&name);
        if worker_state == ServingState::Shutdown {
            warn!(worker = %name, state = %worker_state, "liveness probe failed");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    StatusCode::OK
}
