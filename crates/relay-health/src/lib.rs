//! Periodic health probing of workers.
//!
//! On every tick the checker probes all workers concurrently and waits for
//! the whole round before re-arming. Probe outcomes drive the balancer's
//! membership and a serving-state table read by the HTTP probes:
//!
//! - child process not running       → `Shutdown`, removed
//! - probe error or timeout          → `TransientFailure`, removed
//! - gRPC health reports `SERVING`   → `Ready`, added
//! - any other reported status       → `TransientFailure`, removed

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use relay_balance::Balancer;
use relay_config::HealthCheckConfig;
use relay_worker::Worker;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::{debug, info, warn};

/// Serving state of a single worker, as last observed by the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    /// The worker answered the health check with `SERVING`.
    Ready,
    /// The worker is up but unreachable or not serving.
    TransientFailure,
    /// The worker's child process is not running (or was never probed).
    Shutdown,
}

impl fmt::Display for ServingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::TransientFailure => "transient_failure",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Errors from a single probe attempt.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to connect: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("health check failed: {0}")]
    Status(#[from] tonic::Status),
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Probe implementation, injectable for tests. The default issues a gRPC
/// `grpc.health.v1.Health/Check` against the worker's address.
pub type HealthCheckFn =
    Arc<dyn Fn(Arc<Worker>) -> BoxFuture<Result<ServingStatus, ProbeError>> + Send + Sync>;

/// Periodic health checker over the fixed worker set.
pub struct HealthChecker {
    interval: Duration,
    timeout: Duration,
    workers: HashMap<String, Arc<Worker>>,
    balancer: Arc<dyn Balancer>,
    states: RwLock<HashMap<String, ServingState>>,
    probe: HealthCheckFn,
}

impl HealthChecker {
    pub fn new(
        config: &HealthCheckConfig,
        workers: HashMap<String, Arc<Worker>>,
        balancer: Arc<dyn Balancer>,
    ) -> Self {
        Self {
            interval: config.interval,
            timeout: config.timeout,
            workers,
            balancer,
            states: RwLock::new(HashMap::new()),
            probe: Arc::new(|worker| Box::pin(grpc_probe(worker))),
        }
    }

    /// Replace the probe implementation (tests).
    pub fn with_probe(mut self, probe: HealthCheckFn) -> Self {
        self.probe = probe;
        self
    }

    /// The last observed state for `name`; unknown workers are `Shutdown`.
    pub fn server_state(&self, name: &str) -> ServingState {
        self.states
            .read()
            .expect("states lock")
            .get(name)
            .copied()
            .unwrap_or(ServingState::Shutdown)
    }

    /// Probe every worker on each tick until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of `interval` fires immediately; skip it so workers
        // get a moment to come up before the first probe round.
        ticker.tick().await;

        info!(interval = ?self.interval, "health checker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.cancelled() => {
                    info!("health checker stopped");
                    return;
                }
            }
        }
    }

    /// One probe round: every worker concurrently, all awaited.
    pub async fn check_all(&self) {
        let checks = self
            .workers
            .values()
            .map(|worker| self.check_worker(Arc::clone(worker)));
        futures::future::join_all(checks).await;
    }

    async fn check_worker(&self, worker: Arc<Worker>) {
        let state = if !worker.is_running() {
            ServingState::Shutdown
        } else {
            match tokio::time::timeout(self.timeout, (self.probe)(Arc::clone(&worker))).await {
                Ok(Ok(ServingStatus::Serving)) => ServingState::Ready,
                Ok(Ok(status)) => {
                    warn!(worker = %worker, status = ?status, "worker is not serving");
                    ServingState::TransientFailure
                }
                Ok(Err(err)) => {
                    warn!(worker = %worker, error = %err, "health probe failed");
                    ServingState::TransientFailure
                }
                Err(_) => {
                    warn!(worker = %worker, timeout = ?self.timeout, "health probe timed out");
                    ServingState::TransientFailure
                }
            }
        };

        match state {
            ServingState::Ready => self.balancer.add(Arc::clone(&worker)).await,
            _ => self.balancer.remove(Arc::clone(&worker)).await,
        }

        debug!(worker = %worker, state = %state, "worker state updated");
        self.states
            .write()
            .expect("states lock")
            .insert(worker.name().to_string(), state);
    }
}

/// Default probe: dial the worker lazily and issue a standard health check.
async fn grpc_probe(worker: Arc<Worker>) -> Result<ServingStatus, ProbeError> {
    let channel = Endpoint::from_shared(format!("http://{}", worker.addr()))?
        .connect_timeout(Duration::from_secs(3))
        .connect_lazy();
    let mut client = HealthClient::new(channel);
    let response = client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await?;
    Ok(response.into_inner().status())
}
