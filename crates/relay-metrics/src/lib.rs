//! Worker metrics aggregation.
//!
//! Each worker child exports Prometheus text on its own metrics port. The
//! scraper polls every running worker on an interval, merges the exposition
//! by metric family (first HELP/TYPE wins, samples concatenate), and serves
//! the aggregate on the relay's metrics port.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use relay_worker::Manager;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Bound on a single worker scrape.
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Scrape targets: `(worker name, metrics endpoint)` for every worker whose
/// child is currently running.
pub trait ScrapeTargets: Send + Sync {
    fn targets(&self) -> Vec<(String, String)>;
}

impl ScrapeTargets for Manager {
    fn targets(&self) -> Vec<(String, String)> {
        self.workers()
            .values()
            .filter(|worker| worker.is_running())
            .map(|worker| (worker.name().to_string(), worker.metrics_addr()))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("unexpected status: {0}")]
    Status(http::StatusCode),

    #[error("scrape timed out")]
    Timeout,
}

/// Periodic scraper plus the aggregate `/metrics` listener.
pub struct MetricsScraper {
    port: u16,
    path: String,
    interval: Duration,
    targets: Arc<dyn ScrapeTargets>,
    snapshot: Arc<RwLock<String>>,
}

impl MetricsScraper {
    pub fn new(
        port: u16,
        path: impl Into<String>,
        interval: Duration,
        targets: Arc<dyn ScrapeTargets>,
    ) -> Self {
        Self {
            port,
            path: path.into(),
            interval,
            targets,
            snapshot: Arc::new(RwLock::new(String::new())),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.path, get(serve_snapshot))
            .with_state(Arc::clone(&self.snapshot))
    }

    /// Scrape on every tick and serve the aggregate until `shutdown` is
    /// cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(port = self.port, path = %self.path, "starting metrics server");

        let serve = async {
            axum::serve(listener, self.router())
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await
        };

        let scrape_loop = async {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.scrape_all().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        };

        let (served, ()) = tokio::join!(serve, scrape_loop);
        info!("metrics server stopped");
        served
    }

    /// Scrape every running worker concurrently and publish the merge.
    pub async fn scrape_all(&self) {
        let fetches = self.targets.targets().into_iter().map(|(name, target)| async move {
            match fetch_metrics(&target).await {
                Ok(body) => {
                    debug!(worker = %name, bytes = body.len(), "scraped worker metrics");
                    Some(body)
                }
                Err(err) => {
                    error!(worker = %name, target = %target, error = %err, "failed to scrape metrics");
                    None
                }
            }
        });

        let bodies: Vec<String> = futures::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect();

        let merged = merge_families(bodies.iter().map(String::as_str));
        *self.snapshot.write().expect("snapshot lock") = merged;
    }

    /// Current aggregate exposition (tests).
    pub fn snapshot(&self) -> String {
        self.snapshot.read().expect("snapshot lock").clone()
    }
}

async fn serve_snapshot(State(snapshot): State<Arc<RwLock<String>>>) -> impl IntoResponse {
    let body = snapshot.read().expect("snapshot lock").clone();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// GET a worker's metrics endpoint (`host:port/path`).
async fn fetch_metrics(target: &str) -> Result<String, ScrapeError> {
    let (authority, path) = match target.split_once('/') {
        Some((authority, path)) => (authority, format!("/{path}")),
        None => (target, "/".to_string()),
    };

    let stream = tokio::net::TcpStream::connect(authority).await?;
    let io = TokioIo::new(stream);
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method("GET")
        .uri(&path)
        .header("host", authority)
        .header("user-agent", "gruf-relay/0.3")
        .body(Empty::<Bytes>::new())?;

    let response = tokio::time::timeout(SCRAPE_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| ScrapeError::Timeout)??;

    if !response.status().is_success() {
        return Err(ScrapeError::Status(response.status()));
    }

    let body = tokio::time::timeout(SCRAPE_TIMEOUT, response.into_body().collect())
        .await
        .map_err(|_| ScrapeError::Timeout)??
        .to_bytes();
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Merge several Prometheus text expositions by metric family.
///
/// The first HELP/TYPE line seen for a family is kept; sample lines from all
/// inputs are concatenated in arrival order. Families keep the order of
/// first appearance.
pub fn merge_families<'a>(bodies: impl Iterator<Item = &'a str>) -> String {
    #[derive(Default)]
    struct Family {
        help: Option<String>,
        kind: Option<String>,
        samples: Vec<String>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut families: HashMap<String, Family> = HashMap::new();

    fn ensure_family(order: &mut Vec<String>, families: &mut HashMap<String, Family>, name: &str) {
        if !families.contains_key(name) {
            order.push(name.to_string());
            families.insert(name.to_string(), Family::default());
        }
    }

    for body in bodies {
        for line in body.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("# HELP ") {
                if let Some(name) = rest.split_whitespace().next() {
                    ensure_family(&mut order, &mut families, name);
                    let family = families.get_mut(name).expect("family just inserted");
                    if family.help.is_none() {
                        family.help = Some(line.to_string());
                    }
                }
            } else if let Some(rest) = line.strip_prefix("# TYPE ") {
                if let Some(name) = rest.split_whitespace().next() {
                    ensure_family(&mut order, &mut families, name);
                    let family = families.get_mut(name).expect("family just inserted");
                    if family.kind.is_none() {
                        family.kind = Some(line.to_string());
                    }
                }
            } else if line.starts_with('#') {
                // Other comments are dropped.
            } else if let Some(name) = line.split(['{', ' ']).next() {
                if name.is_empty() {
                    continue;
                }
                ensure_family(&mut order, &mut families, name);
                families
                    .get_mut(name)
                    .expect("family just inserted")
                    .samples
                    .push(line.to_string());
            }
        }
    }

    let mut out = String::new();
    for name in &order {
        let family = &families[name];
        if let Some(help) = &family.help {
            out.push_str(help);
            out.push('\n');
        }
        if let Some(kind) = &family.kind {
            out.push_str(kind);
            out.push('\n');
        }
        for sample in &family.samples {
            out.push_str(sample);
            out.push('\n');
        }
    }
    out
}
