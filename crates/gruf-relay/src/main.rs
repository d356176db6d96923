//! gruf-relay — a front-end gRPC relay for `gruf` worker subprocesses.
//!
//! One externally visible gRPC endpoint is fanned across a locally
//! supervised pool of single-threaded workers. The relay spawns and
//! restarts the workers, health-checks them, and proxies arbitrary gRPC
//! methods to the healthy set without ever parsing payloads.
//!
//! Subsystems run as peer tasks under one root cancellation token:
//! the worker manager, the load balancer, the health checker, the probes
//! and metrics HTTP servers, and the gRPC listener. SIGINT, SIGTERM, or
//! SIGQUIT cancels the root token and waits for every task to drain.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_balance::{Balancer, RoundRobin};
use relay_config::{Config, LogConfig, LogFormat};
use relay_health::HealthChecker;
use relay_metrics::{MetricsScraper, ScrapeTargets};
use relay_probes::{Probes, ServerStates, WorkerNames};
use relay_proxy::{GrpcServer, Proxy};
use relay_worker::Manager;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const COMMIT: &str = match option_env!("RELAY_BUILD_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};
const BUILD_DATE: &str = match option_env!("RELAY_BUILD_DATE") {
    Some(date) => date,
    None => "",
};

#[derive(Parser)]
#[command(name = "gruf-relay", about = "gRPC relay for gruf workers", disable_version_flag = true)]
struct Cli {
    /// Print version information and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version {
        println!("gruf-relay\nversion: {VERSION}\ncommit: {COMMIT}\nbuilt date: {BUILD_DATE}");
        return ExitCode::SUCCESS;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.log);
    info!(version = VERSION, "starting grpc relay");

    match run(config).await {
        Ok(()) => {
            info!("goodbye");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let started = Arc::new(AtomicBool::new(false));

    let manager = Arc::new(Manager::new(&config.workers));
    let balancer = Arc::new(RoundRobin::new());
    let checker = Arc::new(HealthChecker::new(
        &config.health_check,
        manager.workers().clone(),
        balancer.clone() as Arc<dyn Balancer>,
    ));

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    {
        let manager = Arc::clone(&manager);
        let token = shutdown.child_token();
        tasks.spawn(async move { manager.run(token).await.context("worker manager") });
    }

    {
        let balancer = Arc::clone(&balancer);
        let token = shutdown.child_token();
        tasks.spawn(async move {
            balancer.run(token).await;
            Ok(())
        });
    }

    {
        let checker = Arc::clone(&checker);
        let token = shutdown.child_token();
        tasks.spawn(async move {
            checker.run(token).await;
            Ok(())
        });
    }

    if config.probes.enabled {
        let probes = Probes::new(
            config.probes.port,
            Arc::clone(&started),
            Arc::clone(&manager) as Arc<dyn WorkerNames>,
            Arc::clone(&checker) as Arc<dyn ServerStates>,
        );
        let token = shutdown.child_token();
        tasks.spawn(async move { probes.run(token).await.context("probes server") });
    }

    if config.metrics.enabled {
        let scraper = MetricsScraper::new(
            config.metrics.port,
            config.metrics.path.clone(),
            config.metrics.interval,
            Arc::clone(&manager) as Arc<dyn ScrapeTargets>,
        );
        let token = shutdown.child_token();
        tasks.spawn(async move { scraper.run(token).await.context("metrics server") });
    }

    {
        let proxy = Arc::new(Proxy::new(
            balancer.clone() as Arc<dyn Balancer>,
            config.server.proxy_timeout,
        ));
        let server = GrpcServer::new(&config.server.host, config.server.port, proxy);
        let token = shutdown.child_token();
        tasks.spawn(async move { server.run(token).await.context("grpc server") });
    }

    started.store(true, Ordering::SeqCst);
    info!("relay started");

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;

    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "received termination signal"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "received termination signal"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "received termination signal"),
        result = tasks.join_next() => {
            failure = Some(early_exit_error(result));
        }
    }

    info!("shutting down");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        match flatten(Some(result)) {
            Ok(()) => {}
            Err(err) => {
                error!(error = %err, "subsystem failed during shutdown");
                if failure.is_none() {
                    failure = Some(err);
                }
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

type TaskResult = Option<Result<anyhow::Result<()>, tokio::task::JoinError>>;

fn early_exit_error(result: TaskResult) -> anyhow::Error {
    match result {
        Some(result) => match flatten(Some(result)) {
            Ok(()) => anyhow::anyhow!("subsystem stopped unexpectedly"),
            Err(err) => err,
        },
        None => anyhow::anyhow!("no subsystems were started"),
    }
}

fn flatten(result: TaskResult) -> anyhow::Result<()> {
    match result {
        Some(Ok(result)) => result,
        Some(Err(join_err)) => Err(anyhow::anyhow!("subsystem task panicked: {join_err}")),
        None => Ok(()),
    }
}

fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}
