//! A supervised `gruf` worker subprocess.
//!
//! Each worker spawns one child process serving gRPC on its assigned port,
//! restarts it with a fixed back-off when it crashes, and tears it down with
//! SIGTERM (escalating to SIGKILL) on shutdown. Client connections to the
//! worker are checked out of a per-worker [`ConnectionPool`]; the pool is
//! always closed before the child receives any termination signal and before
//! a restart begins.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

use crate::pool::{ConnectionPool, PoolError, PulledConn};

/// Delay between a crash and the next spawn attempt.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
/// How long a child may outlive SIGTERM before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Bound on waiting for a pool slot in [`Worker::fetch_client_conn`].
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn {worker}: {source}")]
    Spawn {
        worker: String,
        source: std::io::Error,
    },

    #[error("{worker} has no available client connection: {source}")]
    Unavailable {
        worker: String,
        #[source]
        source: PoolError,
    },

    #[error("timed out waiting for a client connection to {worker}")]
    FetchTimeout { worker: String },

    #[error("worker task failed: {0}")]
    Task(String),
}

/// The program and arguments used to start a worker child.
///
/// The production command is fixed; tests substitute a cheap executable.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `bundle exec gruf --host <addr> --health-check --backtrace-on-error`
    fn gruf(addr: &str) -> Self {
        Self::new(
            "bundle",
            [
                "exec",
                "gruf",
                "--host",
                addr,
                "--health-check",
                "--backtrace-on-error",
            ],
        )
    }
}

/// A supervised worker subprocess and its connection pool.
pub struct Worker {
    name: String,
    addr: String,
    metrics_port: u16,
    metrics_path: String,
    pool_size: usize,
    command: WorkerCommand,
    pool: RwLock<Arc<ConnectionPool>>,
    running: AtomicBool,
    stopping: AtomicBool,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        port: u16,
        metrics_port: u16,
        metrics_path: impl Into<String>,
        pool_size: usize,
    ) -> Self {
        let name = name.into();
        let addr = format!("0.0.0.0:{port}");
        let command = WorkerCommand::gruf(&addr);
        let pool = RwLock::new(build_pool(&addr, pool_size));
        Self {
            name,
            addr,
            metrics_port,
            metrics_path: metrics_path.into(),
            pool_size,
            command,
            pool,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    /// Replace the child command (tests).
    pub fn with_command(mut self, command: WorkerCommand) -> Self {
        self.command = command;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// gRPC listen address of the child (`host:port`).
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Metrics endpoint of the child (`host:port/path`).
    pub fn metrics_addr(&self) -> String {
        let host = self.addr.split(':').next().unwrap_or("0.0.0.0");
        format!("{host}:{}{}", self.metrics_port, self.metrics_path)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Check out a pooled client connection, waiting at most a few seconds.
    pub async fn fetch_client_conn(&self) -> Result<PulledConn, WorkerError> {
        let pool = self.pool();
        debug!(worker = %self.name, "waiting for available connection");
        match tokio::time::timeout(FETCH_TIMEOUT, pool.fetch()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(source)) => Err(WorkerError::Unavailable {
                worker: self.name.clone(),
                source,
            }),
            Err(_) => Err(WorkerError::FetchTimeout {
                worker: self.name.clone(),
            }),
        }
    }

    /// Run the worker until `shutdown` is cancelled.
    ///
    /// The initial spawn failure is returned so the manager can fail fast.
    /// After that the child is restarted on every unexpected exit with a
    /// fixed back-off; respawn failures are logged and retried indefinitely.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut child = self.spawn()?;
        self.running.store(true, Ordering::SeqCst);

        loop {
            tokio::select! {
                status = child.wait() => {
                    self.running.store(false, Ordering::SeqCst);
                    self.pool().close();

                    match &status {
                        Ok(status) if status.success() => {
                            info!(worker = %self.name, "worker exited normally")
                        }
                        Ok(status) => {
                            warn!(worker = %self.name, %status, "worker exited unexpectedly")
                        }
                        Err(err) => error!(worker = %self.name, error = %err, "failed waiting for worker"),
                    }

                    if shutdown.is_cancelled() {
                        self.stopping.store(true, Ordering::SeqCst);
                        return Ok(());
                    }

                    match self.respawn(&shutdown).await {
                        Some(next) => {
                            child = next;
                            self.running.store(true, Ordering::SeqCst);
                        }
                        None => return Ok(()),
                    }
                }
                _ = shutdown.cancelled() => {
                    self.shutdown_child(&mut child).await;
                    self.running.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
    }

    fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.read().expect("pool lock").clone()
    }

    fn spawn(&self) -> Result<Child, WorkerError> {
        info!(worker = %self.name, addr = %self.addr, "starting worker");

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .env("PROMETHEUS_EXPORTER_PORT", self.metrics_port.to_string())
            .env("PROMETHEUS_EXPORTER_PATH", &self.metrics_path)
            .env("RAILS_MAX_THREADS", self.pool_size.to_string())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| WorkerError::Spawn {
            worker: self.name.clone(),
            source,
        })?;

        info!(worker = %self.name, pid = ?child.id(), "worker started");
        Ok(child)
    }

    /// Wait out the back-off and spawn a replacement child with a fresh
    /// connection pool. Returns `None` once shutdown is requested.
    async fn respawn(&self, shutdown: &CancellationToken) -> Option<Child> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                _ = shutdown.cancelled() => {
                    self.stopping.store(true, Ordering::SeqCst);
                    return None;
                }
            }

            *self.pool.write().expect("pool lock") = build_pool(&self.addr, self.pool_size);

            match self.spawn() {
                Ok(child) => return Some(child),
                Err(err) => {
                    error!(worker = %self.name, error = %err, "failed to restart worker");
                }
            }
        }
    }

    /// Graceful child termination: close the pool, SIGTERM, then SIGKILL if
    /// the signal cannot be delivered or the child outlives the grace period.
    async fn shutdown_child(&self, child: &mut Child) {
        info!(worker = %self.name, "stopping worker");
        self.stopping.store(true, Ordering::SeqCst);
        self.pool().close();

        if let Ok(Some(status)) = child.try_wait() {
            info!(worker = %self.name, %status, "worker already exited");
            return;
        }

        if let Err(err) = signal_term(child) {
            error!(worker = %self.name, error = %err, "failed to send SIGTERM");
            if let Err(err) = child.start_kill() {
                error!(worker = %self.name, error = %err, "failed to kill worker");
                return;
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(worker = %self.name, %status, "worker stopped"),
            Ok(Err(err)) => error!(worker = %self.name, error = %err, "failed waiting for worker"),
            Err(_) => {
                error!(worker = %self.name, "timeout waiting for worker to exit, sending SIGKILL");
                if let Err(err) = child.start_kill() {
                    error!(worker = %self.name, error = %err, "failed to kill worker");
                    return;
                }
                match child.wait().await {
                    Ok(status) => info!(worker = %self.name, %status, "worker killed"),
                    Err(err) => {
                        error!(worker = %self.name, error = %err, "failed waiting for killed worker")
                    }
                }
            }
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn build_pool(addr: &str, size: usize) -> Arc<ConnectionPool> {
    let uri = format!("http://{addr}");
    ConnectionPool::new(size, Box::new(move || connect_lazy(&uri)))
}

fn connect_lazy(uri: &str) -> Result<Channel, tonic::transport::Error> {
    Ok(Endpoint::from_shared(uri.to_string())?
        .connect_timeout(Duration::from_secs(5))
        .connect_lazy())
}

fn signal_term(child: &Child) -> std::io::Result<()> {
    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("worker has no pid"))?;
    debug!(pid, "sending SIGTERM to worker");
    // Safety: plain kill(2) on a pid we own.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(name: &str) -> Worker {
        Worker::new(name, 19100, 19200, "/metrics", 2)
            .with_command(WorkerCommand::new("sleep", ["30"]))
    }

    #[tokio::test]
    async fn initial_spawn_failure_is_returned() {
        let worker = Worker::new("worker-1", 19101, 19201, "/metrics", 1)
            .with_command(WorkerCommand::new("/nonexistent-relay-test-binary", Vec::<String>::new()));

        let err = worker.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn shutdown_terminates_child_without_restart() {
        let worker = Arc::new(sleeper("worker-1"));
        let shutdown = CancellationToken::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(worker.is_running());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop quickly")
            .unwrap()
            .unwrap();

        assert!(!worker.is_running());
        assert!(worker.is_stopping());

        // Long enough for a restart back-off to have elapsed.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn crashed_child_is_restarted_after_backoff() {
        let worker = Arc::new(
            Worker::new("worker-1", 19102, 19202, "/metrics", 1)
                .with_command(WorkerCommand::new("sh", ["-c", "sleep 0.2"])),
        );
        let shutdown = CancellationToken::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(worker.is_running());

        // The child exits at ~200ms; the worker is down during the back-off.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!worker.is_running());

        // After the ~1s back-off a replacement child is up.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(worker.is_running());

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn fetch_fails_once_pool_is_closed_by_shutdown() {
        let worker = Arc::new(sleeper("worker-1"));
        let shutdown = CancellationToken::new();

        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let conn = worker.fetch_client_conn().await.unwrap();
        drop(conn);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

        let err = worker.fetch_client_conn().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Unavailable {
                source: PoolError::Closed,
                ..
            }
        ));
    }

    #[test]
    fn addresses_are_derived_from_ports() {
        let worker = Worker::new("worker-3", 9002, 9102, "/metrics", 4);
        assert_eq!(worker.addr(), "0.0.0.0:9002");
        assert_eq!(worker.metrics_addr(), "0.0.0.0:9102/metrics");
        assert_eq!(worker.to_string(), "worker-3");
    }
}
