//! The fixed worker set.
//!
//! The manager creates `workers.count` workers at construction time
//! (`worker-1` on `start_port`, `worker-2` on `start_port + 1`, ...; metrics
//! ports are the gRPC ports shifted by 100) and runs them concurrently. The
//! set never changes afterwards; crashes are handled inside each worker.

use std::collections::HashMap;
use std::sync::Arc;

use relay_config::WorkersConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::worker::{Worker, WorkerCommand, WorkerError};

/// Offset between a worker's gRPC port and its metrics port.
const METRICS_PORT_OFFSET: u16 = 100;

/// Owns the worker set and runs it as one unit.
pub struct Manager {
    workers: HashMap<String, Arc<Worker>>,
}

impl Manager {
    pub fn new(config: &WorkersConfig) -> Self {
        Self::build(config, None)
    }

    /// Construct the set with a substitute child command (tests).
    pub fn with_command(config: &WorkersConfig, command: WorkerCommand) -> Self {
        Self::build(config, Some(command))
    }

    fn build(config: &WorkersConfig, command: Option<WorkerCommand>) -> Self {
        let mut workers = HashMap::with_capacity(config.count as usize);
        for i in 0..config.count {
            let name = format!("worker-{}", i + 1);
            let port = config.start_port + i;
            let metrics_port = port + METRICS_PORT_OFFSET;
            let mut worker = Worker::new(
                &name,
                port,
                metrics_port,
                config.metrics_path.clone(),
                config.pool_size as usize,
            );
            if let Some(command) = &command {
                worker = worker.with_command(command.clone());
            }
            workers.insert(name, Arc::new(worker));
        }
        Self { workers }
    }

    /// The worker set, immutable after construction.
    pub fn workers(&self) -> &HashMap<String, Arc<Worker>> {
        &self.workers
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Run every worker until `shutdown` is cancelled.
    ///
    /// The first worker error cancels the siblings; the error is returned
    /// once all workers have drained. A clean shutdown returns `Ok(())`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        info!(count = self.workers.len(), "starting workers");

        let workers_token = shutdown.child_token();
        let mut tasks = JoinSet::new();
        for worker in self.workers.values() {
            let worker = Arc::clone(worker);
            let token = workers_token.clone();
            tasks.spawn(async move { worker.run(token).await });
        }

        let mut first_error = None;
        while let Some(result) = tasks.join_next().await {
            let failed = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(join_err) => Some(WorkerError::Task(join_err.to_string())),
            };
            if let Some(err) = failed {
                error!(error = %err, "worker failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
                workers_token.cancel();
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("all workers stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(count: u16) -> WorkersConfig {
        WorkersConfig {
            count,
            start_port: 19300,
            metrics_path: "/metrics".to_string(),
            pool_size: 2,
        }
    }

    #[test]
    fn builds_named_workers_with_sequential_ports() {
        let manager = Manager::new(&test_config(3));

        let mut names = manager.worker_names();
        names.sort();
        assert_eq!(names, vec!["worker-1", "worker-2", "worker-3"]);

        let worker_2 = &manager.workers()["worker-2"];
        assert_eq!(worker_2.addr(), "0.0.0.0:19301");
        assert_eq!(worker_2.metrics_addr(), "0.0.0.0:19401/metrics");
    }

    #[test]
    fn zero_workers_is_a_valid_empty_set() {
        let manager = Manager::new(&test_config(0));
        assert!(manager.workers().is_empty());
        assert!(manager.worker_names().is_empty());
    }

    #[tokio::test]
    async fn run_fails_fast_when_a_worker_cannot_spawn() {
        let manager = Manager::with_command(
            &test_config(2),
            WorkerCommand::new("/nonexistent-relay-test-binary", Vec::<String>::new()),
        );

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            manager.run(CancellationToken::new()),
        )
        .await
        .expect("run should fail fast")
        .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn run_drains_cleanly_on_shutdown() {
        let manager = Arc::new(Manager::with_command(
            &test_config(2),
            WorkerCommand::new("sleep", ["30"]),
        ));
        let shutdown = CancellationToken::new();

        let handle = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        for worker in manager.workers().values() {
            assert!(worker.is_running());
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("manager should drain")
            .unwrap()
            .unwrap();

        for worker in manager.workers().values() {
            assert!(!worker.is_running());
        }
    }
}
