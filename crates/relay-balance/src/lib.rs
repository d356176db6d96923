//! Healthy-worker membership and round-robin selection.
//!
//! The balancer is a serialised-writer, lock-free-reader registry. The
//! health checker mutates membership through [`Balancer::add`] and
//! [`Balancer::remove`]; the proxy picks a worker per RPC with
//! [`Balancer::next`] on the hot path.
//!
//! [`RoundRobin`] runs a dedicated loop that owns the authoritative list.
//! Mutations arrive over capacity-1 channels, so a caller's `add` or
//! `remove` completes only at the loop's processing rate; the published
//! membership is swapped atomically and `next` reads it without locking.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use relay_worker::Worker;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The capability set the relay core depends on. Round-robin is the only
/// strategy today; alternatives implement the same trait.
#[async_trait]
pub trait Balancer: Send + Sync {
    /// Add a worker to the membership. A no-op if it is already present.
    async fn add(&self, worker: Arc<Worker>);

    /// Remove a worker from the membership. A no-op if it is absent.
    async fn remove(&self, worker: Arc<Worker>);

    /// Select a worker, or `None` when the membership is empty. Lock-free.
    fn next(&self) -> Option<Arc<Worker>>;
}

type Membership = Vec<Arc<Worker>>;

/// Round-robin balancer.
pub struct RoundRobin {
    current: ArcSwap<Membership>,
    counter: AtomicUsize,
    add_tx: mpsc::Sender<Arc<Worker>>,
    remove_tx: mpsc::Sender<Arc<Worker>>,
    add_rx: Mutex<Option<mpsc::Receiver<Arc<Worker>>>>,
    remove_rx: Mutex<Option<mpsc::Receiver<Arc<Worker>>>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        let (add_tx, add_rx) = mpsc::channel(1);
        let (remove_tx, remove_rx) = mpsc::channel(1);
        Self {
            current: ArcSwap::from_pointee(Vec::new()),
            counter: AtomicUsize::new(0),
            add_tx,
            remove_tx,
            add_rx: Mutex::new(Some(add_rx)),
            remove_rx: Mutex::new(Some(remove_rx)),
        }
    }

    /// Consume add/remove messages until `shutdown` is cancelled.
    ///
    /// The loop exclusively owns the authoritative list and the name-presence
    /// set; every change republishes the list through the atomic swap.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut add_rx = self
            .add_rx
            .lock()
            .expect("add receiver lock")
            .take()
            .expect("balancer run loop started twice");
        let mut remove_rx = self
            .remove_rx
            .lock()
            .expect("remove receiver lock")
            .take()
            .expect("balancer run loop started twice");

        let mut members: Membership = Vec::new();
        let mut present: HashSet<String> = HashSet::new();

        info!("load balancer started");
        loop {
            tokio::select! {
                Some(worker) = add_rx.recv() => {
                    if present.insert(worker.name().to_string()) {
                        debug!(worker = %worker, "adding worker to balancer");
                        members.push(worker);
                        self.publish(&members);
                    }
                }
                Some(worker) = remove_rx.recv() => {
                    if present.remove(worker.name()) {
                        debug!(worker = %worker, "removing worker from balancer");
                        members.retain(|member| member.name() != worker.name());
                        self.publish(&members);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("load balancer stopped");
                    return;
                }
            }
        }
    }

    fn publish(&self, members: &Membership) {
        self.current.store(Arc::new(members.clone()));
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Balancer for RoundRobin {
    async fn add(&self, worker: Arc<Worker>) {
        // Send failure means the run loop is gone; shutdown is in progress.
        let _ = self.add_tx.send(worker).await;
    }

    async fn remove(&self, worker: Arc<Worker>) {
        let _ = self.remove_tx.send(worker).await;
    }

    fn next(&self) -> Option<Arc<Worker>> {
        let members = self.current.load();
        if members.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % members.len();
        Some(members[index].clone())
    }
}
