//! Bounded pool of gRPC client connections to a single worker.
//!
//! The pool has a fixed number of slots. Each slot holds a lazily dialed
//! [`Channel`]; availability is tracked by a semaphore paired with an index
//! freelist, so a checkout waits without spinning and a cancelled wait never
//! loses a slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Semaphore;
use tonic::transport::Channel;
use tracing::debug;

/// Builds a client connection for a slot on first checkout.
pub type ChannelBuilder = Box<dyn Fn() -> Result<Channel, tonic::transport::Error> + Send + Sync>;

/// Errors surfaced by [`ConnectionPool::fetch`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was closed while waiting or before the call.
    #[error("connection pool is closed")]
    Closed,

    /// The injected builder failed; the slot was returned to the pool.
    #[error("failed to build client connection: {0}")]
    Build(#[from] tonic::transport::Error),
}

/// A fixed-size checkout/checkin pool of client connections.
///
/// At any instant `checked_out + available == size`. Closing the pool is
/// terminal: connections are dropped and subsequent checkouts fail. A worker
/// restart installs a fresh pool instead of reopening a closed one.
pub struct ConnectionPool {
    slots: Mutex<Vec<Option<Channel>>>,
    free: Mutex<VecDeque<usize>>,
    available: Semaphore,
    builder: ChannelBuilder,
    size: usize,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size)
            .finish()
    }
}

/// A checked-out connection. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct PulledConn {
    channel: Channel,
    index: usize,
    pool: Arc<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(size: usize, builder: ChannelBuilder) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![None; size]),
            free: Mutex::new((0..size).collect()),
            available: Semaphore::new(size),
            builder,
            size,
        })
    }

    /// Check out a connection, waiting until a slot is available.
    ///
    /// The slot's connection is built on first use. If the builder fails the
    /// slot is returned immediately and the error surfaces to the caller.
    /// Dropping the wait (cancellation, timeout) consumes nothing.
    pub async fn fetch(self: &Arc<Self>) -> Result<PulledConn, PoolError> {
        let permit = self.available.acquire().await.map_err(|_| PoolError::Closed)?;
        permit.forget();

        let index = self
            .free
            .lock()
            .expect("freelist lock")
            .pop_front()
            .expect("freelist tracks semaphore permits");
        debug!(index, "checked out pool slot");

        let channel = {
            let mut slots = self.slots.lock().expect("slots lock");
            match &slots[index] {
                Some(channel) => channel.clone(),
                None => match (self.builder)() {
                    Ok(channel) => {
                        slots[index] = Some(channel.clone());
                        channel
                    }
                    Err(err) => {
                        drop(slots);
                        self.release(index);
                        return Err(PoolError::Build(err));
                    }
                },
            }
        };

        Ok(PulledConn {
            channel,
            index,
            pool: Arc::clone(self),
        })
    }

    /// Drop every cached connection and refuse further checkouts.
    /// Idempotent. Connections held by in-flight RPCs close once released.
    pub fn close(&self) {
        self.available.close();
        let mut slots = self.slots.lock().expect("slots lock");
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently available for checkout.
    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    fn release(&self, index: usize) {
        self.free.lock().expect("freelist lock").push_back(index);
        self.available.add_permits(1);
        debug!(index, "returned pool slot");
    }
}

impl PulledConn {
    /// The underlying channel. Cloning a [`Channel`] is cheap and shares the
    /// transport, so callers may move the clone into a request.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for PulledConn {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
