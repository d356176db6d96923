//! Worker supervision for the relay.
//!
//! A [`Worker`] owns one `gruf` subprocess and a bounded pool of gRPC client
//! connections to it. The [`Manager`] constructs the fixed worker set from
//! configuration and runs every worker concurrently, failing fast if any of
//! them cannot start.

pub mod manager;
pub mod pool;
pub mod worker;

pub use manager::Manager;
pub use pool::{ConnectionPool, PoolError, PulledConn};
pub use worker::{Worker, WorkerCommand, WorkerError};
