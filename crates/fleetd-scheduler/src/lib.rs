//! Job scheduling for fleetd.
//!
//! Holds persisted jobs in a queue and dispatches them to a pool of workers.
//! The PostgreSQL queue uses SKIP LOCKED so several fleetd processes can share
//! one jobs table.

pub mod pool;
pub mod queue;
pub mod worker;

pub use pool::WorkerPool;
pub use queue::{Dispatch, LocalQueue, PgQueue, Queue, QueueEntry, QueueState};
pub use worker::Worker;
