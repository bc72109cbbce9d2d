//! Queue store, bounded swap queue and flush timers
//!
//! Producers enqueue under a lock and arm a timer; timers swap the queue
//! contents out atomically and hand the batch to a scheduler.

pub mod bounded;
pub mod store;
pub mod timer;

pub use bounded::BoundedQueue;
pub use store::{
    FastStatusBatch, FullSyncBatch, QueueDepth, QueueSet, QueueStore, StatusRoute, UpdateRoute,
};
pub use timer::FlushTimer;
