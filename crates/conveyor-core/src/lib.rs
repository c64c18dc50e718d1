//! Redis-backed job queue core
//!
//! A durable producer/consumer framework: jobs are created with a retry,
//! ghost (timeout) and scheduling policy, persisted in Redis, and
//! dispatched to worker processes under bounded concurrency.
//!
//! ## Architecture
//!
//! Redis holds all shared state:
//! - per-job record hashes (`itemData` payload plus an authoritative
//!   `state` field)
//! - per-name FIFO queue lists of runnable ids
//! - a scheduled sorted set for delayed, retry-delayed and ghost-delayed
//!   ids, scored by due timestamp
//! - per-state index sets and a creation-time index
//!
//! Producers go through [`JobQueue::create`]. A [`Worker`] keeps a
//! configurable number of jobs in flight, invokes the consumer
//! [`JobHandler`] under a per-job timeout, and classifies every attempt as
//! success, user error or ghost; the [`outcome`] state machine decides
//! between terminal states and re-enqueueing. A [`Scheduler`] task
//! promotes due ids into their active queues and resurrects jobs orphaned
//! mid-attempt.
//!
//! Delivery is at-least-once, deduplicated by job id. A job id is in at
//! most one queue at any moment; terminal jobs are archival only.

pub mod config;
pub mod connection;
pub mod error;
pub mod job;
pub mod keys;
pub mod outcome;
pub mod pop;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod worker;

// Re-export main types
pub use config::{JobOptions, QueueConfig, RedisConfig, SchedulerConfig, WorkerConfig};
pub use connection::RedisPool;
pub use error::{Error, Result};
pub use job::{JobRecord, JobState, JobView, ProcessItem};
pub use keys::Keys;
pub use outcome::{Outcome, OutcomeProcessor};
pub use pop::PopModel;
pub use queue::JobQueue;
pub use router::QueueRouter;
pub use scheduler::Scheduler;
pub use store::JobStore;
pub use worker::{handler_fn, HandlerFn, JobHandler, Worker, WorkerId, WorkerStats};

/// Current version of conveyor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
