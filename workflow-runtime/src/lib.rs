//! Scheduler, lease-based workers and the workflow host.
//!
//! A [`WorkflowHost`] polls its persistence provider for due instances and
//! hands them to a pool of workers. Each worker leases an instance, runs its
//! current step and persists the result with an etag check, so at most one
//! worker advances an instance at a time and a crashed worker's instances are
//! picked up again once its lease expires.

mod config;
mod context;
mod host;
mod scheduler;
mod worker;

pub use config::{EngineConfig, RetryPolicy};
pub use context::EngineContext;
pub use host::WorkflowHost;
pub use worker::{CycleOutcome, Worker};

pub use workflow_persistence as persistence;
pub use workflow_persistence::{InMemoryProvider, PersistenceError, PersistenceProvider};
