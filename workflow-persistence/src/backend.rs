//! Persistence contract for workflow instances.
//!
//! This trait abstracts the storage mechanism, allowing implementations
//! for various backends (in-memory, Redis, PostgreSQL, etc.).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use workflow_core::error::WorkflowError;
use workflow_core::instance::WorkflowInstance;
use workflow_core::lease::Lease;

/// Error type for persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Instance not found.
    #[error("Instance not found: {0}")]
    NotFound(String),
    /// An instance with this id already exists.
    #[error("Instance already exists: {0}")]
    AlreadyExists(String),
    /// The stored etag differs from the one presented; nothing was written.
    #[error("Concurrency conflict on '{instance_id}': expected etag {expected}, found {actual}")]
    ConcurrencyConflict {
        instance_id: String,
        expected: u64,
        actual: u64,
    },
    /// The lease was released, expired and re-acquired, or never held.
    #[error("Lease lost on '{0}'")]
    LeaseLost(String),
    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<PersistenceError> for WorkflowError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::NotFound(id) => WorkflowError::NotFound(format!("instance '{id}'")),
            PersistenceError::ConcurrencyConflict {
                instance_id,
                expected,
                actual,
            } => WorkflowError::ConcurrencyConflict {
                instance_id,
                expected,
                actual,
            },
            PersistenceError::Serialization(msg) => WorkflowError::Serialization(msg),
            other => WorkflowError::Persistence(other.to_string()),
        }
    }
}

/// Durable store for workflow instances.
///
/// Every write goes through an etag comparison so that a stale snapshot can
/// never overwrite a newer one. Leases live alongside the instances and give
/// one worker at a time the right to advance an instance.
///
/// # Example
///
/// ```rust,ignore
/// use workflow_persistence::{InMemoryProvider, PersistenceProvider};
///
/// let provider = InMemoryProvider::new();
/// let id = provider.create_instance(instance).await?;
/// let mut snapshot = provider.get_instance(&id).await?;
/// snapshot.execution_pointer += 1;
/// snapshot.etag = provider.persist_instance(&snapshot).await?;
/// ```
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Store a new instance and return its id.
    ///
    /// The stored etag starts at 1 regardless of the etag on `instance`.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::AlreadyExists` on an id collision.
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<String, PersistenceError>;

    /// Load a point-in-time copy of an instance.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::NotFound` if no instance has this id.
    async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, PersistenceError>;

    /// Write `instance` if its etag matches the stored one, returning the new etag.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::ConcurrencyConflict` on an etag mismatch,
    /// in which case nothing is written.
    async fn persist_instance(&self, instance: &WorkflowInstance) -> Result<u64, PersistenceError>;

    /// Ids of instances that are due at `before`, oldest due first.
    ///
    /// Runnable instances without `resume_at`, or with `resume_at <= before`,
    /// and suspended instances with `resume_at <= before`. Terminal instances
    /// never appear.
    async fn list_runnable(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, PersistenceError>;

    /// Take the lease on an instance.
    ///
    /// Returns `Ok(Some(lease))` if the lease was free or expired, `Ok(None)`
    /// if another owner holds a live lease.
    async fn acquire_lease(
        &self,
        instance_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, PersistenceError>;

    /// Give up a lease.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::LeaseLost` if the stored lease carries a
    /// different token.
    async fn release_lease(&self, lease: &Lease) -> Result<(), PersistenceError>;

    /// Extend a lease to `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::LeaseLost` if the lease is no longer held.
    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, PersistenceError>;
}
