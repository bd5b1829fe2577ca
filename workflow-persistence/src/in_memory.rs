//! In-memory implementation of PersistenceProvider.
//!
//! This is a simple implementation that stores instances in a HashMap.
//! Useful for testing and as a reference implementation.

use crate::backend::{PersistenceError, PersistenceProvider};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use workflow_core::instance::WorkflowInstance;
use workflow_core::lease::Lease;

/// In-memory provider that stores instances and leases in HashMaps.
///
/// Cloning shares the underlying store, so a clone handed to a host and one
/// kept by a test observe the same instances.
///
/// # Example
///
/// ```rust,ignore
/// use workflow_persistence::{InMemoryProvider, PersistenceProvider};
///
/// let provider = InMemoryProvider::new();
/// let id = provider.create_instance(instance).await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemoryProvider {
    instances: Arc<RwLock<HashMap<String, WorkflowInstance>>>,
    leases: Arc<RwLock<HashMap<String, Lease>>>, // Key: instance_id
}

impl InMemoryProvider {
    /// Create a new in-memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> PersistenceError {
        PersistenceError::Backend(format!("Lock error: {}", e))
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live lease on an instance, if any.
    pub fn current_lease(&self, instance_id: &str) -> Option<Lease> {
        self.leases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .filter(|lease| !lease.is_expired())
            .cloned()
    }
}

#[async_trait]
impl PersistenceProvider for InMemoryProvider {
    async fn create_instance(&self, mut instance: WorkflowInstance) -> Result<String, PersistenceError> {
        let mut instances = self.instances.write().map_err(Self::lock_error)?;
        if instances.contains_key(&instance.id) {
            return Err(PersistenceError::AlreadyExists(instance.id));
        }
        instance.etag = 1;
        let id = instance.id.clone();
        instances.insert(id.clone(), instance);
        Ok(id)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, PersistenceError> {
        let instances = self.instances.read().map_err(Self::lock_error)?;
        instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(instance_id.to_string()))
    }

    async fn persist_instance(&self, instance: &WorkflowInstance) -> Result<u64, PersistenceError> {
        let mut instances = self.instances.write().map_err(Self::lock_error)?;
        let stored = instances
            .get_mut(&instance.id)
            .ok_or_else(|| PersistenceError::NotFound(instance.id.clone()))?;

        if stored.etag != instance.etag {
            tracing::debug!(
                instance_id = %instance.id,
                expected = instance.etag,
                actual = stored.etag,
                "Rejecting stale persist"
            );
            return Err(PersistenceError::ConcurrencyConflict {
                instance_id: instance.id.clone(),
                expected: instance.etag,
                actual: stored.etag,
            });
        }

        let etag = instance.etag + 1;
        *stored = WorkflowInstance {
            etag,
            ..instance.clone()
        };
        Ok(etag)
    }

    async fn list_runnable(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, PersistenceError> {
        let instances = self.instances.read().map_err(Self::lock_error)?;
        let mut due: Vec<&WorkflowInstance> = instances
            .values()
            .filter(|instance| instance.is_due(before))
            .collect();
        due.sort_by_key(|instance| instance.due_at());
        Ok(due
            .into_iter()
            .take(limit)
            .map(|instance| instance.id.clone())
            .collect())
    }

    async fn acquire_lease(
        &self,
        instance_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, PersistenceError> {
        let mut leases = self.leases.write().map_err(Self::lock_error)?;

        // Check if already leased and not expired
        if let Some(existing) = leases.get(instance_id) {
            if !existing.is_expired() {
                return Ok(None);
            }
            tracing::debug!(
                instance_id = %instance_id,
                previous_owner = %existing.owner,
                owner = %owner,
                "Taking over expired lease"
            );
        }

        let lease = Lease::new(instance_id, owner, uuid::Uuid::new_v4().to_string(), ttl);
        leases.insert(instance_id.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), PersistenceError> {
        let mut leases = self.leases.write().map_err(Self::lock_error)?;
        match leases.get(&lease.instance_id) {
            Some(stored) if stored.token == lease.token => {
                leases.remove(&lease.instance_id);
                Ok(())
            }
            _ => Err(PersistenceError::LeaseLost(lease.instance_id.clone())),
        }
    }

    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, PersistenceError> {
        let mut leases = self.leases.write().map_err(Self::lock_error)?;
        match leases.get_mut(&lease.instance_id) {
            Some(stored) if stored.token == lease.token => {
                *stored = stored.renewed(ttl);
                Ok(stored.clone())
            }
            _ => Err(PersistenceError::LeaseLost(lease.instance_id.clone())),
        }
    }
}
