//! Persistence layer for workflow instances.
//!
//! This crate provides the persistence contract the engine relies on and a
//! reference in-memory implementation.
//!
//! # Architecture
//!
//! - **PersistenceProvider**: A trait that abstracts the storage mechanism
//!   for instance records and their leases.
//! - **InMemoryProvider**: A reference implementation using in-memory HashMaps.
//!
//! # Implementing Custom Providers
//!
//! To implement a custom provider (e.g., Redis, PostgreSQL):
//!
//! 1. Add `workflow-persistence` as a dependency
//! 2. Implement the `PersistenceProvider` trait
//! 3. Make `persist_instance` a conditional write on the etag column
//! 4. Make `acquire_lease` a compare-and-swap on `(owner, token, expires_at)`
//!
//! ```rust,ignore
//! use workflow_persistence::{PersistenceProvider, PersistenceError};
//! use async_trait::async_trait;
//!
//! pub struct PostgresProvider {
//!     // your connection pool
//! }
//!
//! #[async_trait]
//! impl PersistenceProvider for PostgresProvider {
//!     async fn persist_instance(&self, instance: &WorkflowInstance) -> Result<u64, PersistenceError> {
//!         // UPDATE instances SET ..., etag = etag + 1 WHERE id = $1 AND etag = $2
//!     }
//!     // ... implement other methods
//! }
//! ```

mod backend;
mod in_memory;

pub use backend::{PersistenceError, PersistenceProvider};
pub use in_memory::InMemoryProvider;
