//! Error types for workflow-core.

use crate::instance::WorkflowStatus;

/// A malformed workflow graph or binding, reported at build or registration time.
///
/// These never reach a running instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    /// The builder produced no steps.
    #[error("Workflow '{0}' has no steps")]
    EmptyWorkflow(String),
    /// A field selector could not be parsed.
    #[error("Invalid field path '{0}'")]
    InvalidPath(String),
    /// A binding refers to a field the workflow data type does not declare.
    #[error("Step '{step}': data type has no field '{path}'")]
    UnknownDataField { step: String, path: String },
    /// A binding refers to a property the step type does not declare.
    #[error("Step '{step}': step type has no property '{path}'")]
    UnknownStepProperty { step: String, path: String },
    /// The two ends of a binding carry incompatible value types.
    #[error("Step '{step}': cannot bind {source_path} ({source_type}) to {target_path} ({target_type})")]
    IncompatibleBinding {
        step: String,
        source_path: String,
        source_type: String,
        target_path: String,
        target_type: String,
    },
    /// Two steps in one definition share a name.
    #[error("Duplicate step name: '{0}'")]
    DuplicateStepName(String),
    /// A branch points at a step name that does not exist.
    #[error("Step '{step}': branch '{outcome}' targets unknown step '{target}'")]
    UnknownBranchTarget {
        step: String,
        outcome: String,
        target: String,
    },
    /// `(id, version)` is already registered with a different graph.
    #[error("Workflow '{id}' version {version} is already registered with a different definition")]
    Conflict { id: String, version: u32 },
}

/// A binding that could not be resolved against runtime values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// The selected path is absent from the value.
    #[error("Path '{0}' is missing")]
    MissingPath(String),
    /// The value at the path does not satisfy the declared type.
    #[error("Path '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },
    /// A value could not be converted to or from its typed form.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MappingError {
    fn from(e: serde_json::Error) -> Self {
        MappingError::Serialization(e.to_string())
    }
}

/// Unified error type for engine-facing workflow operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    /// Unknown definition, instance or step type.
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    /// A stale write was rejected by the persistence layer.
    #[error("Concurrency conflict on instance '{instance_id}': expected etag {expected}, found {actual}")]
    ConcurrencyConflict {
        instance_id: String,
        expected: u64,
        actual: u64,
    },
    /// A status change outside the instance state machine.
    #[error("Invalid status transition for '{instance_id}': {from:?} -> {to:?}")]
    InvalidTransition {
        instance_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    /// Persistence backend failure other than not-found or conflict.
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        WorkflowError::Serialization(e.to_string())
    }
}
