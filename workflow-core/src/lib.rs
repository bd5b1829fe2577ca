//! Core model for resumable workflows: definitions, step contract, data
//! mapping and instance records.

extern crate self as workflow_core;

pub mod data;
pub mod definition;
pub mod error;
pub mod instance;
pub mod lease;
pub mod mapper;
pub mod registry;
pub mod step;

pub use data::{DataSchema, FieldPath, FieldSpec, Schema, ValueType};
pub use definition::{Binding, StepBuilder, StepDefinition, WorkflowBuilder, WorkflowDefinition};
pub use error::{DefinitionError, MappingError, WorkflowError};
pub use instance::{StepOutcome, StepRecord, WorkflowInstance, WorkflowStatus};
pub use lease::Lease;
pub use registry::{StepRegistry, WorkflowRegistry};
pub use step::{ErasedStep, ExecutionResult, StepBody, StepContext, StepFactory};

/// Derive [`DataSchema`](data::DataSchema) for a struct with named fields.
pub use workflow_macros::DataSchema;
