//! The step contract: user-supplied units of work.

use crate::data::DataSchema;
use crate::error::MappingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the engine should proceed after a step has run.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Advance to the following step.
    Proceed,
    /// Suspend the instance until `until`.
    Sleep { until: DateTime<Utc> },
    /// Advance through the step's branch table.
    Branch { outcome: String },
    /// The step failed. Retryable failures are rescheduled with backoff.
    Fail { reason: String, retryable: bool },
}

impl ExecutionResult {
    pub fn proceed() -> Self {
        ExecutionResult::Proceed
    }

    pub fn sleep_until(until: DateTime<Utc>) -> Self {
        ExecutionResult::Sleep { until }
    }

    /// Sleep for `duration` from now. Saturates on overflow.
    pub fn sleep_for(duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        ExecutionResult::Sleep {
            until: now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn branch(outcome: impl Into<String>) -> Self {
        ExecutionResult::Branch {
            outcome: outcome.into(),
        }
    }

    /// A failure that terminates the instance.
    pub fn fail(reason: impl Into<String>) -> Self {
        ExecutionResult::Fail {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// A failure that is retried after a backoff.
    pub fn retry(reason: impl Into<String>) -> Self {
        ExecutionResult::Fail {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Whether output bindings should be applied for this result.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            ExecutionResult::Proceed | ExecutionResult::Branch { .. }
        )
    }
}

/// A context passed to a step when it is run.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: String,
    pub definition_id: String,
    pub definition_version: u32,
    pub step_index: usize,
    pub step_name: String,
    /// Retries already spent on this step.
    pub attempt: u32,
    cancellation: CancellationToken,
}

impl StepContext {
    pub fn new(
        instance_id: impl Into<String>,
        definition_id: impl Into<String>,
        definition_version: u32,
        step_index: usize,
        step_name: impl Into<String>,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            definition_id: definition_id.into(),
            definition_version,
            step_index,
            step_name: step_name.into(),
            attempt,
            cancellation,
        }
    }

    /// Whether the host is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the host starts shutting down.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// A unit of work within a workflow.
///
/// The step's serialized fields are its properties: the engine deserializes
/// input bindings into a fresh `Default` instance before `run`, and reads output
/// bindings back out afterwards.
///
/// Returning `Err` is treated as a non-retryable failure. Return
/// [`ExecutionResult::retry`] to request a retry instead.
///
/// # Example
///
/// ```rust
/// use workflow_core::{DataSchema, ExecutionResult, StepBody, StepContext};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default, Serialize, Deserialize, DataSchema)]
/// struct AddNumbers {
///     input1: i64,
///     input2: i64,
///     output: i64,
/// }
///
/// #[async_trait::async_trait]
/// impl StepBody for AddNumbers {
///     async fn run(&mut self, _ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
///         self.output = self.input1 + self.input2;
///         Ok(ExecutionResult::proceed())
///     }
/// }
/// ```
#[async_trait]
pub trait StepBody: Serialize + DeserializeOwned + DataSchema + Default + Send + Sync + 'static {
    async fn run(&mut self, context: &StepContext) -> anyhow::Result<ExecutionResult>;

    /// Name under which the step type is registered.
    fn step_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Object-safe view of a [`StepBody`] operating on JSON properties.
#[async_trait]
pub trait ErasedStep: Send {
    /// Current property values.
    fn properties(&self) -> Result<Value, MappingError>;

    /// Replace the step's state with `properties`.
    fn load(&mut self, properties: Value) -> Result<(), MappingError>;

    async fn run(&mut self, context: &StepContext) -> ExecutionResult;
}

/// Creates a fresh step for each execution.
pub type StepFactory = Arc<dyn Fn() -> Box<dyn ErasedStep> + Send + Sync>;

/// Build the factory for a step type.
pub fn factory_for<S: StepBody>() -> StepFactory {
    Arc::new(|| -> Box<dyn ErasedStep> { Box::new(StepWrapper(S::default())) })
}

/// Wrapper that converts a typed step into an untyped one.
struct StepWrapper<S>(S);

#[async_trait]
impl<S: StepBody> ErasedStep for StepWrapper<S> {
    fn properties(&self) -> Result<Value, MappingError> {
        Ok(serde_json::to_value(&self.0)?)
    }

    fn load(&mut self, properties: Value) -> Result<(), MappingError> {
        self.0 = serde_json::from_value(properties)?;
        Ok(())
    }

    async fn run(&mut self, context: &StepContext) -> ExecutionResult {
        match self.0.run(context).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::fail(format!("{e:#}")),
        }
    }
}
