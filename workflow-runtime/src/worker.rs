//! Lease-holding worker that advances one instance by one step.
//!
//! A worker cycle leases an instance, loads a fresh snapshot, maps inputs,
//! runs the step, interprets its result, maps outputs and persists the new
//! state with an etag comparison before releasing the lease. A crash anywhere
//! before the persist simply loses the in-memory progress: the lease expires
//! and another worker replays the step from the last persisted pointer.

use crate::context::EngineContext;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::{CancellationToken, DropGuard};
use workflow_core::definition::{StepDefinition, WorkflowDefinition};
use workflow_core::error::WorkflowError;
use workflow_core::instance::{StepOutcome, StepRecord, WorkflowInstance, WorkflowStatus};
use workflow_core::lease::Lease;
use workflow_core::mapper::{self, AppliedValues};
use workflow_core::step::{ExecutionResult, StepContext};
use workflow_persistence::PersistenceError;

/// What a single worker cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another worker holds the lease.
    Busy,
    /// The instance was terminal, not yet due, or its definition is not
    /// registered on this node.
    Skipped,
    /// The cycle's result was persisted; carries the new status.
    Persisted(WorkflowStatus),
    /// The persist lost an etag race and the cycle's work was dropped.
    Conflict,
    /// The host is shutting down.
    Cancelled,
}

/// Executes worker cycles on behalf of one lease owner.
#[derive(Clone)]
pub struct Worker {
    worker_id: String,
    context: Arc<EngineContext>,
    cancellation: CancellationToken,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        context: Arc<EngineContext>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            context,
            cancellation,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Lease `instance_id`, advance it by one step and release the lease.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failures other than an etag conflict.
    pub async fn run_cycle(&self, instance_id: &str) -> Result<CycleOutcome, WorkflowError> {
        if self.cancellation.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        let persistence = &self.context.persistence;
        let lease = persistence
            .acquire_lease(instance_id, &self.worker_id, self.context.config.lease_ttl_chrono())
            .await?;
        let Some(lease) = lease else {
            tracing::debug!(
                instance_id = %instance_id,
                worker_id = %self.worker_id,
                "Instance is leased by another worker"
            );
            return Ok(CycleOutcome::Busy);
        };

        let result = self.execute_leased(&lease).await;

        if let Err(e) = persistence.release_lease(&lease).await {
            tracing::debug!(
                instance_id = %instance_id,
                worker_id = %self.worker_id,
                error = %e,
                "Lease was lost before release"
            );
        }
        result
    }

    async fn execute_leased(&self, lease: &Lease) -> Result<CycleOutcome, WorkflowError> {
        let mut instance = self.context.persistence.get_instance(&lease.instance_id).await?;
        if instance.is_terminal() || !instance.is_due(Utc::now()) {
            tracing::debug!(
                instance_id = %instance.id,
                status = ?instance.status,
                "Instance is not due, skipping"
            );
            return Ok(CycleOutcome::Skipped);
        }

        let definition = match self
            .context
            .registry
            .lookup(&instance.definition_id, Some(instance.definition_version))
        {
            Ok(definition) => definition,
            Err(e) => {
                // Another node may know this definition; leave the instance as is
                tracing::warn!(
                    instance_id = %instance.id,
                    workflow = %instance.definition_id,
                    version = instance.definition_version,
                    error = %e,
                    "Definition not registered on this node, skipping"
                );
                return Ok(CycleOutcome::Skipped);
            }
        };
        let Some(step) = definition.step(instance.execution_pointer) else {
            let reason = format!(
                "execution pointer {} is outside the definition",
                instance.execution_pointer
            );
            instance.terminate(reason)?;
            return self.persist(instance).await;
        };

        let started_at = Utc::now();
        match self.execute_step(&definition, step, &mut instance, lease).await {
            Ok(()) => {}
            Err(WorkflowError::Mapping(e)) => {
                tracing::error!(
                    instance_id = %instance.id,
                    step = %step.name,
                    error = %e,
                    "Mapping failed, terminating instance"
                );
                let reason = format!("mapping error in step '{}': {e}", step.name);
                instance.record(StepRecord {
                    step_index: step.index,
                    step_name: step.name.clone(),
                    inputs_applied: AppliedValues::new(),
                    outputs_applied: AppliedValues::new(),
                    outcome: StepOutcome::Failed {
                        reason: reason.clone(),
                        retryable: false,
                    },
                    started_at,
                    completed_at: Utc::now(),
                });
                instance.terminate(reason)?;
            }
            Err(e) => return Err(e),
        }
        self.persist(instance).await
    }

    /// Run the current step and apply its result to `instance` in memory.
    async fn execute_step(
        &self,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        instance: &mut WorkflowInstance,
        lease: &Lease,
    ) -> Result<(), WorkflowError> {
        instance.wake()?;

        let Some(mut body) = self.context.steps.get(&step.step_type) else {
            instance.terminate(format!("step type '{}' is not registered", step.step_type))?;
            return Ok(());
        };

        let started_at = Utc::now();
        let mut properties = body.properties()?;
        let inputs = mapper::map_inputs(definition, step, &instance.data, &mut properties)?;
        body.load(properties)?;

        let context = StepContext::new(
            instance.id.clone(),
            definition.id(),
            definition.version(),
            step.index,
            step.name.clone(),
            instance.retry_count,
            self.cancellation.clone(),
        );

        tracing::debug!(
            instance_id = %instance.id,
            step = %step.name,
            worker_id = %self.worker_id,
            "Executing step"
        );
        let heartbeat = self.start_heartbeat(lease);
        let result = match AssertUnwindSafe(body.run(&context)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    instance_id = %instance.id,
                    step = %step.name,
                    panic = %message,
                    "Step panicked"
                );
                ExecutionResult::fail(format!("step panicked: {message}"))
            }
        };
        drop(heartbeat);

        let mut record = StepRecord {
            step_index: step.index,
            step_name: step.name.clone(),
            inputs_applied: inputs,
            outputs_applied: AppliedValues::new(),
            outcome: StepOutcome::Proceeded,
            started_at,
            completed_at: Utc::now(),
        };

        match result {
            ExecutionResult::Proceed | ExecutionResult::Branch { .. } => {
                let outcome = match &result {
                    ExecutionResult::Branch { outcome } => Some(outcome.as_str()),
                    _ => None,
                };
                let next = step.next_index(outcome);

                let mut data = instance.data.clone();
                record.outputs_applied =
                    mapper::map_outputs(definition, step, &body.properties()?, &mut data)?;
                definition.validate_data(&data)?;
                instance.data = data;

                if let Some(tag) = outcome {
                    record.outcome = StepOutcome::Branched {
                        outcome: tag.to_string(),
                        target: next,
                    };
                }
                instance.record(record);
                instance.error = None;
                instance.advance_to(next, definition.steps().len())?;
                if instance.status == WorkflowStatus::Complete {
                    tracing::info!(
                        instance_id = %instance.id,
                        workflow = %definition.id(),
                        "Workflow complete"
                    );
                }
            }
            ExecutionResult::Sleep { until } => {
                record.outcome = StepOutcome::Slept { until };
                instance.record(record);
                instance.suspend_until(until)?;
                tracing::debug!(
                    instance_id = %instance.id,
                    step = %step.name,
                    resume_at = %until,
                    "Step suspended the instance"
                );
            }
            ExecutionResult::Fail { reason, retryable } => {
                record.outcome = StepOutcome::Failed {
                    reason: reason.clone(),
                    retryable,
                };
                instance.record(record);
                self.apply_failure(instance, step, reason, retryable)?;
            }
        }
        Ok(())
    }

    fn apply_failure(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDefinition,
        reason: String,
        retryable: bool,
    ) -> Result<(), WorkflowError> {
        let policy = &self.context.config.retry;
        if !retryable {
            tracing::info!(
                instance_id = %instance.id,
                step = %step.name,
                reason = %reason,
                "Step failed, terminating instance"
            );
            return instance.terminate(reason);
        }
        if policy.exhausted(instance.retry_count) {
            tracing::info!(
                instance_id = %instance.id,
                step = %step.name,
                retries = instance.retry_count,
                "Retry limit reached, terminating instance"
            );
            let reason = format!(
                "retry limit exceeded after {} attempts: {reason}",
                instance.retry_count + 1
            );
            return instance.terminate(reason);
        }

        let delay = policy.backoff(instance.retry_count);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = Utc::now().checked_add_signed(delay).unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        tracing::warn!(
            instance_id = %instance.id,
            step = %step.name,
            retry = instance.retry_count + 1,
            resume_at = %at,
            reason = %reason,
            "Step failed, scheduling retry"
        );
        instance.schedule_retry(at, reason)
    }

    async fn persist(&self, mut instance: WorkflowInstance) -> Result<CycleOutcome, WorkflowError> {
        match self.context.persistence.persist_instance(&instance).await {
            Ok(etag) => {
                instance.etag = etag;
                if instance.status == WorkflowStatus::Terminated {
                    tracing::info!(
                        instance_id = %instance.id,
                        error = instance.error.as_deref().unwrap_or_default(),
                        "Workflow terminated"
                    );
                }
                Ok(CycleOutcome::Persisted(instance.status))
            }
            Err(PersistenceError::ConcurrencyConflict {
                instance_id,
                expected,
                actual,
            }) => {
                tracing::debug!(
                    instance_id = %instance_id,
                    expected,
                    actual,
                    "Stale snapshot, dropping step result"
                );
                Ok(CycleOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Periodically extend `lease` while a step runs.
    ///
    /// The heartbeat stops when the returned guard is dropped, including when
    /// the cycle itself is dropped mid-step.
    fn start_heartbeat(&self, lease: &Lease) -> Option<DropGuard> {
        let interval = self.context.config.heartbeat_interval?;
        let persistence = Arc::clone(&self.context.persistence);
        let ttl = self.context.config.lease_ttl_chrono();
        let mut lease = lease.clone();
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        tokio::spawn(async move {
            let mut timer = time::interval(interval);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = timer.tick() => {}
                }
                tracing::trace!(instance_id = %lease.instance_id, "Extending lease via heartbeat");
                match persistence.extend_lease(&lease, ttl).await {
                    Ok(extended) => lease = extended,
                    Err(PersistenceError::LeaseLost(_)) => {
                        tracing::warn!(
                            instance_id = %lease.instance_id,
                            owner = %lease.owner,
                            "Lease lost during step, stopping heartbeat"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            instance_id = %lease.instance_id,
                            error = %e,
                            "Failed to extend lease during heartbeat"
                        );
                    }
                }
            }
        });
        Some(stop.drop_guard())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
