//! The public entry point for hosting workflows.

use crate::context::EngineContext;
use crate::scheduler::Scheduler;
use crate::worker::{CycleOutcome, Worker};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use workflow_core::definition::WorkflowDefinition;
use workflow_core::error::{DefinitionError, WorkflowError};
use workflow_core::instance::WorkflowInstance;
use workflow_core::step::StepBody;
use workflow_persistence::PersistenceError;

struct Running {
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the registries, the persistence provider and the background scheduler.
///
/// # Example
///
/// ```rust,ignore
/// let host = WorkflowHost::new(EngineContext::new(InMemoryProvider::new(), EngineConfig::default()));
/// host.register_workflow(definition)?;
/// host.start();
///
/// let id = host.start_workflow("data-io", None, &Numbers { value1: 2, value2: 3, ..Default::default() }).await?;
/// // ...
/// host.stop().await;
/// ```
pub struct WorkflowHost {
    context: Arc<EngineContext>,
    hint: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

impl WorkflowHost {
    pub fn new(context: EngineContext) -> Self {
        Self {
            context: Arc::new(context),
            hint: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Register a definition and the step types it was built with.
    ///
    /// # Errors
    ///
    /// Returns `DefinitionError::Conflict` if a different definition is already
    /// registered under the same id and version.
    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let definition = Arc::new(definition);
        self.context.registry.register(Arc::clone(&definition))?;
        for (step_type, factory) in definition.step_factories() {
            self.context
                .steps
                .register_factory(step_type, Arc::clone(factory));
        }
        tracing::info!(
            workflow = %definition.id(),
            version = definition.version(),
            steps = definition.steps().len(),
            "Registered workflow"
        );
        Ok(definition)
    }

    /// Register a step type that no registered definition references yet.
    pub fn register_step<S: StepBody>(&self) {
        self.context.steps.register::<S>();
    }

    /// Start the scheduler and workers. Calling it again while running does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            tracing::debug!("Host already running");
            return;
        }

        let cancellation = CancellationToken::new();
        let handles = Scheduler::new(
            Arc::clone(&self.context),
            Arc::clone(&self.hint),
            cancellation.clone(),
        )
        .spawn();
        *running = Some(Running {
            cancellation,
            handles,
        });
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop polling, let in-flight cycles finish within `stop_timeout`, then
    /// abort whatever is left. Calling it on a stopped host does nothing.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running {
            cancellation,
            mut handles,
        }) = running
        else {
            return;
        };

        cancellation.cancel();
        let timeout = self.context.config.stop_timeout;
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles.iter_mut())).await;
        if joined.is_err() {
            tracing::warn!(
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Workers did not stop in time, aborting"
            );
            for handle in &handles {
                handle.abort();
            }
        }
        tracing::info!("Host stopped");
    }

    /// Create a new instance of a registered workflow.
    ///
    /// `version` of `None` picks the highest registered version.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::NotFound` for an unknown definition and
    /// `WorkflowError::Mapping` if `data` does not conform to its data type.
    pub async fn start_workflow<D: Serialize>(
        &self,
        definition_id: &str,
        version: Option<u32>,
        data: &D,
    ) -> Result<String, WorkflowError> {
        let definition = self.context.registry.lookup(definition_id, version)?;
        let data = serde_json::to_value(data)?;
        definition.validate_data(&data)?;

        let instance = WorkflowInstance::new(
            uuid::Uuid::new_v4().to_string(),
            definition.id(),
            definition.version(),
            data,
        );
        let id = self.context.persistence.create_instance(instance).await?;
        self.hint.notify_one();

        tracing::info!(
            instance_id = %id,
            workflow = %definition.id(),
            version = definition.version(),
            "Started workflow"
        );
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns `WorkflowError::NotFound` if the instance does not exist.
    pub async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        Ok(self.context.persistence.get_instance(instance_id).await?)
    }

    /// Terminate an instance from outside the engine.
    ///
    /// Returns `false` if it had already reached a terminal status. A worker
    /// mid-step on the instance loses its persist to this write.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::NotFound` if the instance does not exist.
    pub async fn terminate_workflow(
        &self,
        instance_id: &str,
        reason: impl Into<String>,
    ) -> Result<bool, WorkflowError> {
        let reason = reason.into();
        loop {
            let mut instance = self.context.persistence.get_instance(instance_id).await?;
            if instance.is_terminal() {
                return Ok(false);
            }
            instance.terminate(reason.clone())?;
            match self.context.persistence.persist_instance(&instance).await {
                Ok(_) => {
                    tracing::info!(instance_id = %instance_id, reason = %reason, "Workflow terminated");
                    return Ok(true);
                }
                Err(PersistenceError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run a single worker cycle on `instance_id` in the caller's task.
    ///
    /// Takes the same lease a background worker would, so it is safe to call
    /// while the host is running.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failures other than an etag conflict.
    pub async fn step_once(&self, instance_id: &str) -> Result<CycleOutcome, WorkflowError> {
        let worker = Worker::new(
            format!("{}-inline", self.context.config.node_id),
            Arc::clone(&self.context),
            CancellationToken::new(),
        );
        worker.run_cycle(instance_id).await
    }
}

impl Drop for WorkflowHost {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.cancellation.cancel();
        }
    }
}
