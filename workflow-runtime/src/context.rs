use crate::config::EngineConfig;
use std::sync::Arc;
use workflow_core::registry::{StepRegistry, WorkflowRegistry};
use workflow_persistence::PersistenceProvider;

/// Everything the scheduler and workers share, built once at startup.
#[derive(Clone)]
pub struct EngineContext {
    pub registry: Arc<WorkflowRegistry>,
    pub steps: Arc<StepRegistry>,
    pub persistence: Arc<dyn PersistenceProvider>,
    pub config: EngineConfig,
}

impl EngineContext {
    /// Create a context with empty registries.
    pub fn new<P>(persistence: P, config: EngineConfig) -> Self
    where
        P: PersistenceProvider + 'static,
    {
        Self::with_registries(
            Arc::new(persistence),
            Arc::new(WorkflowRegistry::new()),
            Arc::new(StepRegistry::new()),
            config,
        )
    }

    /// Create a context around existing registries.
    pub fn with_registries(
        persistence: Arc<dyn PersistenceProvider>,
        registry: Arc<WorkflowRegistry>,
        steps: Arc<StepRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            steps,
            persistence,
            config,
        }
    }
}
