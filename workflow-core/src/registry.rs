//! Registries for workflow definitions and step implementations.
//!
//! Definitions are looked up by `(id, version)`; step implementations by their
//! registered type name. Both registries are code, not data: every process
//! running the engine must register the same workflows and steps at startup.
//!
//! ```rust,ignore
//! let workflows = WorkflowRegistry::new();
//! workflows.register(Arc::new(definition))?;
//! let latest = workflows.lookup("DataIOWorkflow", None)?;
//! ```

use crate::definition::WorkflowDefinition;
use crate::error::{DefinitionError, WorkflowError};
use crate::step::{ErasedStep, StepBody, StepFactory, factory_for};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Maps step type names to factories creating fresh step instances.
#[derive(Default)]
pub struct StepRegistry {
    steps: RwLock<HashMap<String, StepFactory>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step type under [`StepBody::step_type`].
    pub fn register<S: StepBody>(&self) {
        self.register_factory(S::step_type(), factory_for::<S>());
    }

    /// Register a factory under an explicit type name, replacing any previous one.
    pub fn register_factory(&self, step_type: &str, factory: StepFactory) {
        self.steps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step_type.to_string(), factory);
    }

    /// Create a new step instance.
    ///
    /// Returns `None` if the type is not registered.
    pub fn get(&self, step_type: &str) -> Option<Box<dyn ErasedStep>> {
        self.steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_type)
            .map(|factory| factory())
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(step_type)
    }

    pub fn len(&self) -> usize {
        self.steps.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps `(id, version)` to immutable workflow definitions.
#[derive(Default)]
pub struct WorkflowRegistry {
    // id -> version -> definition; BTreeMap keeps the latest version last
    definitions: RwLock<HashMap<String, BTreeMap<u32, Arc<WorkflowDefinition>>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition.
    ///
    /// Re-registering an identical graph is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DefinitionError::Conflict` if `(id, version)` is already
    /// registered with a different graph.
    pub fn register(&self, definition: Arc<WorkflowDefinition>) -> Result<(), DefinitionError> {
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let versions = definitions.entry(definition.id().to_string()).or_default();
        if let Some(existing) = versions.get(&definition.version()) {
            if existing.same_graph(&definition) {
                return Ok(());
            }
            return Err(DefinitionError::Conflict {
                id: definition.id().to_string(),
                version: definition.version(),
            });
        }
        tracing::debug!(
            workflow = %definition.id(),
            version = definition.version(),
            "Registered workflow definition"
        );
        versions.insert(definition.version(), definition);
        Ok(())
    }

    /// Look up a definition; `None` selects the latest version.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::NotFound` if no matching definition exists.
    pub fn lookup(&self, id: &str, version: Option<u32>) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let found = definitions.get(id).and_then(|versions| match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        });
        found.cloned().ok_or_else(|| {
            WorkflowError::NotFound(match version {
                Some(v) => format!("workflow '{id}' version {v}"),
                None => format!("workflow '{id}'"),
            })
        })
    }

    pub fn contains(&self, id: &str, version: u32) -> bool {
        self.lookup(id, Some(version)).is_ok()
    }

    /// All registered definitions.
    pub fn definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
