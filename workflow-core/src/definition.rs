//! Workflow definitions and their builder.
//!
//! A [`WorkflowDefinition`] is an immutable, versioned, ordered list of steps.
//! Each step names its implementation type, its input and output bindings, and
//! a branch table. The builder validates every binding against the declared
//! schemas of the workflow data type and the step type, so a definition that
//! builds successfully can only fail to map at runtime on values (missing
//! optional data, nulls), never on shape.
//!
//! ```rust,ignore
//! let definition = WorkflowBuilder::<MyData>::new("DataIOWorkflow", 1)
//!     .start_with::<AddNumbers>()
//!     .input("input1", "value1")
//!     .input("input2", "value2")
//!     .output("value3", "output")
//!     .build()?;
//! ```

use crate::data::{DataSchema, FieldPath, FieldSpec, Schema, ValueType};
use crate::error::{DefinitionError, MappingError};
use crate::step::{StepBody, StepFactory, factory_for};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;

/// Checks that a value conforms to a definition's data type.
pub type DataValidator = fn(&Value) -> Result<(), MappingError>;

/// A validated mapping between a workflow data field and a step property.
///
/// `ty` and `nullable` describe the receiving end: the step property for
/// inputs, the data field for outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub data_path: FieldPath,
    pub step_path: FieldPath,
    pub ty: ValueType,
    pub nullable: bool,
}

/// One step of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDefinition {
    pub index: usize,
    pub name: String,
    pub step_type: String,
    pub inputs: Vec<Binding>,
    pub outputs: Vec<Binding>,
    /// Outcome tag to target step index.
    pub branches: BTreeMap<String, usize>,
}

impl StepDefinition {
    /// Index of the step to run after this one.
    ///
    /// Unknown outcomes fall through to the following step.
    pub fn next_index(&self, outcome: Option<&str>) -> usize {
        outcome
            .and_then(|tag| self.branches.get(tag).copied())
            .unwrap_or(self.index + 1)
    }
}

/// An immutable, versioned workflow graph over data type `data_type`.
pub struct WorkflowDefinition {
    id: String,
    version: u32,
    data_type: String,
    steps: Vec<StepDefinition>,
    validator: DataValidator,
    factories: HashMap<String, StepFactory>,
}

impl WorkflowDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Type name of the workflow data.
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Check that `data` conforms to the declared data type.
    pub fn validate_data(&self, data: &Value) -> Result<(), MappingError> {
        (self.validator)(data)
    }

    /// Factories for the step types this definition was built with.
    pub fn step_factories(&self) -> impl Iterator<Item = (&str, &StepFactory)> {
        self.factories.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether two definitions describe the same graph.
    ///
    /// Compares identity, data type and steps; factories are not compared.
    pub fn same_graph(&self, other: &WorkflowDefinition) -> bool {
        self.id == other.id
            && self.version == other.version
            && self.data_type == other.data_type
            && self.steps == other.steps
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("data_type", &self.data_type)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

fn validate_as<D: DeserializeOwned>(value: &Value) -> Result<(), MappingError> {
    D::deserialize(value).map(|_| ()).map_err(MappingError::from)
}

struct PendingStep {
    name: Option<String>,
    step_type: &'static str,
    schema: Schema,
    inputs: Vec<(String, String)>,
    outputs: Vec<(String, String)>,
    branches: Vec<(String, String)>,
}

/// Builder for a [`WorkflowDefinition`] over data type `D`.
pub struct WorkflowBuilder<D> {
    id: String,
    version: u32,
    steps: Vec<PendingStep>,
    factories: HashMap<String, StepFactory>,
    _phantom: PhantomData<fn() -> D>,
}

/// A [`WorkflowBuilder`] positioned on its most recently added step.
pub struct StepBuilder<D> {
    workflow: WorkflowBuilder<D>,
}

impl<D> WorkflowBuilder<D>
where
    D: DataSchema + Serialize + DeserializeOwned + 'static,
{
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            steps: Vec::new(),
            factories: HashMap::new(),
            _phantom: PhantomData,
        }
    }

    /// Add the first step.
    pub fn start_with<S: StepBody>(self) -> StepBuilder<D> {
        StepBuilder {
            workflow: self.push::<S>(),
        }
    }

    fn push<S: StepBody>(mut self) -> Self {
        self.factories
            .entry(S::step_type().to_string())
            .or_insert_with(factory_for::<S>);
        self.steps.push(PendingStep {
            name: None,
            step_type: S::step_type(),
            schema: S::schema(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            branches: Vec::new(),
        });
        self
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::EmptyWorkflow(self.id));
        }

        let data_schema = D::schema();
        data_schema.check()?;
        let names: Vec<String> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| s.name.clone().unwrap_or_else(|| format!("step-{i}")))
            .collect();

        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(DefinitionError::DuplicateStepName(name.clone()));
            }
        }
        let index_of: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, pending) in self.steps.iter().enumerate() {
            let name = &names[index];
            pending.schema.check()?;
            let ends = BindingEnds {
                step: name,
                data: &data_schema,
                props: &pending.schema,
            };

            let inputs = pending
                .inputs
                .iter()
                .map(|(prop, data)| ends.input(prop, data))
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = pending
                .outputs
                .iter()
                .map(|(data, prop)| ends.output(data, prop))
                .collect::<Result<Vec<_>, _>>()?;

            let mut branches = BTreeMap::new();
            for (outcome, target) in &pending.branches {
                let target_index = index_of.get(target.as_str()).copied().ok_or_else(|| {
                    DefinitionError::UnknownBranchTarget {
                        step: name.clone(),
                        outcome: outcome.clone(),
                        target: target.clone(),
                    }
                })?;
                branches.insert(outcome.clone(), target_index);
            }

            steps.push(StepDefinition {
                index,
                name: name.clone(),
                step_type: pending.step_type.to_string(),
                inputs,
                outputs,
                branches,
            });
        }

        Ok(WorkflowDefinition {
            id: self.id,
            version: self.version,
            data_type: std::any::type_name::<D>().to_string(),
            steps,
            validator: validate_as::<D>,
            factories: self.factories,
        })
    }
}

impl<D> StepBuilder<D>
where
    D: DataSchema + Serialize + DeserializeOwned + 'static,
{
    fn current(&mut self) -> &mut PendingStep {
        // start_with/then always push before handing out a StepBuilder
        let last = self.workflow.steps.len() - 1;
        &mut self.workflow.steps[last]
    }

    /// Name the current step so branches can target it.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.current().name = Some(name.into());
        self
    }

    /// Bind step property `step_property` from data field `data_field`.
    #[must_use]
    pub fn input(mut self, step_property: &str, data_field: &str) -> Self {
        self.current()
            .inputs
            .push((step_property.to_string(), data_field.to_string()));
        self
    }

    /// Bind data field `data_field` from step property `step_property`.
    #[must_use]
    pub fn output(mut self, data_field: &str, step_property: &str) -> Self {
        self.current()
            .outputs
            .push((data_field.to_string(), step_property.to_string()));
        self
    }

    /// On `Branch(outcome)`, continue at the step named `target`.
    #[must_use]
    pub fn when(mut self, outcome: &str, target: &str) -> Self {
        self.current()
            .branches
            .push((outcome.to_string(), target.to_string()));
        self
    }

    /// Add the next step in sequence.
    pub fn then<S: StepBody>(self) -> StepBuilder<D> {
        StepBuilder {
            workflow: self.workflow.push::<S>(),
        }
    }

    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        self.workflow.build()
    }
}

struct BindingEnds<'a> {
    step: &'a str,
    data: &'a Schema,
    props: &'a Schema,
}

impl BindingEnds<'_> {
    fn resolve(&self, data: &str, prop: &str) -> Result<(FieldPath, FieldSpec, FieldPath, FieldSpec), DefinitionError> {
        let data_path = FieldPath::parse(data)?;
        let step_path = FieldPath::parse(prop)?;
        let data_spec = self
            .data
            .resolve(&data_path)
            .ok_or_else(|| DefinitionError::UnknownDataField {
                step: self.step.to_string(),
                path: data.to_string(),
            })?;
        let prop_spec = self
            .props
            .resolve(&step_path)
            .ok_or_else(|| DefinitionError::UnknownStepProperty {
                step: self.step.to_string(),
                path: prop.to_string(),
            })?;
        Ok((data_path, data_spec, step_path, prop_spec))
    }

    fn incompatible(&self, source: (&FieldPath, ValueType), target: (&FieldPath, ValueType)) -> DefinitionError {
        DefinitionError::IncompatibleBinding {
            step: self.step.to_string(),
            source_path: source.0.to_string(),
            source_type: source.1.to_string(),
            target_path: target.0.to_string(),
            target_type: target.1.to_string(),
        }
    }

    fn input(&self, prop: &str, data: &str) -> Result<Binding, DefinitionError> {
        let (data_path, data_spec, step_path, prop_spec) = self.resolve(data, prop)?;
        if !prop_spec.ty.accepts(data_spec.ty) {
            return Err(self.incompatible((&data_path, data_spec.ty), (&step_path, prop_spec.ty)));
        }
        Ok(Binding {
            data_path,
            step_path,
            ty: prop_spec.ty,
            nullable: prop_spec.nullable,
        })
    }

    fn output(&self, data: &str, prop: &str) -> Result<Binding, DefinitionError> {
        let (data_path, data_spec, step_path, prop_spec) = self.resolve(data, prop)?;
        if !data_spec.ty.accepts(prop_spec.ty) {
            return Err(self.incompatible((&step_path, prop_spec.ty), (&data_path, data_spec.ty)));
        }
        Ok(Binding {
            data_path,
            step_path,
            ty: data_spec.ty,
            nullable: data_spec.nullable,
        })
    }
}
