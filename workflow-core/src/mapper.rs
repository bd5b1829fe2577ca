//! Projects values between workflow data and step properties.
//!
//! This is the only code that reads or writes workflow data during execution.
//! Both directions return the values actually applied, keyed by the receiving
//! path, so the caller can record them in the step history.

use crate::definition::{Binding, StepDefinition, WorkflowDefinition};
use crate::error::MappingError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Values applied by a mapping pass, keyed by destination path.
pub type AppliedValues = BTreeMap<String, Value>;

/// Copy every input binding of `step` from `instance_data` into `step_properties`.
pub fn map_inputs(
    definition: &WorkflowDefinition,
    step: &StepDefinition,
    instance_data: &Value,
    step_properties: &mut Value,
) -> Result<AppliedValues, MappingError> {
    tracing::trace!(
        workflow = %definition.id(),
        step = %step.name,
        bindings = step.inputs.len(),
        "Mapping step inputs"
    );
    let mut applied = AppliedValues::new();
    for binding in &step.inputs {
        let value = read(binding, instance_data, Direction::Input)?;
        binding.step_path.set(step_properties, value.clone())?;
        applied.insert(binding.step_path.to_string(), value);
    }
    Ok(applied)
}

/// Copy every output binding of `step` from `step_properties` into `instance_data`.
///
/// Only called for results that advance the workflow.
pub fn map_outputs(
    definition: &WorkflowDefinition,
    step: &StepDefinition,
    step_properties: &Value,
    instance_data: &mut Value,
) -> Result<AppliedValues, MappingError> {
    tracing::trace!(
        workflow = %definition.id(),
        step = %step.name,
        bindings = step.outputs.len(),
        "Mapping step outputs"
    );
    let mut applied = AppliedValues::new();
    for binding in &step.outputs {
        let value = read(binding, step_properties, Direction::Output)?;
        binding.data_path.set(instance_data, value.clone())?;
        applied.insert(binding.data_path.to_string(), value);
    }
    Ok(applied)
}

#[derive(Clone, Copy)]
enum Direction {
    Input,
    Output,
}

fn read(binding: &Binding, from: &Value, direction: Direction) -> Result<Value, MappingError> {
    let (source, target) = match direction {
        Direction::Input => (&binding.data_path, &binding.step_path),
        Direction::Output => (&binding.step_path, &binding.data_path),
    };
    let value = source
        .get(from)
        .ok_or_else(|| MappingError::MissingPath(source.to_string()))?;
    binding.ty.check(target, value, binding.nullable)?;
    Ok(value.clone())
}
