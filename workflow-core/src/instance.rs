//! Workflow instance records.
//!
//! An instance is the persisted state of one execution of a definition: its
//! data, the index of the next step, the history of applied steps and the
//! optimistic-concurrency token. Status changes go through the mutators on
//! [`WorkflowInstance`], which reject anything outside the state machine.

use crate::error::WorkflowError;
use crate::mapper::AppliedValues;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Persisted lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Runnable,
    Suspended,
    Complete,
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Complete | WorkflowStatus::Terminated)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Runnable, Runnable)
                | (Runnable, Complete)
                | (Runnable, Suspended)
                | (Runnable, Terminated)
                | (Suspended, Runnable)
                | (Suspended, Terminated)
        )
    }
}

/// What happened when a step ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Proceeded,
    Slept { until: DateTime<Utc> },
    Branched { outcome: String, target: usize },
    Failed { reason: String, retryable: bool },
}

/// Audit record of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub step_name: String,
    pub inputs_applied: AppliedValues,
    pub outputs_applied: AppliedValues,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: WorkflowStatus,
    /// The workflow data, serialized.
    pub data: Value,
    /// Index of the next step to run.
    pub execution_pointer: usize,
    pub step_history: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retries spent on the current step.
    pub retry_count: u32,
    /// Optimistic-concurrency token, assigned by the persistence provider.
    pub etag: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a runnable instance positioned on the first step.
    pub fn new(
        id: impl Into<String>,
        definition_id: impl Into<String>,
        definition_version: u32,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            definition_id: definition_id.into(),
            definition_version,
            status: WorkflowStatus::Runnable,
            data,
            execution_pointer: 0,
            step_history: Vec::new(),
            resume_at: None,
            error: None,
            retry_count: 0,
            etag: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the instance belongs in the runnable set at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            WorkflowStatus::Runnable => self.resume_at.is_none_or(|at| at <= now),
            WorkflowStatus::Suspended => self.resume_at.is_some_and(|at| at <= now),
            WorkflowStatus::Complete | WorkflowStatus::Terminated => false,
        }
    }

    /// The time the instance became or becomes due, for ordering.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.resume_at.unwrap_or(self.created_at)
    }

    /// Deserialize the workflow data.
    pub fn data_as<D: DeserializeOwned>(&self) -> Result<D, WorkflowError> {
        Ok(D::deserialize(&self.data)?)
    }

    fn transition(&mut self, next: WorkflowStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                instance_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Move a due suspended instance back to runnable.
    pub fn wake(&mut self) -> Result<(), WorkflowError> {
        if self.status == WorkflowStatus::Suspended {
            self.transition(WorkflowStatus::Runnable)?;
            self.resume_at = None;
        }
        Ok(())
    }

    /// Move to step `index`, completing the instance when it is past the end.
    pub fn advance_to(&mut self, index: usize, step_count: usize) -> Result<(), WorkflowError> {
        self.retry_count = 0;
        self.resume_at = None;
        self.execution_pointer = index;
        if index >= step_count {
            self.transition(WorkflowStatus::Complete)?;
            self.completed_at = Some(Utc::now());
        } else {
            self.transition(WorkflowStatus::Runnable)?;
        }
        Ok(())
    }

    /// Suspend until `until`, staying on the current step.
    pub fn suspend_until(&mut self, until: DateTime<Utc>) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Suspended)?;
        self.resume_at = Some(until);
        Ok(())
    }

    /// Keep the instance runnable but hold it back until `at`.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>, reason: String) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Runnable)?;
        self.retry_count += 1;
        self.resume_at = Some(at);
        self.error = Some(reason);
        Ok(())
    }

    pub fn terminate(&mut self, reason: impl Into<String>) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Terminated)?;
        self.error = Some(reason.into());
        self.resume_at = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn record(&mut self, record: StepRecord) {
        self.step_history.push(record);
    }
}
