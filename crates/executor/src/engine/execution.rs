//! The execution aggregate and the executor's private per-execution state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::state::{State, StateType};
use super::task_run::{TaskRun, TaskRunTree};
use crate::error::{AppError, AppResult};
use crate::flow::Flow;

/// Prefix reserved for labels written by the engine itself.
pub const SYSTEM_LABEL_PREFIX: &str = "flowrun.dev/";

/// Set on an execution by `restart`.
pub const LABEL_RESTARTED: &str = "flowrun.dev/restarted";

/// Set on the execution created by `replay`.
pub const LABEL_REPLAY: &str = "flowrun.dev/replay";

/// Key/value label attached to an execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.key.starts_with(SYSTEM_LABEL_PREFIX)
    }
}

/// What started the execution, when it was not a manual submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrigger {
    pub id: String,

    #[serde(rename = "type")]
    pub trigger_type: String,

    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Bumped by every in-place re-admission (restart, markAs).
    pub attempt_number: u32,

    pub original_created_date: DateTime<Utc>,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            attempt_number: 1,
            original_created_date: Utc::now(),
        }
    }
}

impl ExecutionMetadata {
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_number: self.attempt_number + 1,
            original_created_date: self.original_created_date,
        }
    }
}

/// One runtime instance of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    pub namespace: String,

    pub flow_id: String,

    pub flow_revision: i32,

    pub state: State,

    /// Task runs in dispatch order.
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,

    #[serde(default)]
    pub labels: Vec<Label>,

    #[serde(default)]
    pub inputs: Map<String, Value>,

    #[serde(default)]
    pub outputs: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<ExecutionTrigger>,

    /// Execution this one was replayed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub metadata: ExecutionMetadata,

    #[serde(default)]
    pub deleted: bool,
}

impl Execution {
    /// A new `CREATED` execution of the given flow revision.
    pub fn for_flow(flow: &Flow) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision,
            state: State::new(),
            task_run_list: Vec::new(),
            labels: Vec::new(),
            inputs: Map::new(),
            outputs: Map::new(),
            trigger: None,
            parent_id: None,
            metadata: ExecutionMetadata::default(),
            deleted: false,
        }
    }

    pub fn current(&self) -> StateType {
        self.state.current
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Lock and queue key of the owning flow.
    pub fn flow_key(&self) -> String {
        flow_key(self.tenant_id.as_deref(), &self.namespace, &self.flow_id)
    }

    pub fn with_state(&self, state: StateType) -> Execution {
        let mut execution = self.clone();
        execution.state = self.state.with_state(state);
        execution
    }

    pub fn tree(&self) -> TaskRunTree<'_> {
        TaskRunTree::new(&self.task_run_list)
    }

    pub fn find_task_run(&self, task_run_id: &str) -> AppResult<&TaskRun> {
        self.task_run_list
            .iter()
            .find(|run| run.id == task_run_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Task run '{}' in execution '{}'",
                    task_run_id, self.id
                ))
            })
    }

    /// Replace the task run with the same id.
    pub fn with_task_run(&self, task_run: TaskRun) -> AppResult<Execution> {
        let mut execution = self.clone();
        let slot = execution
            .task_run_list
            .iter_mut()
            .find(|run| run.id == task_run.id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Task run '{}' in execution '{}'",
                    task_run.id, self.id
                ))
            })?;
        *slot = task_run;
        Ok(execution)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.key == key)
            .map(|label| label.value.as_str())
    }

    /// Add a system label once; an existing label with the key is kept.
    pub fn with_system_label(&self, key: &str, value: &str) -> Execution {
        let mut execution = self.clone();
        if execution.label(key).is_none() {
            execution.labels.push(Label::new(key, value));
        }
        execution
    }

    /// Attach user labels, rejecting reserved keys. Duplicated keys keep the
    /// last value.
    pub fn with_user_labels(&self, labels: Vec<Label>) -> AppResult<Execution> {
        validate_user_labels(&labels)?;
        let mut execution = self.clone();
        for label in labels {
            match execution.labels.iter_mut().find(|l| l.key == label.key) {
                Some(existing) => existing.value = label.value,
                None => execution.labels.push(label),
            }
        }
        Ok(execution)
    }
}

/// Reject labels that only the engine may write.
pub fn validate_user_labels(labels: &[Label]) -> AppResult<()> {
    if let Some(label) = labels.iter().find(|label| label.is_system()) {
        return Err(AppError::Validation(format!(
            "Label '{}' is reserved for system use",
            label.key
        )));
    }
    Ok(())
}

pub fn flow_key(tenant_id: Option<&str>, namespace: &str, flow_id: &str) -> String {
    format!("{}/{}/{}", tenant_id.unwrap_or("main"), namespace, flow_id)
}

/// Executor-private state persisted next to the execution row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorState {
    /// `task_run_id:attempt_index` of every job handed to workers.
    #[serde(default)]
    pub dispatched: BTreeSet<String>,

    /// Terminal side effects (slot release, flow triggers) already ran for the
    /// current terminal state.
    #[serde(default)]
    pub terminal_handled: bool,
}

impl ExecutorState {
    pub fn dispatch_key(task_run_id: &str, attempt: usize) -> String {
        format!("{}:{}", task_run_id, attempt)
    }

    pub fn is_dispatched(&self, task_run_id: &str, attempt: usize) -> bool {
        self.dispatched
            .contains(&Self::dispatch_key(task_run_id, attempt))
    }

    pub fn mark_dispatched(&mut self, task_run_id: &str, attempt: usize) {
        self.dispatched
            .insert(Self::dispatch_key(task_run_id, attempt));
    }

    /// Clear terminal bookkeeping once the execution runs again.
    pub fn reopened(mut self) -> Self {
        self.terminal_handled = false;
        self
    }
}
