//! Flow definition types.
//!
//! A flow is a YAML document:
//! - `tasks`: the main branch, run in order
//! - `errors`: the error branch, run once after the main branch fails
//! - `concurrency`: per-flow admission limit and policy
//! - `triggers`: schedule and flow-completion triggers
//!
//! Task kinds are tagged by `type`: `task` (run by a worker), `sequential`,
//! `parallel`, `each` (loop over values) and `pause`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::execution::flow_key;
use crate::engine::state::StateType;

/// A flow revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,

    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Assigned by the flow repository.
    #[serde(default = "default_revision")]
    pub revision: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<FlowInput>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    pub tasks: Vec<Task>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Task>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Concurrency>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
}

fn default_revision() -> i32 {
    1
}

/// Declared execution input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInput {
    pub id: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Per-flow admission limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub limit: u32,

    #[serde(default)]
    pub behavior: ConcurrencyBehavior,
}

/// What happens to a submission over the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyBehavior {
    Cancel,
    Fail,
    #[default]
    Queue,
}

/// A task of the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    #[serde(flatten)]
    pub kind: TaskKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,

    /// A failure of this task ends its run in `WARNING` for its parents.
    #[serde(default)]
    pub allow_failure: bool,

    /// Precondition; when false the task run is `SKIPPED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Leaf executed by a worker.
    Task {
        #[serde(default)]
        params: Value,
    },
    /// Children run one after the other.
    Sequential { tasks: Vec<Task> },
    /// Children run side by side.
    Parallel { tasks: Vec<Task> },
    /// Children run once per value, iterations in order.
    Each { values: Vec<String>, tasks: Vec<Task> },
    /// Leaf held in `PAUSED` until resumed.
    Pause {},
}

/// Total attempts allowed, the first one included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retry {
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,

    #[serde(flatten)]
    pub kind: TriggerKind,

    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fires every `interval_secs`.
    Schedule { interval_secs: u64 },
    /// Fires when another execution terminates and all conditions hold.
    Flow {
        #[serde(default)]
        conditions: Vec<Condition>,
    },
}

/// Boolean predicate over an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    ExecutionStatus {
        #[serde(default, rename = "in")]
        in_states: Vec<StateType>,
        #[serde(default)]
        not_in: Vec<StateType>,
    },
    ExecutionFlow {
        namespace: String,
        flow_id: String,
    },
    ExecutionNamespace {
        namespace: String,
        #[serde(default)]
        prefix: bool,
    },
    ExecutionLabels {
        labels: BTreeMap<String, String>,
    },
    Not {
        conditions: Vec<Condition>,
    },
}

impl Task {
    /// Containers own child task runs and never carry attempts.
    pub fn is_flowable(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Sequential { .. } | TaskKind::Parallel { .. } | TaskKind::Each { .. }
        )
    }

    pub fn is_pause(&self) -> bool {
        matches!(self.kind, TaskKind::Pause {})
    }

    pub fn children(&self) -> &[Task] {
        match &self.kind {
            TaskKind::Sequential { tasks }
            | TaskKind::Parallel { tasks }
            | TaskKind::Each { tasks, .. } => tasks,
            TaskKind::Task { .. } | TaskKind::Pause {} => &[],
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1)
    }

    fn find(&self, task_id: &str) -> Option<&Task> {
        if self.id == task_id {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.find(task_id))
    }

    fn collect_ids(&self, ids: &mut Vec<String>) {
        ids.push(self.id.clone());
        for child in self.children() {
            child.collect_ids(ids);
        }
    }
}

impl Flow {
    pub fn key(&self) -> String {
        flow_key(self.tenant_id.as_deref(), &self.namespace, &self.id)
    }

    /// Look a task up anywhere in the main or error branch.
    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .chain(self.errors.iter())
            .find_map(|task| task.find(task_id))
    }

    pub fn all_task_ids(&self) -> BTreeSet<String> {
        self.task_ids_in_order().into_iter().collect()
    }

    /// Task ids in definition order, duplicates included.
    pub(crate) fn task_ids_in_order(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for task in self.tasks.iter().chain(self.errors.iter()) {
            task.collect_ids(&mut ids);
        }
        ids
    }

    /// Whether the task belongs to the error branch.
    pub fn is_error_task(&self, task_id: &str) -> bool {
        self.errors.iter().any(|task| task.find(task_id).is_some())
    }

    pub fn concurrency(&self) -> Option<&Concurrency> {
        self.concurrency.as_ref()
    }

    pub fn active_triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter().filter(|trigger| !trigger.disabled)
    }

    /// Same definition, revision aside.
    pub fn same_definition(&self, other: &Flow) -> bool {
        let mut other = other.clone();
        other.revision = self.revision;
        *self == other
    }
}
