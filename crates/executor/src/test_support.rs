//! Builders shared by unit tests.

use std::sync::Arc;

use crate::engine::execution::Execution;
use crate::engine::state::{State, StateType};
use crate::engine::task_run::{TaskRun, TaskRunAttempt};
use crate::flow::{parse_flow, Flow, FlowRepository};

pub const LINEAR_FLOW: &str = r#"
id: linear
namespace: company.team
tasks:
  - id: first
    type: task
  - id: second
    type: task
  - id: third
    type: task
"#;

pub const NESTED_FLOW: &str = r#"
id: nested
namespace: company.team
tasks:
  - id: first
    type: task
  - id: group
    type: sequential
    tasks:
      - id: inner-a
        type: task
      - id: inner-b
        type: task
  - id: last
    type: task
errors:
  - id: on-error
    type: task
"#;

pub const EACH_FLOW: &str = r#"
id: looping
namespace: company.team
tasks:
  - id: loop
    type: each
    values: ["1", "2", "3"]
    tasks:
      - id: body
        type: task
  - id: after
    type: task
"#;

pub const PAUSE_FLOW: &str = r#"
id: pausing
namespace: company.team
tasks:
  - id: before
    type: task
  - id: approve
    type: pause
  - id: after
    type: task
"#;

pub fn flow(yaml: &str) -> Flow {
    parse_flow(yaml).expect("valid test flow")
}

/// Registry holding the given flows.
pub fn flows(yamls: &[&str]) -> Arc<FlowRepository> {
    let repo = FlowRepository::new();
    for yaml in yamls {
        repo.create_from_yaml(yaml).expect("valid test flow");
    }
    Arc::new(repo)
}

fn state_through(states: &[StateType]) -> State {
    states
        .iter()
        .fold(State::new(), |state, next| state.with_state(*next))
}

/// Leaf run whose history walks `CREATED -> states...`, with one attempt
/// ending in the same state.
pub fn leaf(task_id: &str, parent: Option<&TaskRun>, states: &[StateType]) -> TaskRun {
    let mut run = TaskRun::new(task_id, parent.map(|p| p.id.as_str()), Vec::new());
    run.state = state_through(states);
    if let Some(last) = states.last() {
        run.attempts.push(TaskRunAttempt::new(*last));
    }
    run
}

/// Container run, no attempts.
pub fn container(task_id: &str, parent: Option<&TaskRun>, states: &[StateType]) -> TaskRun {
    let mut run = TaskRun::new(task_id, parent.map(|p| p.id.as_str()), Vec::new());
    run.state = state_through(states);
    run
}

pub fn with_value(mut run: TaskRun, value: &str) -> TaskRun {
    run.value = vec![value.to_string()];
    run
}

pub fn execution(flow: &Flow, runs: Vec<TaskRun>, states: &[StateType]) -> Execution {
    let mut execution = Execution::for_flow(flow);
    execution.state = state_through(states);
    execution.task_run_list = runs;
    execution
}

pub use crate::engine::state::StateType::{
    Cancelled, Created, Failed, Killed, Killing, Paused, Queued, Restarted, Retrying, Running,
    Skipped, Success, Warning,
};
