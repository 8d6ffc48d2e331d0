//! Task-run reset shared by restart, replay and markAs.
//!
//! Each operation is a [`ResetInstruction`]; [`reset_task_runs`] walks the
//! task-run list once and decides, per run, whether it is kept, reset or
//! dropped. Resetting a leaf opens a new attempt in `RESTARTED`; resetting a
//! container puts it back to `RUNNING` so the engine re-enters it.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::execution::Execution;
use super::state::StateType;
use super::task_run::TaskRun;
use crate::error::{AppError, AppResult};
use crate::flow::{Flow, Task};

/// How to reset an execution's task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetInstruction<'a> {
    /// Restart: reset failed and killed runs plus their ancestors, drop the
    /// error branch, keep everything else.
    FromFailure,
    /// Replay: keep what ran before the chosen run, reset the chosen run and
    /// its ancestors, drop the rest. `None` keeps nothing.
    FromPoint { task_run_id: Option<&'a str> },
    /// markAs: force one run into `state`.
    ForceState {
        task_run_id: &'a str,
        state: StateType,
    },
}

/// Apply `instruction` to the execution's task runs against `flow`.
pub fn reset_task_runs(
    execution: &Execution,
    flow: &Flow,
    instruction: ResetInstruction<'_>,
) -> AppResult<Vec<TaskRun>> {
    match instruction {
        ResetInstruction::FromFailure => reset_from_failure(execution, flow),
        ResetInstruction::FromPoint { task_run_id } => {
            reset_from_point(execution, flow, task_run_id)
        }
        ResetInstruction::ForceState { task_run_id, state } => {
            force_state(execution, flow, task_run_id, state)
        }
    }
}

fn task_for<'f>(flow: &'f Flow, execution: &Execution, run: &TaskRun) -> AppResult<&'f Task> {
    flow.find_task(&run.task_id).ok_or_else(|| {
        AppError::NotFound(format!(
            "Task '{}' of task run '{}' (execution '{}') in flow '{}.{}' revision {}",
            run.task_id, run.id, execution.id, flow.namespace, flow.id, flow.revision
        ))
    })
}

/// Put a run back in line for execution.
fn reset_run(run: &TaskRun, task: &Task) -> TaskRun {
    if task.is_flowable() {
        run.with_state(StateType::Running)
    } else if task.is_pause() {
        run.with_state(StateType::Restarted)
    } else {
        run.with_new_attempt(StateType::Restarted)
            .with_state(StateType::Restarted)
    }
}

fn reset_from_failure(execution: &Execution, flow: &Flow) -> AppResult<Vec<TaskRun>> {
    let tree = execution.tree();

    let mut targets: HashSet<&str> = HashSet::new();
    for run in &execution.task_run_list {
        if flow.is_error_task(&run.task_id) {
            continue;
        }
        if matches!(run.current(), StateType::Failed | StateType::Killed) {
            targets.insert(run.id.as_str());
            targets.extend(tree.ancestor_ids(&run.id));
        }
    }

    let mut task_runs = Vec::with_capacity(execution.task_run_list.len());
    for run in &execution.task_run_list {
        if flow.is_error_task(&run.task_id) {
            continue;
        }
        if targets.contains(run.id.as_str()) {
            let task = task_for(flow, execution, run)?;
            task_runs.push(reset_run(run, task));
        } else {
            task_runs.push(run.clone());
        }
    }

    Ok(task_runs)
}

fn reset_from_point(
    execution: &Execution,
    flow: &Flow,
    task_run_id: Option<&str>,
) -> AppResult<Vec<TaskRun>> {
    let Some(task_run_id) = task_run_id else {
        return Ok(Vec::new());
    };

    let tree = execution.tree();
    let chosen = execution.find_task_run(task_run_id)?;
    let position = tree
        .position(&chosen.id)
        .ok_or_else(|| AppError::Internal(format!("Task run '{}' not indexed", chosen.id)))?;
    let ancestors = tree.ancestor_ids(&chosen.id);
    let descendants = tree.descendant_ids(&chosen.id);

    let mut task_runs = Vec::new();
    for (index, run) in execution.task_run_list.iter().enumerate() {
        if run.id == chosen.id {
            let task = task_for(flow, execution, run)?;
            task_runs.push(reset_run(run, task));
        } else if ancestors.contains(run.id.as_str()) {
            task_runs.push(run.with_state(StateType::Running));
        } else if index < position && !descendants.contains(run.id.as_str()) {
            task_runs.push(run.clone());
        }
    }

    Ok(task_runs)
}

fn force_state(
    execution: &Execution,
    flow: &Flow,
    task_run_id: &str,
    state: StateType,
) -> AppResult<Vec<TaskRun>> {
    if !state.is_terminal() || state == StateType::Retried {
        return Err(AppError::Validation(format!(
            "Task run state can only be forced to a final state, got {}",
            state
        )));
    }

    let target = execution.find_task_run(task_run_id)?;
    if target.current() == state {
        return Err(AppError::invalid_task_run_state(
            &execution.id,
            task_run_id,
            target.current(),
            state,
        ));
    }

    let tree = execution.tree();
    let ancestors = tree.ancestor_ids(task_run_id);
    let resume_branch = target.current().is_failed() && state.is_terminal_no_fail();
    let failed_descendants: HashSet<&str> = if resume_branch {
        tree.descendant_ids(task_run_id)
            .into_iter()
            .filter(|id| {
                tree.get(id)
                    .map(|run| run.current().is_failed())
                    .unwrap_or(false)
            })
            .collect()
    } else {
        HashSet::new()
    };

    let mut task_runs = Vec::with_capacity(execution.task_run_list.len());
    for run in &execution.task_run_list {
        if run.id == task_run_id {
            let task = task_for(flow, execution, run)?;
            if task.is_flowable() && !failed_descendants.is_empty() {
                // reopened children settle the container
                task_runs.push(run.with_state(StateType::Running));
            } else if task.is_flowable() || task.is_pause() {
                task_runs.push(run.with_state(state));
            } else {
                task_runs.push(run.with_last_attempt_state(state).with_state(state));
            }
        } else if ancestors.contains(run.id.as_str()) {
            task_runs.push(run.with_state(StateType::Running));
        } else if failed_descendants.contains(run.id.as_str()) {
            let task = task_for(flow, execution, run)?;
            if task.is_flowable() || task.is_pause() {
                task_runs.push(run.with_state(StateType::Running));
            } else {
                task_runs.push(
                    run.with_new_attempt(StateType::Restarted)
                        .with_state(StateType::Running),
                );
            }
        } else {
            task_runs.push(run.clone());
        }
    }

    Ok(task_runs)
}

/// Give every run a fresh id, rewiring parent pointers. Used when the runs
/// move to a new execution.
pub fn reassign_ids(task_runs: Vec<TaskRun>) -> Vec<TaskRun> {
    let mapping: HashMap<String, String> = task_runs
        .iter()
        .map(|run| (run.id.clone(), Uuid::new_v4().to_string()))
        .collect();

    task_runs
        .into_iter()
        .map(|mut run| {
            if let Some(new_id) = mapping.get(&run.id) {
                run.id = new_id.clone();
            }
            run.parent_task_run_id = run
                .parent_task_run_id
                .as_ref()
                .map(|parent| mapping.get(parent).cloned().unwrap_or_else(|| parent.clone()));
            run
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    fn find<'a>(runs: &'a [TaskRun], task_id: &str) -> &'a TaskRun {
        runs.iter().find(|r| r.task_id == task_id).unwrap()
    }

    fn nested_failed() -> (Flow, Execution) {
        let flow = flow(NESTED_FLOW);
        let first = leaf("first", None, &[Running, Success]);
        let group = container("group", None, &[Running, Failed]);
        let inner_a = leaf("inner-a", Some(&group), &[Running, Success]);
        let inner_b = leaf("inner-b", Some(&group), &[Running, Failed]);
        let on_error = leaf("on-error", None, &[Running, Success]);
        let execution = execution(
            &flow,
            vec![first, group, inner_a, inner_b, on_error],
            &[Running, Failed],
        );
        (flow, execution)
    }

    #[test]
    fn test_from_failure_resets_failed_chain() {
        let (flow, execution) = nested_failed();
        let runs = reset_task_runs(&execution, &flow, ResetInstruction::FromFailure).unwrap();

        assert_eq!(runs.len(), 4, "error branch dropped");
        assert_eq!(find(&runs, "first"), &execution.task_run_list[0]);
        assert_eq!(find(&runs, "inner-a"), &execution.task_run_list[2]);

        let group = find(&runs, "group");
        assert_eq!(group.current(), Running);
        assert!(group.attempts.is_empty());

        let inner_b = find(&runs, "inner-b");
        assert_eq!(inner_b.id, execution.task_run_list[3].id);
        assert_eq!(inner_b.current(), Restarted);
        assert_eq!(inner_b.attempts.len(), 2);
        assert_eq!(inner_b.attempts[1].state.current, Restarted);
    }

    #[test]
    fn test_from_failure_missing_task_in_revision() {
        let (_, execution) = nested_failed();
        let other = flow(LINEAR_FLOW);
        let err = reset_task_runs(&execution, &other, ResetInstruction::FromFailure).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_from_point_keeps_earlier_and_ancestors() {
        let (flow, execution) = nested_failed();
        let chosen = execution.task_run_list[3].id.clone();

        let runs = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::FromPoint {
                task_run_id: Some(&chosen),
            },
        )
        .unwrap();

        // ancestors (group) + earlier non-descendants (first, inner-a) + chosen
        assert_eq!(runs.len(), 4);
        assert_eq!(find(&runs, "group").current(), Running);
        assert_eq!(find(&runs, "inner-b").current(), Restarted);
        assert!(runs.iter().all(|r| r.task_id != "on-error"));
    }

    #[test]
    fn test_from_point_on_container_drops_descendants() {
        let (flow, execution) = nested_failed();
        let group = execution.task_run_list[1].id.clone();

        let runs = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::FromPoint {
                task_run_id: Some(&group),
            },
        )
        .unwrap();

        assert_eq!(runs.len(), 2);
        assert_eq!(find(&runs, "group").current(), Running);
    }

    #[test]
    fn test_from_point_inside_loop() {
        let flow = flow(EACH_FLOW);
        let each = container("loop", None, &[Running, Failed]);
        let it1 = with_value(leaf("body", Some(&each), &[Running, Success]), "1");
        let it2 = with_value(leaf("body", Some(&each), &[Running, Failed]), "2");
        let it3 = with_value(leaf("body", Some(&each), &[Running, Success]), "3");
        let execution = execution(
            &flow,
            vec![each, it1.clone(), it2.clone(), it3],
            &[Running, Failed],
        );

        let runs = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::FromPoint {
                task_run_id: Some(&it2.id),
            },
        )
        .unwrap();

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].current(), Running);
        assert_eq!(runs[1], it1);
        assert_eq!(runs[2].id, it2.id);
        assert_eq!(runs[2].current(), Restarted);
    }

    #[test]
    fn test_from_point_none_keeps_nothing() {
        let (flow, execution) = nested_failed();
        let runs = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::FromPoint { task_run_id: None },
        )
        .unwrap();
        assert!(runs.is_empty());
    }

    #[test]
    fn test_force_state_on_leaf() {
        let flow = flow(LINEAR_FLOW);
        let first = leaf("first", None, &[Running, Failed]);
        let execution = execution(&flow, vec![first.clone()], &[Running, Failed]);

        let runs = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::ForceState {
                task_run_id: &first.id,
                state: Success,
            },
        )
        .unwrap();

        assert_eq!(runs[0].current(), Success);
        assert_eq!(runs[0].attempts.len(), 1);
        assert_eq!(runs[0].attempts[0].state.current, Success);
        assert_eq!(runs[0].outputs, first.outputs);
    }

    #[test]
    fn test_force_state_resets_failed_descendants() {
        let (flow, execution) = nested_failed();
        let group_id = execution.task_run_list[1].id.clone();

        let runs = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::ForceState {
                task_run_id: &group_id,
                state: Success,
            },
        )
        .unwrap();

        let group = find(&runs, "group");
        assert_eq!(group.current(), Running);
        assert!(group.attempts.is_empty());

        let inner_b = find(&runs, "inner-b");
        assert_eq!(inner_b.current(), Running);
        assert_eq!(inner_b.attempts.len(), 2);
        assert_eq!(find(&runs, "inner-a").current(), Success);
    }

    #[test]
    fn test_force_state_ancestors_running() {
        let (flow, execution) = nested_failed();
        let inner_b = execution.task_run_list[3].id.clone();

        let runs = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::ForceState {
                task_run_id: &inner_b,
                state: Success,
            },
        )
        .unwrap();

        assert_eq!(find(&runs, "group").current(), Running);
        assert_eq!(find(&runs, "inner-b").current(), Success);
    }

    #[test]
    fn test_force_same_state_is_invalid() {
        let (flow, execution) = nested_failed();
        let first = execution.task_run_list[0].id.clone();
        let err = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::ForceState {
                task_run_id: &first,
                state: Success,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidState { .. }));
    }

    #[test]
    fn test_force_non_final_state_rejected() {
        let (flow, execution) = nested_failed();
        let first = execution.task_run_list[0].id.clone();
        let err = reset_task_runs(
            &execution,
            &flow,
            ResetInstruction::ForceState {
                task_run_id: &first,
                state: Running,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_reassign_ids_rewires_parents() {
        let (_, execution) = nested_failed();
        let runs = reassign_ids(execution.task_run_list.clone());

        assert!(runs
            .iter()
            .zip(execution.task_run_list.iter())
            .all(|(new, old)| new.id != old.id));
        assert_eq!(runs[2].parent_task_run_id.as_deref(), Some(runs[1].id.as_str()));
    }
}
