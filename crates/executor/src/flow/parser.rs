//! Flow YAML parser.
//!
//! Parses YAML flow definitions and validates:
//! - task ids unique across the main and error branches
//! - containers not empty
//! - concurrency limit at least 1
//! - schedule intervals positive, trigger ids unique

use std::collections::HashSet;

use crate::error::{AppError, AppResult};
use crate::flow::types::{Flow, Task, TaskKind, TriggerKind};

/// Parse a YAML string into a Flow.
pub fn parse_flow(yaml_content: &str) -> AppResult<Flow> {
    let flow: Flow = serde_yaml::from_str(yaml_content)?;

    validate_flow(&flow)?;

    Ok(flow)
}

/// Validate a parsed flow.
pub fn validate_flow(flow: &Flow) -> AppResult<()> {
    if flow.id.trim().is_empty() {
        return Err(AppError::Validation("Flow id must not be empty".to_string()));
    }

    if flow.namespace.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "Flow '{}': namespace must not be empty",
            flow.id
        )));
    }

    if flow.tasks.is_empty() {
        return Err(AppError::Validation(format!(
            "Flow '{}': at least one task is required",
            flow.id
        )));
    }

    let mut seen = HashSet::new();
    for task_id in flow.task_ids_in_order() {
        if !seen.insert(task_id.clone()) {
            return Err(AppError::Validation(format!(
                "Flow '{}': duplicate task id '{}'",
                flow.id, task_id
            )));
        }
    }

    for task in flow.tasks.iter().chain(flow.errors.iter()) {
        validate_task(&flow.id, task)?;
    }

    if let Some(concurrency) = &flow.concurrency {
        if concurrency.limit == 0 {
            return Err(AppError::Validation(format!(
                "Flow '{}': concurrency limit must be at least 1",
                flow.id
            )));
        }
    }

    let mut trigger_ids = HashSet::new();
    for trigger in &flow.triggers {
        if !trigger_ids.insert(trigger.id.as_str()) {
            return Err(AppError::Validation(format!(
                "Flow '{}': duplicate trigger id '{}'",
                flow.id, trigger.id
            )));
        }
        if let TriggerKind::Schedule { interval_secs } = trigger.kind {
            if interval_secs == 0 {
                return Err(AppError::Validation(format!(
                    "Flow '{}': trigger '{}' needs a positive interval",
                    flow.id, trigger.id
                )));
            }
        }
    }

    Ok(())
}

fn validate_task(flow_id: &str, task: &Task) -> AppResult<()> {
    if task.id.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "Flow '{}': task id must not be empty",
            flow_id
        )));
    }

    if let Some(retry) = &task.retry {
        if retry.max_attempts == 0 {
            return Err(AppError::Validation(format!(
                "Flow '{}': task '{}' retry needs at least one attempt",
                flow_id, task.id
            )));
        }
    }

    match &task.kind {
        TaskKind::Sequential { tasks } | TaskKind::Parallel { tasks } | TaskKind::Each { tasks, .. }
            if tasks.is_empty() =>
        {
            return Err(AppError::Validation(format!(
                "Flow '{}': container task '{}' has no children",
                flow_id, task.id
            )));
        }
        _ => {}
    }

    if task.is_flowable() && task.retry.is_some() {
        return Err(AppError::Validation(format!(
            "Flow '{}': retry is only supported on leaf task '{}'",
            flow_id, task.id
        )));
    }

    for child in task.children() {
        validate_task(flow_id, child)?;
    }

    Ok(())
}
