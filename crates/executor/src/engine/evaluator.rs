//! Condition evaluation against executions.
//!
//! Used by flow triggers (does a terminated execution start another flow)
//! and by task preconditions (`run_if`).

use crate::flow::types::Condition;

use super::execution::Execution;

/// Boolean predicate evaluation over an execution.
pub trait ConditionEvaluator: Send + Sync {
    fn test(&self, execution: &Execution, condition: &Condition) -> bool;

    /// All conditions hold. An empty list holds.
    fn test_all(&self, execution: &Execution, conditions: &[Condition]) -> bool {
        conditions
            .iter()
            .all(|condition| self.test(execution, condition))
    }
}

/// Evaluator for the built-in condition types.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConditionEvaluator;

impl ConditionEvaluator for DefaultConditionEvaluator {
    fn test(&self, execution: &Execution, condition: &Condition) -> bool {
        match condition {
            Condition::ExecutionStatus { in_states, not_in } => {
                let current = execution.current();
                (in_states.is_empty() || in_states.contains(&current))
                    && !not_in.contains(&current)
            }
            Condition::ExecutionFlow { namespace, flow_id } => {
                execution.namespace == *namespace && execution.flow_id == *flow_id
            }
            Condition::ExecutionNamespace { namespace, prefix } => {
                if *prefix {
                    execution.namespace == *namespace
                        || execution
                            .namespace
                            .starts_with(&format!("{}.", namespace))
                } else {
                    execution.namespace == *namespace
                }
            }
            Condition::ExecutionLabels { labels } => labels
                .iter()
                .all(|(key, value)| execution.label(key) == Some(value.as_str())),
            Condition::Not { conditions } => !conditions
                .iter()
                .any(|inner| self.test(execution, inner)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::engine::execution::Label;
    use crate::engine::state::StateType;
    use crate::flow::parse_flow;

    fn execution(state: StateType) -> Execution {
        let flow = parse_flow(
            r#"
id: upstream
namespace: company.data
tasks:
  - id: a
    type: task
"#,
        )
        .unwrap();
        Execution::for_flow(&flow)
            .with_state(state)
            .with_user_labels(vec![Label::new("env", "prod"), Label::new("team", "x")])
            .unwrap()
    }

    #[test]
    fn test_execution_status() {
        let evaluator = DefaultConditionEvaluator;
        let success = execution(StateType::Success);
        let condition = Condition::ExecutionStatus {
            in_states: vec![StateType::Success],
            not_in: vec![],
        };
        assert!(evaluator.test(&success, &condition));
        assert!(!evaluator.test(&execution(StateType::Failed), &condition));

        let not_failed = Condition::ExecutionStatus {
            in_states: vec![],
            not_in: vec![StateType::Failed],
        };
        assert!(evaluator.test(&success, &not_failed));
    }

    #[test]
    fn test_execution_flow_and_namespace() {
        let evaluator = DefaultConditionEvaluator;
        let e = execution(StateType::Success);

        assert!(evaluator.test(
            &e,
            &Condition::ExecutionFlow {
                namespace: "company.data".into(),
                flow_id: "upstream".into(),
            }
        ));
        assert!(evaluator.test(
            &e,
            &Condition::ExecutionNamespace {
                namespace: "company".into(),
                prefix: true,
            }
        ));
        assert!(!evaluator.test(
            &e,
            &Condition::ExecutionNamespace {
                namespace: "comp".into(),
                prefix: true,
            }
        ));
    }

    #[test]
    fn test_execution_labels_require_all() {
        let evaluator = DefaultConditionEvaluator;
        let e = execution(StateType::Success);

        let both = Condition::ExecutionLabels {
            labels: BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("team".to_string(), "x".to_string()),
            ]),
        };
        assert!(evaluator.test(&e, &both));

        let mismatch = Condition::ExecutionLabels {
            labels: BTreeMap::from([("env".to_string(), "dev".to_string())]),
        };
        assert!(!evaluator.test(&e, &mismatch));
        assert!(evaluator.test(
            &e,
            &Condition::Not {
                conditions: vec![mismatch]
            }
        ));
    }
}
