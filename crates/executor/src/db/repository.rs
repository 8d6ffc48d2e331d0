//! Storage traits for executions and schedule triggers.
//!
//! Every mutation of a stored execution goes through
//! [`ExecutionRepository::lock_and_update`]: the row is locked, the mutation
//! closure runs on the fresh row, and the result is written before the lock is
//! released. The closure is synchronous, so no lock is ever held across an
//! unrelated await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::execution::{Execution, ExecutorState};
use crate::engine::state::StateType;
use crate::error::AppResult;

/// Mutation applied to a locked execution row.
pub type ExecutionMutation<'a> =
    Box<dyn FnOnce(Execution, ExecutorState) -> AppResult<(Execution, ExecutorState)> + Send + 'a>;

/// Admission applied under a flow lock. Receives the flow's non-terminal
/// executions, oldest first, and returns the executions to upsert.
pub type AdmissionMutation<'a> =
    Box<dyn FnOnce(Vec<Execution>) -> AppResult<Vec<Execution>> + Send + 'a>;

/// Update applied to a claimed trigger row.
pub type TriggerClaim<'a> = Box<dyn FnOnce(TriggerState) -> AppResult<TriggerState> + Send + 'a>;

/// Criteria for listing and purging executions. Empty criteria match all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub flow_id: Option<String>,

    #[serde(default)]
    pub states: Option<Vec<StateType>>,

    /// Only executions whose end date is strictly before this instant.
    #[serde(default)]
    pub end_before: Option<DateTime<Utc>>,

    #[serde(default)]
    pub include_deleted: bool,

    #[serde(default)]
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &Execution) -> bool {
        if execution.deleted && !self.include_deleted {
            return false;
        }
        if let Some(namespace) = &self.namespace {
            if execution.namespace != *namespace {
                return false;
            }
        }
        if let Some(flow_id) = &self.flow_id {
            if execution.flow_id != *flow_id {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&execution.current()) {
                return false;
            }
        }
        if let Some(end_before) = self.end_before {
            match execution.state.end_date() {
                Some(end) if end < end_before => {}
                _ => return false,
            }
        }
        true
    }
}

/// Persisted schedule of one trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub trigger_id: String,
    pub interval_secs: u64,
    pub next_execution_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_id: Option<String>,
}

impl TriggerState {
    /// Unique key of the trigger row.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.tenant_id.as_deref().unwrap_or("main"),
            self.namespace,
            self.flow_id,
            self.trigger_id
        )
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_execution_date <= now
    }
}

/// Execution storage.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Read without locking. Soft-deleted executions are returned too.
    async fn find_by_id(&self, id: &str) -> AppResult<Option<Execution>>;

    /// Executions matching the filter, oldest first.
    async fn find(&self, filter: &ExecutionFilter) -> AppResult<Vec<Execution>>;

    /// Insert or replace an execution without taking its lock. Only for rows
    /// nobody else can see yet.
    async fn save(&self, execution: &Execution) -> AppResult<()>;

    /// Lock the row, apply `mutation` to its fresh value and persist the
    /// result. Nothing is written when the mutation fails or changes nothing.
    ///
    /// Fails with `NotFound` for an unknown id and `LockTimeout` when the
    /// lock cannot be had within the configured bound.
    async fn lock_and_update<'a>(
        &'a self,
        id: &'a str,
        mutation: ExecutionMutation<'a>,
    ) -> AppResult<Execution>;

    /// Serialize admissions of one flow and upsert what `admission` returns.
    async fn lock_flow<'a>(
        &'a self,
        flow_key: &'a str,
        admission: AdmissionMutation<'a>,
    ) -> AppResult<Vec<Execution>>;

    /// Hard delete. Returns whether a row existed.
    async fn remove(&self, id: &str) -> AppResult<bool>;

    async fn health_check(&self) -> bool;
}

/// Trigger storage with skip-locked claims.
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    /// Insert the trigger unless a row with its key exists. Returns whether
    /// it was inserted.
    async fn save_if_absent(&self, trigger: &TriggerState) -> AppResult<bool>;

    async fn find_all(&self) -> AppResult<Vec<TriggerState>>;

    /// Claim the earliest ready trigger nobody else holds, apply `claim` to
    /// it and persist. Never waits on a held row: `None` when no unheld row
    /// is ready.
    async fn claim_next_ready<'a>(
        &'a self,
        now: DateTime<Utc>,
        claim: TriggerClaim<'a>,
    ) -> AppResult<Option<TriggerState>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_filter_matches() {
        let flow = flow(LINEAR_FLOW);
        let done = execution(&flow, Vec::new(), &[Running, Success]);
        let running = execution(&flow, Vec::new(), &[Running]);

        let all = ExecutionFilter::default();
        assert!(all.matches(&done));

        let terminal = ExecutionFilter {
            states: Some(vec![Success]),
            ..Default::default()
        };
        assert!(terminal.matches(&done));
        assert!(!terminal.matches(&running));

        let before = ExecutionFilter {
            end_before: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(before.matches(&done));
        assert!(!before.matches(&running));

        let other_ns = ExecutionFilter {
            namespace: Some("other".into()),
            ..Default::default()
        };
        assert!(!other_ns.matches(&done));

        let mut deleted = done.clone();
        deleted.deleted = true;
        assert!(!all.matches(&deleted));
    }

    #[test]
    fn test_trigger_key_and_readiness() {
        let now = Utc::now();
        let trigger = TriggerState {
            tenant_id: None,
            namespace: "ns".into(),
            flow_id: "f".into(),
            trigger_id: "every-minute".into(),
            interval_secs: 60,
            next_execution_date: now,
            last_execution_id: None,
        };
        assert_eq!(trigger.key(), "main/ns/f/every-minute");
        assert!(trigger.is_ready(now));
        assert!(!trigger.is_ready(now - chrono::Duration::seconds(1)));
    }
}
