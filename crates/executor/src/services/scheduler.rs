//! Schedule triggers.
//!
//! Trigger rows are shared by every scheduler instance. A tick claims ready
//! rows one at a time with a skip-locked scan, advances the row past `now`
//! and commits before the execution is submitted, so each scheduled date
//! fires at most once across instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::repository::{TriggerRepository, TriggerState};
use crate::engine::execution::ExecutionTrigger;
use crate::error::AppResult;
use crate::flow::{FlowRepository, TriggerKind};
use crate::result_ext::ResultExt;
use crate::services::executor::{Executor, Submission, SCHEDULE_TRIGGER_TYPE};

/// Schedule date following `current` that lies after `now`. Missed dates
/// are skipped, not replayed.
pub fn next_date(current: DateTime<Utc>, interval_secs: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let step = chrono::Duration::seconds(i64::try_from(interval_secs.max(1)).unwrap_or(i64::MAX));
    let mut next = current + step;
    if next <= now {
        let behind = (now - next).num_seconds() / step.num_seconds();
        next += step * i32::try_from(behind).unwrap_or(i32::MAX);
        while next <= now {
            next += step;
        }
    }
    next
}

#[derive(Clone)]
pub struct Scheduler {
    triggers: Arc<dyn TriggerRepository>,
    flows: Arc<FlowRepository>,
    executor: Executor,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        triggers: Arc<dyn TriggerRepository>,
        flows: Arc<FlowRepository>,
        executor: Executor,
        interval: Duration,
    ) -> Self {
        Self {
            triggers,
            flows,
            executor,
            interval,
        }
    }

    /// Create rows for schedule triggers that have none yet. The first fire
    /// is one interval after `now`.
    pub async fn sync_triggers(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let mut created = 0;
        for flow in self.flows.find_all()? {
            if flow.disabled {
                continue;
            }
            for trigger in flow.active_triggers() {
                let TriggerKind::Schedule { interval_secs } = trigger.kind else {
                    continue;
                };
                let state = TriggerState {
                    tenant_id: flow.tenant_id.clone(),
                    namespace: flow.namespace.clone(),
                    flow_id: flow.id.clone(),
                    trigger_id: trigger.id.clone(),
                    interval_secs,
                    next_execution_date: next_date(now, interval_secs, now),
                    last_execution_id: None,
                };
                if self.triggers.save_if_absent(&state).await? {
                    debug!(trigger = %state.key(), next = %state.next_execution_date, "Trigger registered");
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    /// Fire every trigger ready at `now`. Returns the ids of the submitted
    /// executions.
    pub async fn tick(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        let mut fired = Vec::new();

        while let Some(claimed) = self
            .triggers
            .claim_next_ready(
                now,
                Box::new(move |mut trigger: TriggerState| {
                    trigger.next_execution_date =
                        next_date(trigger.next_execution_date, trigger.interval_secs, now);
                    trigger.last_execution_id = Some(Uuid::new_v4().to_string());
                    Ok(trigger)
                }),
            )
            .await?
        {
            let Some(execution_id) = claimed.last_execution_id.clone() else {
                continue;
            };

            let submission = Submission {
                execution_id: Some(execution_id.clone()),
                tenant_id: claimed.tenant_id.clone(),
                namespace: claimed.namespace.clone(),
                flow_id: claimed.flow_id.clone(),
                trigger: Some(ExecutionTrigger {
                    id: claimed.trigger_id.clone(),
                    trigger_type: SCHEDULE_TRIGGER_TYPE.to_string(),
                    variables: schedule_variables(now, &claimed),
                }),
                ..Default::default()
            };

            // the date is consumed even when the submission fails
            match self.executor.submit(submission).await {
                Ok(execution) => {
                    info!(
                        execution_id = %execution.id,
                        trigger = %claimed.key(),
                        next = %claimed.next_execution_date,
                        "Schedule fired"
                    );
                    fired.push(execution.id);
                }
                Err(e) => warn!(
                    error = %e,
                    trigger = %claimed.key(),
                    "Scheduled execution could not be submitted"
                ),
            }
        }

        Ok(fired)
    }

    /// Sync and tick on a fixed interval forever.
    pub async fn run(&self) -> AppResult<()> {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_ms = self.interval.as_millis() as u64, "Scheduler started");

        loop {
            ticker.tick().await;
            let now = Utc::now();
            let _ = self.sync_triggers(now).await.log("sync schedule triggers");
            let _ = self.tick(now).await.log("fire schedule triggers");
        }
    }
}

fn schedule_variables(now: DateTime<Utc>, trigger: &TriggerState) -> Map<String, Value> {
    match json!({ "date": now, "next": trigger.next_execution_date }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
