//! Trigger row model.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::db::repository::TriggerState;

/// Row of the `triggers` table.
#[derive(Debug, Clone, FromRow)]
pub struct TriggerRow {
    pub key: String,
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub trigger_id: String,
    pub interval_secs: i64,
    pub next_execution_date: DateTime<Utc>,
    pub last_execution_id: Option<String>,
}

impl From<TriggerRow> for TriggerState {
    fn from(row: TriggerRow) -> Self {
        TriggerState {
            tenant_id: row.tenant_id,
            namespace: row.namespace,
            flow_id: row.flow_id,
            trigger_id: row.trigger_id,
            interval_secs: u64::try_from(row.interval_secs).unwrap_or_default(),
            next_execution_date: row.next_execution_date,
            last_execution_id: row.last_execution_id,
        }
    }
}
