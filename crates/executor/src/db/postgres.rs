//! PostgreSQL storage.
//!
//! Each locked mutation is one transaction:
//! 1. bound lock waits with a transaction-local `lock_timeout`
//! 2. `SELECT ... FOR UPDATE` the row
//! 3. run the mutation closure, `UPDATE`, commit
//!
//! Flow admissions add a transaction-scoped advisory lock keyed by the flow.
//! Trigger claims use `FOR UPDATE SKIP LOCKED` and never wait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::queries::{execution as queries, trigger as trigger_queries};
use crate::db::repository::{
    AdmissionMutation, ExecutionFilter, ExecutionMutation, ExecutionRepository, TriggerClaim,
    TriggerRepository, TriggerState,
};
use crate::db::{pool, DbPool};
use crate::engine::execution::Execution;
use crate::error::{AppError, AppResult};

/// Lock-not-available.
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
/// Serialization failure.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// Deadlock detected.
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// Translate lock-related database failures into the mutation error taxonomy.
fn map_lock_error(err: AppError, key: &str) -> AppError {
    let code = match &err {
        AppError::Database(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
        _ => None,
    };
    match code.as_deref() {
        Some(SQLSTATE_LOCK_NOT_AVAILABLE) => AppError::LockTimeout {
            key: key.to_string(),
        },
        Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED) => {
            AppError::ConcurrentModification {
                execution_id: key.to_string(),
            }
        }
        _ => err,
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Execution storage backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresExecutionRepository {
    pool: DbPool,
    lock_timeout: Duration,
}

impl PostgresExecutionRepository {
    pub fn new(pool: DbPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn locked_update<'a>(
        &'a self,
        id: &'a str,
        mutation: ExecutionMutation<'a>,
    ) -> AppResult<Execution> {
        let mut tx = self.pool.begin().await?;
        queries::set_lock_timeout(&mut *tx, timeout_ms(self.lock_timeout)).await?;

        let row = queries::get_execution_for_update(&mut *tx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution '{}'", id)))?;
        let (current, current_state) = row.into_parts();

        // dropping `tx` on error rolls back
        let (execution, executor_state) = mutation(current.clone(), current_state.clone())?;

        if execution != current || executor_state != current_state {
            queries::update_execution(&mut *tx, &execution, &executor_state).await?;
        }
        tx.commit().await?;

        Ok(execution)
    }

    async fn locked_admission<'a>(
        &'a self,
        flow_key: &'a str,
        admission: AdmissionMutation<'a>,
    ) -> AppResult<Vec<Execution>> {
        let mut tx = self.pool.begin().await?;
        queries::set_lock_timeout(&mut *tx, timeout_ms(self.lock_timeout)).await?;
        queries::advisory_lock(&mut *tx, flow_key).await?;

        let active: Vec<Execution> = queries::get_active_for_update(&mut *tx, flow_key)
            .await?
            .into_iter()
            .map(|row| row.into_execution())
            .collect();

        let upserts = admission(active)?;
        for execution in &upserts {
            queries::upsert_execution(&mut *tx, execution).await?;
        }
        tx.commit().await?;

        Ok(upserts)
    }
}

#[async_trait]
impl ExecutionRepository for PostgresExecutionRepository {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<Execution>> {
        Ok(queries::get_execution(&self.pool, id)
            .await?
            .map(|row| row.into_execution()))
    }

    async fn find(&self, filter: &ExecutionFilter) -> AppResult<Vec<Execution>> {
        Ok(queries::list_executions(&self.pool, filter)
            .await?
            .into_iter()
            .map(|row| row.into_execution())
            .collect())
    }

    async fn save(&self, execution: &Execution) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        queries::upsert_execution(&mut *conn, execution).await
    }

    async fn lock_and_update<'a>(
        &'a self,
        id: &'a str,
        mutation: ExecutionMutation<'a>,
    ) -> AppResult<Execution> {
        self.locked_update(id, mutation)
            .await
            .map_err(|e| map_lock_error(e, id))
    }

    async fn lock_flow<'a>(
        &'a self,
        flow_key: &'a str,
        admission: AdmissionMutation<'a>,
    ) -> AppResult<Vec<Execution>> {
        self.locked_admission(flow_key, admission)
            .await
            .map_err(|e| map_lock_error(e, flow_key))
    }

    async fn remove(&self, id: &str) -> AppResult<bool> {
        Ok(queries::delete_execution(&self.pool, id).await? > 0)
    }

    async fn health_check(&self) -> bool {
        pool::health_check(&self.pool).await
    }
}

/// Trigger storage backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresTriggerRepository {
    pool: DbPool,
}

impl PostgresTriggerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerRepository for PostgresTriggerRepository {
    async fn save_if_absent(&self, trigger: &TriggerState) -> AppResult<bool> {
        Ok(trigger_queries::insert_trigger_if_absent(&self.pool, trigger).await? > 0)
    }

    async fn find_all(&self) -> AppResult<Vec<TriggerState>> {
        Ok(trigger_queries::list_triggers(&self.pool)
            .await?
            .into_iter()
            .map(TriggerState::from)
            .collect())
    }

    async fn claim_next_ready<'a>(
        &'a self,
        now: DateTime<Utc>,
        claim: TriggerClaim<'a>,
    ) -> AppResult<Option<TriggerState>> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = trigger_queries::get_next_ready_skip_locked(&mut *tx, now).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let updated = claim(TriggerState::from(row))?;
        trigger_queries::update_trigger(&mut *tx, &updated).await?;
        tx.commit().await?;

        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_pass_through() {
        let err = map_lock_error(AppError::NotFound("x".into()), "id");
        assert!(matches!(err, AppError::NotFound(_)));

        let err = map_lock_error(AppError::Database(sqlx::Error::RowNotFound), "id");
        assert!(matches!(err, AppError::Database(_)));
    }

    #[test]
    fn test_timeout_ms() {
        assert_eq!(timeout_ms(Duration::from_secs(2)), 2_000);
    }
}
