//! Execution database queries.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, QueryBuilder};

use crate::db::models::ExecutionRow;
use crate::db::repository::ExecutionFilter;
use crate::db::DbPool;
use crate::engine::execution::{Execution, ExecutorState};
use crate::engine::state::StateType;
use crate::error::AppResult;

/// Bound lock waits of the current transaction.
pub async fn set_lock_timeout(conn: &mut PgConnection, timeout_ms: u64) -> AppResult<()> {
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", timeout_ms))
        .execute(conn)
        .await?;
    Ok(())
}

/// Transaction-scoped advisory lock on an arbitrary key.
pub async fn advisory_lock(conn: &mut PgConnection, key: &str) -> AppResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

/// Insert an execution or replace its value, keeping its executor state.
pub async fn upsert_execution(conn: &mut PgConnection, execution: &Execution) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO executions (
            id, tenant_id, namespace, flow_id, flow_key, state_current,
            value, deleted, end_date, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
        ON CONFLICT (id) DO UPDATE SET
            state_current = EXCLUDED.state_current,
            value = EXCLUDED.value,
            deleted = EXCLUDED.deleted,
            end_date = EXCLUDED.end_date,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&execution.id)
    .bind(&execution.tenant_id)
    .bind(&execution.namespace)
    .bind(&execution.flow_id)
    .bind(execution.flow_key())
    .bind(execution.current().as_str())
    .bind(Json(execution))
    .bind(execution.deleted)
    .bind(execution.state.end_date())
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Write back a locked execution and its executor state.
pub async fn update_execution(
    conn: &mut PgConnection,
    execution: &Execution,
    executor_state: &ExecutorState,
) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET state_current = $2,
            value = $3,
            executor_state = $4,
            deleted = $5,
            end_date = $6,
            updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(&execution.id)
    .bind(execution.current().as_str())
    .bind(Json(execution))
    .bind(Json(executor_state))
    .bind(execution.deleted)
    .bind(execution.state.end_date())
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Get an execution by id, without locking.
pub async fn get_execution(pool: &DbPool, id: &str) -> AppResult<Option<ExecutionRow>> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, value, executor_state
        FROM executions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Lock an execution row for the rest of the transaction.
pub async fn get_execution_for_update(
    conn: &mut PgConnection,
    id: &str,
) -> AppResult<Option<ExecutionRow>> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, value, executor_state
        FROM executions
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// Lock the non-terminal executions of a flow, oldest first.
pub async fn get_active_for_update(
    conn: &mut PgConnection,
    flow_key: &str,
) -> AppResult<Vec<ExecutionRow>> {
    let terminal: Vec<String> = StateType::terminal_types()
        .into_iter()
        .map(|state| state.as_str().to_string())
        .collect();

    let rows = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, value, executor_state
        FROM executions
        WHERE flow_key = $1
          AND deleted = FALSE
          AND NOT (state_current = ANY($2))
        ORDER BY created_at, id
        FOR UPDATE
        "#,
    )
    .bind(flow_key)
    .bind(terminal)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

/// List executions matching a filter, oldest first.
pub async fn list_executions(pool: &DbPool, filter: &ExecutionFilter) -> AppResult<Vec<ExecutionRow>> {
    let mut query: QueryBuilder<Postgres> =
        QueryBuilder::new("SELECT id, value, executor_state FROM executions WHERE TRUE");

    if !filter.include_deleted {
        query.push(" AND deleted = FALSE");
    }
    if let Some(namespace) = &filter.namespace {
        query.push(" AND namespace = ").push_bind(namespace.clone());
    }
    if let Some(flow_id) = &filter.flow_id {
        query.push(" AND flow_id = ").push_bind(flow_id.clone());
    }
    if let Some(states) = &filter.states {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        query.push(" AND state_current = ANY(").push_bind(states).push(")");
    }
    if let Some(end_before) = filter.end_before {
        query.push(" AND end_date < ").push_bind(end_before);
    }
    query.push(" ORDER BY created_at, id");
    if let Some(limit) = filter.limit {
        query
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }

    let rows = query
        .build_query_as::<ExecutionRow>()
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// Hard delete an execution.
pub async fn delete_execution(pool: &DbPool, id: &str) -> AppResult<u64> {
    let result = sqlx::query("DELETE FROM executions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
