//! Trigger database queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::db::models::TriggerRow;
use crate::db::repository::TriggerState;
use crate::db::DbPool;
use crate::error::AppResult;

/// Insert a trigger unless its key exists.
pub async fn insert_trigger_if_absent(pool: &DbPool, trigger: &TriggerState) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO triggers (
            key, tenant_id, namespace, flow_id, trigger_id,
            interval_secs, next_execution_date, last_execution_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (key) DO NOTHING
        "#,
    )
    .bind(trigger.key())
    .bind(&trigger.tenant_id)
    .bind(&trigger.namespace)
    .bind(&trigger.flow_id)
    .bind(&trigger.trigger_id)
    .bind(i64::try_from(trigger.interval_secs).unwrap_or(i64::MAX))
    .bind(trigger.next_execution_date)
    .bind(&trigger.last_execution_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// List all triggers.
pub async fn list_triggers(pool: &DbPool) -> AppResult<Vec<TriggerRow>> {
    let rows = sqlx::query_as::<_, TriggerRow>(
        r#"
        SELECT key, tenant_id, namespace, flow_id, trigger_id,
               interval_secs, next_execution_date, last_execution_id
        FROM triggers
        ORDER BY next_execution_date, key
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Lock the earliest ready trigger, skipping rows locked by others.
pub async fn get_next_ready_skip_locked(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> AppResult<Option<TriggerRow>> {
    let row = sqlx::query_as::<_, TriggerRow>(
        r#"
        SELECT key, tenant_id, namespace, flow_id, trigger_id,
               interval_secs, next_execution_date, last_execution_id
        FROM triggers
        WHERE next_execution_date <= $1
        ORDER BY next_execution_date, key
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "#,
    )
    .bind(now)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// Write back a claimed trigger.
pub async fn update_trigger(conn: &mut PgConnection, trigger: &TriggerState) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE triggers
        SET interval_secs = $2,
            next_execution_date = $3,
            last_execution_id = $4
        WHERE key = $1
        "#,
    )
    .bind(trigger.key())
    .bind(i64::try_from(trigger.interval_secs).unwrap_or(i64::MAX))
    .bind(trigger.next_execution_date)
    .bind(&trigger.last_execution_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}
