//! Schema bootstrap for the executor tables.

use crate::db::DbPool;
use crate::error::AppResult;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT,
        namespace TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        flow_key TEXT NOT NULL,
        state_current TEXT NOT NULL,
        value JSONB NOT NULL,
        executor_state JSONB NOT NULL DEFAULT '{}'::jsonb,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        end_date TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS executions_flow_key_idx ON executions (flow_key, state_current)",
    "CREATE INDEX IF NOT EXISTS executions_namespace_idx ON executions (namespace, flow_id)",
    r#"
    CREATE TABLE IF NOT EXISTS triggers (
        key TEXT PRIMARY KEY,
        tenant_id TEXT,
        namespace TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        trigger_id TEXT NOT NULL,
        interval_secs BIGINT NOT NULL,
        next_execution_date TIMESTAMPTZ NOT NULL,
        last_execution_id TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS triggers_next_idx ON triggers (next_execution_date)",
];

/// Create the schema and tables when missing.
pub async fn ensure_schema(pool: &DbPool, schema: &str) -> AppResult<()> {
    sqlx::query(&format!(
        "CREATE SCHEMA IF NOT EXISTS \"{}\"",
        schema.replace('"', "")
    ))
    .execute(pool)
    .await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!(schema = %schema, "Database schema ready");
    Ok(())
}
