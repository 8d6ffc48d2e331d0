//! HTTP handlers and the application router.

pub mod executions;
pub mod flows;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use health::{api_health, health_check};

/// All API routes over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(api_health))
        .route("/api/flows", get(flows::list).post(flows::create))
        .route("/api/flows/{namespace}/{flow_id}", get(flows::get))
        .route(
            "/api/flows/{namespace}/{flow_id}/executions",
            post(executions::submit),
        )
        .route("/api/executions", get(executions::list))
        .route("/api/executions/purge", post(executions::purge))
        .route(
            "/api/executions/restart/by-ids",
            post(executions::restart_by_ids),
        )
        .route(
            "/api/executions/replay/by-ids",
            post(executions::replay_by_ids),
        )
        .route("/api/executions/kill/by-ids", post(executions::kill_by_ids))
        .route(
            "/api/executions/resume/by-ids",
            post(executions::resume_by_ids),
        )
        .route(
            "/api/executions/{execution_id}",
            get(executions::get).delete(executions::delete),
        )
        .route(
            "/api/executions/{execution_id}/restart",
            post(executions::restart),
        )
        .route(
            "/api/executions/{execution_id}/replay",
            post(executions::replay),
        )
        .route(
            "/api/executions/{execution_id}/state",
            post(executions::change_state),
        )
        .route("/api/executions/{execution_id}/kill", post(executions::kill))
        .route(
            "/api/executions/{execution_id}/resume",
            post(executions::resume),
        )
        .route("/api/executions/{execution_id}/pause", post(executions::pause))
        .route(
            "/api/executions/{execution_id}/unqueue",
            post(executions::unqueue),
        )
        .route(
            "/api/executions/{execution_id}/labels",
            post(executions::set_labels),
        )
        .route(
            "/api/executions/{execution_id}/taskruns/{task_run_id}",
            post(executions::report_task_run),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::engine::Execution;
    use crate::state::tests::memory_state;
    use crate::test_support::*;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn app() -> Router {
        router(memory_state(flows(&[LINEAR_FLOW, PAUSE_FLOW])))
    }

    async fn submit(app: &Router, flow_id: &str) -> Execution {
        let (status, body) = call(
            app,
            Method::POST,
            &format!("/api/flows/company.team/{}/executions", flow_id),
            Some(json!({"labels": {"team": "data"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        serde_json::from_value(body).unwrap()
    }

    async fn report(app: &Router, execution: &Execution, task_id: &str, state: &str) -> Execution {
        let run = execution
            .task_run_list
            .iter()
            .rev()
            .find(|run| run.task_id == task_id)
            .unwrap();
        let (status, body) = call(
            app,
            Method::POST,
            &format!("/api/executions/{}/taskruns/{}", execution.id, run.id),
            Some(json!({ "state": state })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn test_health_routes() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage"], "memory (connected)");
        assert_eq!(body["nats"], "not_configured");
    }

    #[tokio::test]
    async fn test_create_and_get_flow() {
        let app = app();
        let yaml = "id: posted\nnamespace: company.team\ntasks:\n  - id: a\n    type: task\n";
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/flows")
            .body(Body::from(yaml))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let (status, body) = call(&app, Method::GET, "/api/flows/company.team/posted", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revision"], 1);

        let (status, _) = call(&app, Method::GET, "/api/flows/company.team/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_execution_restart_and_replay() {
        let app = app();
        let execution = submit(&app, "linear").await;
        assert_eq!(execution.current(), Running);
        assert_eq!(execution.label("team"), Some("data"));

        let execution = report(&app, &execution, "first", "SUCCESS").await;
        let failed = report(&app, &execution, "second", "FAILED").await;
        assert_eq!(failed.current(), Failed);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/replay", failed.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["parent_id"], json!(failed.id));

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/restart", failed.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], json!(failed.id));
        assert_eq!(body["metadata"]["attempt_number"], 2);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/restart", failed.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains(&failed.id));
    }

    #[tokio::test]
    async fn test_mark_task_run_state() {
        let app = app();
        let execution = submit(&app, "linear").await;
        let failed = report(&app, &execution, "first", "FAILED").await;
        let run_id = failed.task_run_list[0].id.clone();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/state", failed.id),
            Some(json!({"task_run_id": run_id, "state": "SUCCESS"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["current"], "RESTARTED");
        assert_eq!(body["task_run_list"][0]["state"]["current"], "SUCCESS");
    }

    #[tokio::test]
    async fn test_pause_resume_and_kill() {
        let app = app();
        let execution = submit(&app, "pausing").await;
        let paused = report(&app, &execution, "before", "SUCCESS").await;
        assert_eq!(paused.current(), Paused);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/resume", paused.id),
            Some(json!({"payload": {"approved": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["current"], "RESTARTED");

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/kill?state=KILLED", paused.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["current"], "KILLED");

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/kill", paused.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_delete_list_and_purge() {
        let app = app();
        let execution = submit(&app, "linear").await;

        let (status, _) = call(
            &app,
            Method::DELETE,
            &format!("/api/executions/{}", execution.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let failed = report(&app, &execution, "first", "FAILED").await;
        let (status, _) = call(
            &app,
            Method::DELETE,
            &format!("/api/executions/{}", failed.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/api/executions/{}", failed.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, listed) = call(&app, Method::GET, "/api/executions?state=FAILED", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 0);

        let (status, body) = call(&app, Method::POST, "/api/executions/purge", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["purged"], 1);
    }

    #[tokio::test]
    async fn test_pause_then_relabel() {
        let app = app();
        let execution = submit(&app, "linear").await;
        let uri = |action: &str| format!("/api/executions/{}/{}", execution.id, action);

        let (status, body) = call(&app, Method::POST, &uri("pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["current"], "PAUSED");
        let (status, _) = call(&app, Method::POST, &uri("pause"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        // the running task still lands, nothing new is dispatched
        let held = report(&app, &execution, "first", "SUCCESS").await;
        assert_eq!(held.current(), Paused);
        assert_eq!(held.task_run_list.len(), 1);

        let (status, _) = call(&app, Method::POST, &uri("labels"), Some(json!({"env": "prod"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, Method::POST, &uri("kill?state=KILLED"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::POST, &uri("labels"), Some(json!({"env": "prod"}))).await;
        assert_eq!(status, StatusCode::OK);
        let labelled: Execution = serde_json::from_value(body).unwrap();
        assert_eq!(labelled.label("env"), Some("prod"));
        assert_eq!(labelled.label("team"), None);
        assert_eq!(labelled.current(), Killed);

        let (status, _) = call(
            &app,
            Method::POST,
            &uri("labels"),
            Some(json!({"flowrun.dev/restarted": "true"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_unqueue_starts_queued_execution() {
        let app = router(memory_state(flows(&[r#"
id: single
namespace: company.team
concurrency:
  limit: 1
tasks:
  - id: only
    type: task
"#])));
        let first = submit(&app, "single").await;
        let second = submit(&app, "single").await;
        assert_eq!(second.current(), Queued);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/unqueue", first.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/executions/{}/unqueue", second.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["current"], "RUNNING");
    }

    #[tokio::test]
    async fn test_bulk_restart_collects_errors() {
        let app = app();
        let execution = submit(&app, "linear").await;
        let failed = report(&app, &execution, "first", "FAILED").await;
        let running = submit(&app, "linear").await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/executions/restart/by-ids",
            Some(json!({"ids": [failed.id, running.id, "missing"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
        assert_eq!(body["errors"][0]["execution_id"], json!(running.id));

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/executions/kill/by-ids",
            Some(json!({"ids": [running.id]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/executions/resume/by-ids",
            Some(json!({"ids": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_unknown_flow() {
        let app = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/flows/company.team/nope/executions",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
