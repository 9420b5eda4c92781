//! HTTP surface, versioned under `/api/v1`.

use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use courier_schema::{catalog, is_valid_id, validate, PayloadKind};
use courier_store_core::RecordFilter;
use courier_types::{EndTaskReason, SecurityLevel, WebhookEventType};

use crate::error::ApiError;
use crate::state::AppState;
use crate::ws::ws_handler;

/// Version tag sent on every response.
pub const API_VERSION: &str = "v1";

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tasks", post(dispatch_task))
        .route("/tasks/batch", post(dispatch_batch))
        .route("/tasks/:task_id/status", get(task_status))
        .route("/notifications", post(accept_notification))
        .route("/webhooks", post(register_webhook))
        .route("/webhooks/test", post(test_webhook))
        .route("/webhooks/:webhook_id", delete(unregister_webhook))
        .route("/webhooks/:webhook_id/stats", get(webhook_stats))
        .route("/agent/end-task", post(agent_end_task))
        .route("/schemas", get(list_schemas))
        .route("/schemas/:payload_type", get(get_schema))
        .route("/actions", get(list_actions))
        .route("/actions/execute", post(execute_action))
        .route("/executions/:execution_id", get(get_execution))
        .route("/executions/:execution_id/cancel", post(cancel_execution))
        .route("/approvals/:approval_id/grant", post(grant_approval))
        .route("/approvals/pending", get(pending_approvals))
        .route("/stats", get(service_stats))
        .route("/audit/summary", get(audit_summary))
        .route("/audit/export", get(audit_export))
        .route("/health", get(health))
        .route("/ws", get(ws_handler));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health))
        .layer(axum::middleware::from_fn(response_headers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp `X-Request-Duration` and `X-API-Version` on every response.
async fn response_headers(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut response = next.run(request).await;
    let duration = format!("{}ms", started.elapsed().as_millis());
    if let Ok(value) = HeaderValue::from_str(&duration) {
        response.headers_mut().insert("X-Request-Duration", value);
    }
    response
        .headers_mut()
        .insert("X-API-Version", HeaderValue::from_static(API_VERSION));
    response
}

//─────────────────────────────
//  Tasks
//─────────────────────────────

async fn dispatch_task(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    validate(&payload, PayloadKind::TaskExecution)?;

    if let Some(user) = payload
        .pointer("/orchestrator_info/user_id")
        .and_then(Value::as_str)
    {
        state
            .security
            .check_permission(user, "dispatch_task", SecurityLevel::Standard)?;
    }

    let task_id = payload["task_id"].as_str().unwrap_or_default();
    let task = state.tasks.accept(task_id, payload.clone());

    // Hand the dispatch to connected executors over the live stream; the
    // audit record is the durable trace of acceptance.
    let _ = state
        .audit
        .log(
            "task_dispatched",
            courier_types::AuditLevel::Info,
            json!({"task_id": task_id, "execution_id": task.execution_id}),
            courier_audit::AuditScope::default(),
        )
        .await;
    let _ = state
        .notify
        .send(
            "executor",
            courier_types::NotificationKind::AgentStatus,
            courier_types::NotifyPriority::Medium,
            json!({"event": "task_dispatch", "task": payload}),
            None,
        )
        .await;

    Ok(Json(json!({"execution_id": task.execution_id, "status": "accepted"})))
}

async fn dispatch_batch(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    validate(&payload, PayloadKind::TaskBatch)?;

    let mut accepted = Vec::new();
    if let Some(tasks) = payload["tasks"].as_array() {
        for task in tasks {
            let task_id = task["task_id"].as_str().unwrap_or_default();
            let dispatched = state.tasks.accept(task_id, task.clone());
            accepted.push(json!({
                "task_id": task_id,
                "execution_id": dispatched.execution_id,
            }));
        }
    }
    Ok(Json(json!({
        "batch_id": payload["batch_id"],
        "accepted": accepted,
        "status": "accepted",
    })))
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !is_valid_id(&task_id) {
        return Err(ApiError::bad_request("task_id must be 1..=100 characters from [A-Za-z0-9_-]"));
    }
    state
        .tasks
        .status(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown task `{task_id}`")))
}

//─────────────────────────────
//  Notifications
//─────────────────────────────

async fn accept_notification(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    validate(&payload, PayloadKind::Notification)?;
    let notification = state.notify.decode(&payload)?;
    let id = notification.id.clone();
    let outcome = state.notify.process(notification).await?;
    Ok(Json(json!({
        "status": "accepted",
        "notification_id": id,
        "outcome": format!("{outcome:?}").to_lowercase(),
    })))
}

//─────────────────────────────
//  Webhooks
//─────────────────────────────

async fn register_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let endpoint = state.webhooks.register_from_payload(&payload).await?;
    Ok(Json(json!({
        "status": "webhook_registered",
        "webhook_id": endpoint.webhook_id,
        "url": endpoint.url,
    })))
}

async fn unregister_webhook(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.webhooks.unregister(&webhook_id).await? {
        return Err(ApiError::not_found(format!("unknown webhook `{webhook_id}`")));
    }
    Ok(Json(json!({"status": "webhook_unregistered", "webhook_id": webhook_id})))
}

async fn webhook_stats(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.webhooks.stats(&webhook_id).await?))
}

#[derive(Debug, Deserialize)]
struct TestWebhookBody {
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    target_webhooks: Option<Vec<String>>,
}

async fn test_webhook(
    State(state): State<AppState>,
    Json(body): Json<TestWebhookBody>,
) -> Result<Json<Value>, ApiError> {
    let event_type = WebhookEventType::parse(&body.event_type)
        .ok_or_else(|| ApiError::bad_request(format!("unknown event_type `{}`", body.event_type)))?;
    let queued = state
        .webhooks
        .send(event_type, body.payload, body.target_webhooks.as_deref())?;
    Ok(Json(json!({"status": "webhook_sent", "queued": queued})))
}

//─────────────────────────────
//  Agent end-task
//─────────────────────────────

async fn agent_end_task(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    validate(&payload, PayloadKind::AgentEndTask)?;

    let task_id = payload["task_id"].as_str().unwrap_or_default();
    let agent_id = payload["agent_id"].as_str().unwrap_or_default();
    let reason = payload["completion_status"]
        .as_str()
        .and_then(EndTaskReason::parse)
        .ok_or_else(|| ApiError::bad_request("unrecognized completion_status"))?;
    let strings = |field: &str| -> Vec<String> {
        payload
            .get(field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let report = state
        .endtask
        .end_task(
            task_id,
            agent_id,
            reason,
            payload.get("execution_summary").cloned().unwrap_or_else(|| json!({})),
            strings("cleanup_actions"),
            strings("next_steps"),
            payload.get("metadata").cloned().unwrap_or_else(|| json!({})),
        )
        .await?;

    Ok(Json(json!({
        "status": "task_ended",
        "task_id": report.task_id,
        "reason": report.reason.as_str(),
        "cleanup": report.cleanup,
        "notification_id": report.notification_id,
        "webhook_sent": report.webhook_sent,
        "timestamp": report.timestamp.to_rfc3339(),
    })))
}

//─────────────────────────────
//  Schemas and actions
//─────────────────────────────

async fn list_schemas(State(_state): State<AppState>) -> Json<Value> {
    let schemas: Vec<Value> = PayloadKind::all().iter().map(|kind| catalog::describe(*kind)).collect();
    Json(json!({"schemas": schemas}))
}

async fn get_schema(
    State(_state): State<AppState>,
    Path(payload_type): Path<String>,
) -> Result<Json<Value>, ApiError> {
    PayloadKind::parse(&payload_type)
        .map(|kind| Json(catalog::describe(kind)))
        .ok_or_else(|| ApiError::not_found(format!("unknown payload type `{payload_type}`")))
}

async fn list_actions(State(state): State<AppState>) -> Json<Value> {
    let actions: Vec<Value> = state
        .registry
        .all()
        .into_iter()
        .map(|definition| {
            json!({
                "name": definition.name,
                "description": definition.description,
                "category": definition.category,
                "security_level": definition.security_level.as_str(),
                "rate_limit": definition.rate_limit,
                "requires_approval": definition.requires_approval,
                "input_schema": definition.input_schema.describe(),
            })
        })
        .collect();
    Json(json!({"actions": actions, "count": actions.len()}))
}

#[derive(Debug, Deserialize)]
struct ExecuteActionBody {
    action_name: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    user_id: Option<String>,
}

async fn execute_action(
    State(state): State<AppState>,
    Json(body): Json<ExecuteActionBody>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = state
        .engine
        .execute(&body.action_name, body.input, body.user_id)
        .await?;
    let context = state.engine.get_execution(&execution_id);
    Ok(Json(json!({
        "execution_id": execution_id,
        "status": context.as_ref().map(|c| c.status.as_str()).unwrap_or("unknown"),
        "result": context.and_then(|c| c.result),
    })))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .get_execution(&execution_id)
        .map(|context| Json(serde_json::to_value(context).unwrap_or_default()))
        .ok_or_else(|| ApiError::not_found(format!("unknown execution `{execution_id}`")))
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    #[serde(default)]
    cancelled_by: Option<String>,
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<Value>, ApiError> {
    state.engine.cancel(&execution_id, body.cancelled_by.as_deref())?;
    Ok(Json(json!({"status": "cancellation_requested", "execution_id": execution_id})))
}

//─────────────────────────────
//  Approvals
//─────────────────────────────

#[derive(Debug, Deserialize)]
struct GrantBody {
    approver: String,
}

async fn grant_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(body): Json<GrantBody>,
) -> Result<Json<Value>, ApiError> {
    let status = state.security.grant_approval(&approval_id, &body.approver).await?;
    Ok(Json(json!({"approval_id": approval_id, "status": status})))
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    user: String,
}

async fn pending_approvals(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Json<Value> {
    let pending: Vec<Value> = state
        .security
        .pending_approvals(&query.user)
        .into_iter()
        .map(|request| {
            json!({
                "approval_id": request.approval_id,
                "action_name": request.action_name,
                "requester_id": request.requester_id,
                "approvals_received": request.approvals_received.len(),
                "approvals_required": request.approvals_required,
                "expires_at": request.expires_at.to_rfc3339(),
            })
        })
        .collect();
    Json(json!({"pending": pending}))
}

//─────────────────────────────
//  Stats, audit, health
//─────────────────────────────

async fn service_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "executions": state.engine.stats(),
        "security": state.security.security_metrics(),
        "notifications": state.notify.metrics().snapshot(),
        "webhooks": state.webhooks.endpoints().len(),
        "dispatched_tasks": state.tasks.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    #[serde(default = "default_window")]
    hours: i64,
}

fn default_window() -> i64 {
    24
}

async fn audit_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.audit.summary(query.hours).await?))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default = "default_format")]
    format: String,
}

fn default_format() -> String {
    "json".to_string()
}

async fn audit_export(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let bytes = state.audit.export(&query.format, &RecordFilter::default()).await?;
    let content_type = if query.format == "csv" { "text/csv" } else { "application/json" };
    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "components": {
            "store": "up",
            "audit": "up",
            "engine": {"active_executions": state.engine.active_executions().len()},
            "notifications": state.notify.metrics().snapshot(),
            "webhooks": {
                "endpoints": state.webhooks.endpoints().len(),
            },
            "streaming_clients": state.notify.subscriber_count(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::util::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use courier_security::ApprovalMode;
    use courier_store_memory::MemoryStore;
    use courier_webhook::verify_signature;

    use crate::config::ServiceConfig;

    async fn test_state(dir: &tempfile::TempDir) -> AppState {
        let config = ServiceConfig {
            audit_file: dir
                .path()
                .join("audit.jsonl")
                .to_string_lossy()
                .into_owned(),
            shutdown_grace: Duration::from_secs(1),
            ..ServiceConfig::default()
        };
        AppState::build(config, MemoryStore::shared()).await.unwrap()
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value, axum::http::HeaderMap) {
        let mut builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                builder.body(Body::from(body.to_string())).unwrap()
            }
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            json!(null)
        } else {
            serde_json::from_slice(&bytes).unwrap_or(json!(null))
        };
        (status, value, headers)
    }

    fn happy_task() -> Value {
        json!({
            "task_id": "t1",
            "task_type": "code_generation",
            "description": "Generate fib helpers",
            "priority": "normal",
            "orchestrator_info": {
                "agent_id": "m1",
                "timestamp": "2024-01-01T00:00:00Z"
            }
        })
    }

    #[tokio::test]
    async fn test_dispatch_and_status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        let (status, body, headers) =
            request(&app, "POST", "/api/v1/tasks", Some(happy_task())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        let execution_id = body["execution_id"].as_str().unwrap().to_string();
        assert!(!execution_id.is_empty());
        assert_eq!(headers.get("X-API-Version").unwrap(), "v1");
        assert!(headers.contains_key("X-Request-Duration"));

        let (status, body, _) =
            request(&app, "GET", "/api/v1/tasks/t1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["execution_id"], execution_id);

        let (status, _, _) =
            request(&app, "GET", "/api/v1/tasks/unknown-task/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Malformed id shape is a validation error, not a lookup miss.
        let long_id = "x".repeat(101);
        let (status, body, _) =
            request(&app, "GET", &format!("/api/v1/tasks/{long_id}/status"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_schema_error_returns_400_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        let mut bad = happy_task();
        bad["description"] = json!("short");
        let (status, body, _) = request(&app, "POST", "/api/v1/tasks", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "validation_error");
        assert_eq!(body["path"], "description");
    }

    #[tokio::test]
    async fn test_batch_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        let batch = json!({
            "batch_id": "b1",
            "tasks": [happy_task()],
            "orchestrator_info": {"agent_id": "m1", "timestamp": "2024-01-01T00:00:00Z"}
        });
        let (status, body, _) = request(&app, "POST", "/api/v1/tasks/batch", Some(batch)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_end_task_fans_out_signed_webhook() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state.clone());

        let receiver = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&receiver)
            .await;

        let (status, _, _) = request(
            &app,
            "POST",
            "/api/v1/webhooks",
            Some(json!({
                "webhook_id": "orchestrator-hook",
                "url": receiver.uri(),
                "secret": "s1-very-long-secret",
                "event_types": ["task_lifecycle"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body, _) = request(
            &app,
            "POST",
            "/api/v1/agent/end-task",
            Some(json!({
                "task_id": "t1",
                "agent_id": "executor-1",
                "completion_status": "success",
                "timestamp": "2024-01-01T00:05:00Z",
                "execution_summary": {"files_created": ["fib.rs"]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "task_ended");
        assert_eq!(body["webhook_sent"], true);

        // Wait for the delivery worker, then verify body and signature.
        let mut delivered = Vec::new();
        for _ in 0..200 {
            delivered = receiver.received_requests().await.unwrap();
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered.len(), 1);
        let received: Value = serde_json::from_slice(&delivered[0].body).unwrap();
        assert_eq!(received["task_id"], "t1");
        let signature = delivered[0]
            .headers
            .get("X-Signature-SHA256")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(verify_signature("s1-very-long-secret", &received, signature));

        // Stats reflect the terminal success.
        for _ in 0..200 {
            if state
                .webhooks
                .endpoint("orchestrator-hook")
                .unwrap()
                .successful_deliveries
                == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (status, body, _) = request(
            &app,
            "GET",
            "/api/v1/webhooks/orchestrator-hook/stats",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["successful_deliveries"], 1);
        assert_eq!(body["failed_deliveries"], 0);
    }

    #[tokio::test]
    async fn test_notification_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        let (status, body, _) = request(
            &app,
            "POST",
            "/api/v1/notifications",
            Some(json!({
                "id": "n1",
                "type": "task_progress",
                "priority": "low",
                "source": "executor",
                "target": "orchestrator",
                "timestamp": "2024-01-01T00:00:00Z",
                "data": {"task_id": "t1", "progress_percentage": 50, "current_step": "halfway"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["notification_id"], "n1");

        let (status, body, _) = request(
            &app,
            "POST",
            "/api/v1/notifications",
            Some(json!({
                "id": "n2",
                "type": "task_progress",
                "priority": "low",
                "source": "executor",
                "target": "orchestrator",
                "timestamp": "2024-01-01T00:00:00Z",
                "data": {"current_step": "halfway"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["path"], "data/progress_percentage");
    }

    #[tokio::test]
    async fn test_approval_gate_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state.clone());

        let execute = json!({
            "action_name": "trigger_security_scan",
            "input": {"target": "prod", "scan_type": "dependency"},
            "user_id": "system"
        });
        let (status, body, _) =
            request(&app, "POST", "/api/v1/actions/execute", Some(execute.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_kind"], "approval_required");

        let approval_id = state
            .security
            .request_approval(
                "trigger_security_scan",
                &json!({"target": "prod", "scan_type": "dependency"}),
                "system",
                vec!["admin".to_string()],
                ApprovalMode::Single,
            )
            .await
            .unwrap();

        let (status, body, _) = request(
            &app,
            "POST",
            &format!("/api/v1/approvals/{approval_id}/grant"),
            Some(json!({"approver": "admin"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "approved");

        let (status, body, _) =
            request(&app, "POST", "/api/v1/actions/execute", Some(execute)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert!(body["result"]["scan_id"].as_str().unwrap().starts_with("SCAN-"));
    }

    #[tokio::test]
    async fn test_dangerous_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        let (status, body, _) = request(
            &app,
            "POST",
            "/api/v1/actions/execute",
            Some(json!({
                "action_name": "send_email",
                "input": {
                    "recipients": ["ops@example.test"],
                    "subject": "hi",
                    "body": "<script>alert(1)</script>"
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "validation_error");
        assert_eq!(body["path"], "body");
    }

    #[tokio::test]
    async fn test_schemas_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        let (status, body, _) = request(&app, "GET", "/api/v1/schemas", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schemas"].as_array().unwrap().len(), 6);

        let (status, body, _) =
            request(&app, "GET", "/api/v1/schemas/task_execution", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload_type"], "task_execution");

        let (status, _, _) = request(&app, "GET", "/api/v1/schemas/nonsense", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body, _) = request(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["store"], "up");
    }

    #[tokio::test]
    async fn test_stats_and_audit_export() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        request(
            &app,
            "POST",
            "/api/v1/actions/execute",
            Some(json!({
                "action_name": "send_chat_message",
                "input": {"channel": "#ops", "message": "deployed"}
            })),
        )
        .await;

        let (status, body, _) = request(&app, "GET", "/api/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["executions"]["total_executions"], 1);

        let (status, _, headers) =
            request(&app, "GET", "/api/v1/audit/export?format=csv", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("content-type").unwrap(), "text/csv");

        let (status, _, _) =
            request(&app, "GET", "/api/v1/audit/export?format=xml", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_webhook_stats_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = router(state);

        let (status, body, _) =
            request(&app, "GET", "/api/v1/webhooks/ghost/stats", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_kind"], "not_found");
    }
}
