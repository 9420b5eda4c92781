#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-engine** – Secure execution engine for external actions.
//!
//! The hot path of the substrate. Each call to [`ExecutionEngine::execute`]
//! creates an [`ExecutionContext`] owned by exactly one driver task and runs
//! the pipeline: security gate → global rate limit → input validation and
//! sanitization → adapter invocation under a deadline → retry with
//! exponential backoff → audit at every transition.
//!
//! Executions run concurrently; cancellation is cooperative and observed at
//! the adapter boundary and between retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use courier_audit::{AuditLogger, AuditScope};
use courier_registry::{ActionDefinition, ActionRegistry, AdapterError, AdapterRegistry};
use courier_schema::SchemaViolation;
use courier_security::{SecurityError, SecurityManager};
use courier_types::{AuditLevel, ExecutionStatus, SecurityLevel};

/// Fields of an adapter result that are safe to echo into audit data.
const SAFE_RESULT_FIELDS: &[&str] =
    &["status", "id", "url", "count", "success", "created", "message_id", "ticket_id"];

//─────────────────────────────
//  Execution context
//─────────────────────────────

/// State of one action execution, owned by its driver task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique execution identifier
    pub execution_id: String,
    /// Action being executed
    pub action_name: String,
    /// Acting user; `None` for system-originated executions
    pub user_id: Option<String>,
    /// Validated input
    pub input: Value,
    /// Lifecycle state
    pub status: ExecutionStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When the adapter invocation began
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,
    /// Adapter result on success
    pub result: Option<Value>,
    /// Error message on failure
    pub error: Option<String>,
    /// Retries performed so far
    pub retry_attempts: u32,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No action registered under the requested name
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    /// No execution with the given id
    #[error("unknown execution `{0}`")]
    UnknownExecution(String),
    /// Input failed schema validation
    #[error(transparent)]
    Validation(#[from] SchemaViolation),
    /// Security gate failed
    #[error(transparent)]
    Security(#[from] SecurityError),
    /// Per-action global rate window exhausted
    #[error("action `{action}` rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimited {
        /// The throttled action
        action: String,
        /// Seconds until a slot frees
        retry_after_secs: i64,
    },
    /// Adapter missing or failed terminally
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// Adapter invocation exceeded its deadline on the final attempt
    #[error("action `{action}` timed out after {secs}s")]
    Timeout {
        /// The action that timed out
        action: String,
        /// Deadline that elapsed
        secs: u64,
    },
    /// Cancelled by a caller or shutdown
    #[error("execution cancelled")]
    Cancelled,
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// Secure execution engine for external actions.
pub struct ExecutionEngine {
    security: Arc<SecurityManager>,
    registry: Arc<ActionRegistry>,
    adapters: Arc<AdapterRegistry>,
    audit: Arc<AuditLogger>,
    executions: DashMap<String, ExecutionContext>,
    cancel_tokens: DashMap<String, CancellationToken>,
    rate_windows: DashMap<String, Vec<DateTime<Utc>>>,
}

impl ExecutionEngine {
    /// Wire the engine to its collaborators.
    pub fn new(
        security: Arc<SecurityManager>,
        registry: Arc<ActionRegistry>,
        adapters: Arc<AdapterRegistry>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            security,
            registry,
            adapters,
            audit,
            executions: DashMap::new(),
            cancel_tokens: DashMap::new(),
            rate_windows: DashMap::new(),
        }
    }

    /// Execute `action_name` with `input` on behalf of `user_id`.
    ///
    /// Runs the full pipeline and returns the execution id once the
    /// execution reaches a successful terminal state; terminal failures
    /// propagate as [`EngineError`] with the context left queryable.
    #[instrument(skip(self, input), fields(action = %action_name))]
    pub async fn execute(
        &self,
        action_name: &str,
        input: Value,
        user_id: Option<String>,
    ) -> Result<String, EngineError> {
        let definition = self
            .registry
            .get(action_name)
            .ok_or_else(|| EngineError::UnknownAction(action_name.to_string()))?;

        let execution_id = Uuid::new_v4().to_string();
        let context = ExecutionContext {
            execution_id: execution_id.clone(),
            action_name: action_name.to_string(),
            user_id: user_id.clone(),
            input: input.clone(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_attempts: 0,
        };
        self.executions.insert(execution_id.clone(), context);
        let token = CancellationToken::new();
        self.cancel_tokens.insert(execution_id.clone(), token.clone());

        let outcome = self
            .run_pipeline(&execution_id, &definition, &input, user_id.as_deref(), token)
            .await;
        self.cancel_tokens.remove(&execution_id);

        match outcome {
            Ok(()) => Ok(execution_id),
            Err(error) => {
                self.fail(&execution_id, &error).await;
                Err(error)
            }
        }
    }

    async fn run_pipeline(
        &self,
        execution_id: &str,
        definition: &ActionDefinition,
        input: &Value,
        user_id: Option<&str>,
        token: CancellationToken,
    ) -> Result<(), EngineError> {
        let scope = AuditScope::execution(
            execution_id,
            definition.name,
            user_id.map(str::to_string),
        );

        // Security gate: per-user checks only apply to user-originated calls;
        // system executions skip role checks but never the approval gate.
        if let Some(user) = user_id {
            if let Err(error) =
                self.security.check_permission(user, definition.name, definition.security_level)
            {
                self.audit_denial(&error, scope.clone()).await;
                return Err(error.into());
            }
        }
        if definition.requires_approval
            && !self.security.check_approval_status(definition.name, input)
        {
            let error = SecurityError::ApprovalRequired(definition.name.to_string());
            self.audit_denial(&error, scope.clone()).await;
            return Err(error.into());
        }

        // Global per-action window, independent of any per-user limit.
        self.check_action_rate(definition)?;

        // Structural validation, then sanitization.
        definition.input_schema.validate(definition.name, input)?;
        if let Err(error) = courier_security::sanitize_input(input) {
            self.audit_denial(&error, scope.clone()).await;
            return Err(error.into());
        }

        // Adapter resolution is fail-fast and not retried.
        let adapter = self.adapters.resolve(definition.adapter)?;

        let deadline = Duration::from_secs(definition.timeout_secs);
        loop {
            let attempt = self.with_context(execution_id, |context| {
                context.status = ExecutionStatus::Running;
                context.started_at = Some(Utc::now());
                context.retry_attempts
            })?;

            let _ = self
                .audit
                .log(
                    "action_execution_start",
                    AuditLevel::Info,
                    json!({
                        "action_name": definition.name,
                        "attempt": attempt + 1,
                        "timeout_secs": definition.timeout_secs,
                    }),
                    scope.clone(),
                )
                .await;

            let invocation = tokio::time::timeout(deadline, adapter.execute(definition.name, input));
            let result = tokio::select! {
                _ = token.cancelled() => {
                    self.mark_cancelled(execution_id, scope.clone()).await;
                    return Err(EngineError::Cancelled);
                }
                result = invocation => result,
            };

            match result {
                Ok(Ok(value)) => {
                    let summary = summarize_result(&value);
                    self.with_context(execution_id, |context| {
                        context.status = ExecutionStatus::Completed;
                        context.completed_at = Some(Utc::now());
                        context.result = Some(value);
                    })?;
                    let _ = self
                        .audit
                        .log(
                            "action_execution_completed",
                            AuditLevel::Info,
                            json!({
                                "action_name": definition.name,
                                "retry_attempts": attempt,
                                "result_summary": summary,
                            }),
                            scope.clone(),
                        )
                        .await;
                    info!(execution_id, action = definition.name, "execution completed");
                    return Ok(());
                }
                Ok(Err(adapter_error)) => {
                    let retryable = adapter_error.is_retryable();
                    self.with_context(execution_id, |context| {
                        context.status = ExecutionStatus::Failed;
                        context.error = Some(adapter_error.to_string());
                    })?;
                    if retryable && attempt < definition.retry_count {
                        self.backoff(execution_id, attempt, &token).await?;
                        continue;
                    }
                    return Err(adapter_error.into());
                }
                Err(_elapsed) => {
                    self.with_context(execution_id, |context| {
                        context.status = ExecutionStatus::Timeout;
                        context.error = Some(format!(
                            "timed out after {}s",
                            definition.timeout_secs
                        ));
                    })?;
                    if attempt < definition.retry_count {
                        self.backoff(execution_id, attempt, &token).await?;
                        continue;
                    }
                    return Err(EngineError::Timeout {
                        action: definition.name.to_string(),
                        secs: definition.timeout_secs,
                    });
                }
            }
        }
    }

    /// Sleep `2^attempt` seconds before the next try, honoring cancellation.
    async fn backoff(
        &self,
        execution_id: &str,
        attempt: u32,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let delay = Duration::from_secs(1u64 << attempt.min(16));
        warn!(execution_id, attempt = attempt + 1, delay_secs = delay.as_secs(), "retrying");
        tokio::select! {
            _ = token.cancelled() => {
                self.mark_cancelled(execution_id, AuditScope::default()).await;
                return Err(EngineError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
        self.with_context(execution_id, |context| {
            context.retry_attempts += 1;
            context.status = ExecutionStatus::Pending;
        })?;
        Ok(())
    }

    fn check_action_rate(&self, definition: &ActionDefinition) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut window = self.rate_windows.entry(definition.name.to_string()).or_default();
        let minute_ago = now - chrono::Duration::minutes(1);
        window.retain(|at| *at > minute_ago);
        if window.len() >= definition.rate_limit as usize {
            let retry_after_secs = window
                .first()
                .map(|oldest| (*oldest + chrono::Duration::minutes(1) - now).num_seconds().max(1))
                .unwrap_or(60);
            return Err(EngineError::RateLimited {
                action: definition.name.to_string(),
                retry_after_secs,
            });
        }
        window.push(now);
        Ok(())
    }

    fn with_context<R>(
        &self,
        execution_id: &str,
        mutate: impl FnOnce(&mut ExecutionContext) -> R,
    ) -> Result<R, EngineError> {
        let mut context = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))?;
        Ok(mutate(&mut context))
    }

    async fn fail(&self, execution_id: &str, error: &EngineError) {
        let _ = self.with_context(execution_id, |context| {
            if !context.status.is_terminal() {
                context.status = ExecutionStatus::Failed;
            }
            if context.error.is_none() {
                context.error = Some(error.to_string());
            }
            context.completed_at = Some(Utc::now());
        });
        if matches!(
            error,
            EngineError::Adapter(_) | EngineError::Timeout { .. }
        ) {
            let (action_name, user_id) = self
                .executions
                .get(execution_id)
                .map(|c| (c.action_name.clone(), c.user_id.clone()))
                .unwrap_or_default();
            let _ = self
                .audit
                .log(
                    "action_execution_error",
                    AuditLevel::Error,
                    json!({"error": error.to_string()}),
                    AuditScope::execution(execution_id, action_name, user_id),
                )
                .await;
        }
    }

    async fn mark_cancelled(&self, execution_id: &str, scope: AuditScope) {
        let _ = self.with_context(execution_id, |context| {
            context.status = ExecutionStatus::Cancelled;
            context.completed_at = Some(Utc::now());
        });
        let _ = self
            .audit
            .log(
                "action_execution_cancelled",
                AuditLevel::Warning,
                json!({"execution_id": execution_id}),
                scope,
            )
            .await;
    }

    async fn audit_denial(&self, error: &SecurityError, scope: AuditScope) {
        let (event_type, level) = match error {
            SecurityError::ApprovalRequired(_) => ("approval_missing", AuditLevel::Warning),
            SecurityError::DangerousInput { .. } => {
                ("security_input_rejected", AuditLevel::Warning)
            }
            SecurityError::RateLimited { .. } => ("rate_limit_exceeded", AuditLevel::Warning),
            _ => ("permission_denied", AuditLevel::Warning),
        };
        let _ = self
            .audit
            .log(event_type, level, json!({"reason": error.to_string()}), scope)
            .await;
    }

    //─────────────────────────────
    //  Queries, cancellation, stats
    //─────────────────────────────

    /// Fetch an execution context by id.
    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionContext> {
        self.executions.get(execution_id).map(|entry| entry.clone())
    }

    /// Executions not yet in a terminal state.
    pub fn active_executions(&self) -> Vec<ExecutionContext> {
        self.executions
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.clone())
            .collect()
    }

    /// Request cancellation of an active execution.
    ///
    /// A caller other than the execution's owner needs elevated clearance on
    /// the `cancel_execution` policy. The engine marks the context cancelled
    /// at the next safe checkpoint.
    pub fn cancel(&self, execution_id: &str, cancelled_by: Option<&str>) -> Result<(), EngineError> {
        let context = self
            .executions
            .get(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))?;
        if context.status.is_terminal() {
            return Err(EngineError::UnknownExecution(execution_id.to_string()));
        }
        if let Some(caller) = cancelled_by {
            if context.user_id.as_deref() != Some(caller) {
                self.security
                    .check_permission(caller, "cancel_execution", SecurityLevel::Elevated)?;
            }
        }
        drop(context);
        if let Some(token) = self.cancel_tokens.get(execution_id) {
            token.cancel();
        }
        Ok(())
    }

    /// Cancel every active execution, used during shutdown.
    pub fn cancel_all(&self) {
        for token in self.cancel_tokens.iter() {
            token.cancel();
        }
    }

    /// Aggregate execution statistics.
    pub fn stats(&self) -> Value {
        let mut by_status: std::collections::BTreeMap<&'static str, u64> = Default::default();
        let mut total_time_ms = 0i64;
        let mut completed = 0u64;
        let mut by_action: std::collections::BTreeMap<String, u64> = Default::default();

        for entry in self.executions.iter() {
            *by_status.entry(entry.status.as_str()).or_insert(0) += 1;
            *by_action.entry(entry.action_name.clone()).or_insert(0) += 1;
            if entry.status == ExecutionStatus::Completed {
                completed += 1;
                if let (Some(started), Some(ended)) = (entry.started_at, entry.completed_at) {
                    total_time_ms += (ended - started).num_milliseconds();
                }
            }
        }
        let total = self.executions.len() as u64;
        let terminal: u64 = by_status
            .iter()
            .filter(|(status, _)| **status != "pending" && **status != "running")
            .map(|(_, n)| *n)
            .sum();
        let mut top_actions: Vec<(String, u64)> = by_action.into_iter().collect();
        top_actions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_actions.truncate(10);

        json!({
            "total_executions": total,
            "by_status": by_status,
            "success_rate": if terminal > 0 { completed as f64 / terminal as f64 } else { 0.0 },
            "average_execution_ms": if completed > 0 { total_time_ms / completed as i64 } else { 0 },
            "active_executions": self.active_executions().len(),
            "top_actions": top_actions
                .into_iter()
                .map(|(action, count)| json!({"action": action, "count": count}))
                .collect::<Vec<_>>(),
        })
    }
}

/// Safe summary of an adapter result for audit data; never echoes raw
/// payload fields outside the whitelist.
fn summarize_result(result: &Value) -> Value {
    let Some(map) = result.as_object() else {
        return json!({"has_result": true, "result_keys": []});
    };
    let mut summary = serde_json::Map::new();
    summary.insert("has_result".to_string(), json!(true));
    summary.insert(
        "result_keys".to_string(),
        json!(map.keys().cloned().collect::<Vec<_>>()),
    );
    for field in SAFE_RESULT_FIELDS {
        if let Some(value) = map.get(*field) {
            summary.insert((*field).to_string(), value.clone());
        }
    }
    Value::Object(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_registry::{builtin_adapter_ids, ActionAdapter};
    use courier_security::ApprovalMode;
    use courier_store_core::RecordFilter;
    use courier_store_memory::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn build_engine() -> (
        Arc<ExecutionEngine>,
        Arc<SecurityManager>,
        Arc<AuditLogger>,
        tempfile::TempDir,
    ) {
        let store = MemoryStore::shared();
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(
            store.clone(),
            dir.path().join("audit.jsonl"),
            courier_audit::AuditConfig::default(),
        )
        .await
        .unwrap();
        let security = Arc::new(SecurityManager::new(store.clone()).with_defaults());
        let registry = Arc::new(ActionRegistry::builtin());
        let adapters = Arc::new(AdapterRegistry::with_mocks(&builtin_adapter_ids()));
        let engine = Arc::new(ExecutionEngine::new(
            security.clone(),
            registry,
            adapters,
            audit.clone(),
        ));
        (engine, security, audit, dir)
    }

    async fn audit_events(audit: &AuditLogger, min: usize) -> Vec<courier_audit::AuditEvent> {
        for _ in 0..100 {
            let events = audit.query(&RecordFilter::default()).await.unwrap();
            if events.len() >= min {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        audit.query(&RecordFilter::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_completes_and_audits() {
        let (engine, _, audit, _dir) = build_engine().await;
        let execution_id = engine
            .execute(
                "send_email",
                json!({"recipients": ["ops@example.test"], "subject": "deploy done"}),
                Some("user".to_string()),
            )
            .await
            .unwrap();

        let context = engine.get_execution(&execution_id).unwrap();
        assert_eq!(context.status, ExecutionStatus::Completed);
        assert!(context.result.is_some());
        assert!(context.started_at.unwrap() <= context.completed_at.unwrap());

        let events = audit_events(&audit, 2).await;
        let start = events
            .iter()
            .find(|e| e.event_type == "action_execution_start")
            .expect("start audit");
        let done = events
            .iter()
            .find(|e| e.event_type == "action_execution_completed")
            .expect("completion audit");
        assert_eq!(start.execution_id.as_deref(), Some(execution_id.as_str()));
        assert_eq!(done.execution_id.as_deref(), Some(execution_id.as_str()));
        assert!(start.event_id < done.event_id);
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let (engine, _, _, _dir) = build_engine().await;
        let err = engine.execute("mind_control", json!({}), None).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownAction(_)));
    }

    #[tokio::test]
    async fn test_permission_denied_fails_execution() {
        let (engine, _, _, _dir) = build_engine().await;
        // `user` lacks the security_admin role for trigger_security_scan.
        let err = engine
            .execute(
                "trigger_security_scan",
                json!({"target": "prod"}),
                Some("user".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Security(SecurityError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_approval_gate_then_grant() {
        let (engine, security, _, _dir) = build_engine().await;
        let input = json!({"target": "staging", "scan_type": "dependency"});

        let err = engine
            .execute("trigger_security_scan", input.clone(), Some("system".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Security(SecurityError::ApprovalRequired(_))));

        let approval_id = security
            .request_approval(
                "trigger_security_scan",
                &input,
                "system",
                vec!["admin".to_string()],
                ApprovalMode::Single,
            )
            .await
            .unwrap();
        security.grant_approval(&approval_id, "admin").await.unwrap();

        let execution_id = engine
            .execute("trigger_security_scan", input, Some("system".to_string()))
            .await
            .unwrap();
        assert_eq!(
            engine.get_execution(&execution_id).unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_validation_and_sanitization() {
        let (engine, _, audit, _dir) = build_engine().await;

        let err = engine
            .execute("send_email", json!({"subject": "no recipients"}), None)
            .await
            .unwrap_err();
        match err {
            EngineError::Validation(violation) => assert_eq!(violation.path, "recipients"),
            other => panic!("unexpected error: {other}"),
        }

        let err = engine
            .execute(
                "send_email",
                json!({"recipients": ["a@example.test"], "subject": "x", "body": "<script>alert(1)</script>"}),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Security(SecurityError::DangerousInput { .. })));

        let events = audit_events(&audit, 1).await;
        assert!(events.iter().any(|e| e.event_type == "security_input_rejected"));
    }

    #[tokio::test]
    async fn test_global_rate_limit_independent_of_user() {
        let (engine, _, _, _dir) = build_engine().await;
        // escalate_to_human allows 5/min globally.
        let input = |i: u32| {
            json!({
                "context": format!("incident number {i} needs eyes"),
                "stakeholders": ["oncall"]
            })
        };
        for i in 0..5 {
            engine
                .execute("escalate_to_human", input(i), Some("system".to_string()))
                .await
                .unwrap();
        }
        let err = engine
            .execute("escalate_to_human", input(6), Some("system".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { .. }));
    }

    struct FlakyAdapter {
        failures: AtomicU32,
    }

    #[async_trait]
    impl ActionAdapter for FlakyAdapter {
        fn id(&self) -> &str {
            "email"
        }

        async fn execute(&self, _action: &str, _input: &Value) -> Result<Value, AdapterError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(AdapterError::Downstream {
                    message: "transient upstream error".to_string(),
                    retryable: true,
                });
            }
            Ok(json!({"status": "sent"}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let store = MemoryStore::shared();
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(
            store.clone(),
            dir.path().join("audit.jsonl"),
            courier_audit::AuditConfig::default(),
        )
        .await
        .unwrap();
        let security = Arc::new(SecurityManager::new(store.clone()).with_defaults());
        let registry = Arc::new(ActionRegistry::builtin());
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(Arc::new(FlakyAdapter { failures: AtomicU32::new(2) }));
        let engine = ExecutionEngine::new(security, registry, adapters, audit);

        let execution_id = engine
            .execute(
                "send_email",
                json!({"recipients": ["a@example.test"], "subject": "retry me"}),
                None,
            )
            .await
            .unwrap();

        let context = engine.get_execution(&execution_id).unwrap();
        assert_eq!(context.status, ExecutionStatus::Completed);
        assert_eq!(context.retry_attempts, 2);
    }

    struct ExhaustedAdapter;

    #[async_trait]
    impl ActionAdapter for ExhaustedAdapter {
        fn id(&self) -> &str {
            "email"
        }

        async fn execute(&self, _action: &str, _input: &Value) -> Result<Value, AdapterError> {
            Err(AdapterError::Downstream {
                message: "permanently broken".to_string(),
                retryable: true,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_fails() {
        let store = MemoryStore::shared();
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(
            store.clone(),
            dir.path().join("audit.jsonl"),
            courier_audit::AuditConfig::default(),
        )
        .await
        .unwrap();
        let security = Arc::new(SecurityManager::new(store.clone()).with_defaults());
        let registry = Arc::new(ActionRegistry::builtin());
        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(Arc::new(ExhaustedAdapter));
        let engine = ExecutionEngine::new(security, registry, adapters, audit);

        let err = engine
            .execute(
                "send_email",
                json!({"recipients": ["a@example.test"], "subject": "doomed"}),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Adapter(AdapterError::Downstream { .. })));
    }

    struct HangingAdapter {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ActionAdapter for HangingAdapter {
        fn id(&self) -> &str {
            "email"
        }

        async fn execute(&self, _action: &str, _input: &Value) -> Result<Value, AdapterError> {
            self.gate.notified().await;
            Ok(json!({"status": "sent"}))
        }
    }

    #[tokio::test]
    async fn test_cancel_active_execution() {
        let store = MemoryStore::shared();
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::new(
            store.clone(),
            dir.path().join("audit.jsonl"),
            courier_audit::AuditConfig::default(),
        )
        .await
        .unwrap();
        let security = Arc::new(SecurityManager::new(store.clone()).with_defaults());
        let registry = Arc::new(ActionRegistry::builtin());
        let adapters = Arc::new(AdapterRegistry::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        adapters.register(Arc::new(HangingAdapter { gate: gate.clone() }));
        let engine = Arc::new(ExecutionEngine::new(security, registry, adapters, audit));

        let runner = engine.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute(
                    "send_email",
                    json!({"recipients": ["a@example.test"], "subject": "hang on"}),
                    None,
                )
                .await
        });

        // Wait for the execution to appear and start running.
        let execution_id = loop {
            if let Some(context) = engine.active_executions().pop() {
                if context.status == ExecutionStatus::Running {
                    break context.execution_id;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        engine.cancel(&execution_id, None).unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(
            engine.get_execution(&execution_id).unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (engine, _, _, _dir) = build_engine().await;
        engine
            .execute(
                "send_email",
                json!({"recipients": ["a@example.test"], "subject": "s"}),
                None,
            )
            .await
            .unwrap();

        let stats = engine.stats();
        assert_eq!(stats["total_executions"], 1);
        assert_eq!(stats["by_status"]["completed"], 1);
        assert_eq!(stats["top_actions"][0]["action"], "send_email");
        assert!((stats["success_rate"].as_f64().unwrap() - 1.0).abs() < f64::EPSILON);
    }
}
