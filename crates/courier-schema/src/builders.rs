//! Builders for catalog payloads.
//!
//! Each builder produces a `serde_json::Value` that passes [`crate::validate`]
//! for its kind, provided the documented argument bounds hold (identifier
//! charset and length, description length, and so on). Identifiers and
//! timestamps that the caller does not supply are generated here.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use courier_types::{EndTaskReason, NotificationKind, NotifyPriority, TaskPriority, TaskType};

//─────────────────────────────
//  Task execution
//─────────────────────────────

/// Builds a `task_execution` payload.
#[derive(Debug, Clone)]
pub struct TaskExecutionBuilder {
    task_id: String,
    task_type: TaskType,
    description: String,
    priority: TaskPriority,
    orchestrator_id: String,
    session_id: Option<String>,
    user_id: Option<String>,
    callback_url: Option<String>,
    estimated_duration: Option<i64>,
    timeout: Option<i64>,
    parameters: Option<Value>,
}

impl TaskExecutionBuilder {
    /// Start a builder from the required fields.
    pub fn new(
        task_id: impl Into<String>,
        task_type: TaskType,
        description: impl Into<String>,
        orchestrator_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            description: description.into(),
            priority: TaskPriority::Normal,
            orchestrator_id: orchestrator_id.into(),
            session_id: None,
            user_id: None,
            callback_url: None,
            estimated_duration: None,
            timeout: None,
            parameters: None,
        }
    }

    /// Override the default `normal` priority.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a session identifier to `orchestrator_info`.
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach a user identifier to `orchestrator_info`.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a status-callback URL to `orchestrator_info`.
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Estimated duration in seconds (1..=86400).
    pub fn estimated_duration(mut self, seconds: i64) -> Self {
        self.estimated_duration = Some(seconds);
        self
    }

    /// Execution timeout in seconds (30..=3600).
    pub fn timeout(mut self, seconds: i64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Task-specific parameters object.
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Produce the payload, stamping `orchestrator_info.timestamp` with now.
    pub fn build(self) -> Value {
        let mut info = Map::new();
        info.insert("agent_id".to_string(), json!(self.orchestrator_id));
        info.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        if let Some(session_id) = self.session_id {
            info.insert("session_id".to_string(), json!(session_id));
        }
        if let Some(user_id) = self.user_id {
            info.insert("user_id".to_string(), json!(user_id));
        }
        if let Some(url) = self.callback_url {
            info.insert("callback_url".to_string(), json!(url));
        }

        let mut payload = Map::new();
        payload.insert("task_id".to_string(), json!(self.task_id));
        payload.insert("task_type".to_string(), json!(self.task_type.as_str()));
        payload.insert("description".to_string(), json!(self.description));
        payload.insert("priority".to_string(), json!(self.priority.as_str()));
        payload.insert("orchestrator_info".to_string(), Value::Object(info));
        if let Some(seconds) = self.estimated_duration {
            payload.insert("estimated_duration".to_string(), json!(seconds));
        }
        if let Some(seconds) = self.timeout {
            payload.insert("timeout".to_string(), json!(seconds));
        }
        if let Some(parameters) = self.parameters {
            payload.insert("parameters".to_string(), parameters);
        }
        Value::Object(payload)
    }
}

//─────────────────────────────
//  Notification
//─────────────────────────────

/// Builds a `notification` payload.
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    kind: NotificationKind,
    priority: NotifyPriority,
    source: String,
    target: String,
    data: Value,
    metadata: Option<Value>,
    expires_at: Option<DateTime<Utc>>,
}

impl NotificationBuilder {
    /// Start a builder from the required fields. `data` must satisfy the
    /// kind's discriminated requirements for the payload to validate.
    pub fn new(
        kind: NotificationKind,
        source: impl Into<String>,
        target: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            kind,
            priority: NotifyPriority::Medium,
            source: source.into(),
            target: target.into(),
            data,
            metadata: None,
            expires_at: None,
        }
    }

    /// Override the default `medium` priority.
    pub fn priority(mut self, priority: NotifyPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach free-form metadata.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the dispatch deadline.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Produce the payload with a fresh id and current timestamp.
    pub fn build(self) -> Value {
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(Uuid::new_v4().simple().to_string()));
        payload.insert("type".to_string(), json!(self.kind.as_str()));
        payload.insert("priority".to_string(), json!(self.priority.as_str()));
        payload.insert("source".to_string(), json!(self.source));
        payload.insert("target".to_string(), json!(self.target));
        payload.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        payload.insert("data".to_string(), self.data);
        if let Some(metadata) = self.metadata {
            payload.insert("metadata".to_string(), metadata);
        }
        if let Some(at) = self.expires_at {
            payload.insert("expires_at".to_string(), json!(at.to_rfc3339()));
        }
        Value::Object(payload)
    }
}

//─────────────────────────────
//  Agent end-task
//─────────────────────────────

/// Builds an `agent_end_task` payload.
#[derive(Debug, Clone)]
pub struct AgentEndTaskBuilder {
    task_id: String,
    agent_id: String,
    reason: EndTaskReason,
    execution_summary: Option<Value>,
    cleanup_actions: Vec<String>,
    next_steps: Vec<String>,
    metadata: Option<Value>,
    next_actions: Option<Value>,
}

impl AgentEndTaskBuilder {
    /// Start a builder from the required fields.
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        reason: EndTaskReason,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            reason,
            execution_summary: None,
            cleanup_actions: Vec::new(),
            next_steps: Vec::new(),
            metadata: None,
            next_actions: None,
        }
    }

    /// Attach the execution summary object.
    pub fn execution_summary(mut self, summary: Value) -> Self {
        self.execution_summary = Some(summary);
        self
    }

    /// Cleanup actions the executor expects to be run.
    pub fn cleanup_actions(mut self, actions: Vec<String>) -> Self {
        self.cleanup_actions = actions;
        self
    }

    /// Recommended follow-up tasks.
    pub fn next_steps(mut self, steps: Vec<String>) -> Self {
        self.next_steps = steps;
        self
    }

    /// Attach free-form metadata.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach the recommended next-actions object.
    pub fn next_actions(mut self, next_actions: Value) -> Self {
        self.next_actions = Some(next_actions);
        self
    }

    /// Produce the payload, stamping the current timestamp.
    pub fn build(self) -> Value {
        let mut payload = Map::new();
        payload.insert("task_id".to_string(), json!(self.task_id));
        payload.insert("agent_id".to_string(), json!(self.agent_id));
        payload.insert("completion_status".to_string(), json!(self.reason.as_str()));
        payload.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        if let Some(summary) = self.execution_summary {
            payload.insert("execution_summary".to_string(), summary);
        }
        if !self.cleanup_actions.is_empty() {
            payload.insert("cleanup_actions".to_string(), json!(self.cleanup_actions));
        }
        if !self.next_steps.is_empty() {
            payload.insert("next_steps".to_string(), json!(self.next_steps));
        }
        if let Some(metadata) = self.metadata {
            payload.insert("metadata".to_string(), metadata);
        }
        if let Some(next_actions) = self.next_actions {
            payload.insert("next_actions".to_string(), next_actions);
        }
        Value::Object(payload)
    }
}

//─────────────────────────────
//  One-shot builders
//─────────────────────────────

/// Build a `webhook_registration` payload.
pub fn build_webhook_registration(
    webhook_id: &str,
    url: &str,
    event_types: &[&str],
    secret: Option<&str>,
) -> Value {
    let mut payload = Map::new();
    payload.insert("webhook_id".to_string(), json!(webhook_id));
    payload.insert("url".to_string(), json!(url));
    payload.insert("event_types".to_string(), json!(event_types));
    if let Some(secret) = secret {
        payload.insert("secret".to_string(), json!(secret));
    }
    payload.insert("active".to_string(), json!(true));
    Value::Object(payload)
}

/// Build a `status_request` payload.
pub fn build_status_request(request_type: &str, target_id: Option<&str>) -> Value {
    let mut payload = Map::new();
    payload.insert("request_type".to_string(), json!(request_type));
    if let Some(target_id) = target_id {
        payload.insert("target_id".to_string(), json!(target_id));
    }
    Value::Object(payload)
}
