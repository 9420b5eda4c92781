#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-schema** – Payload schema catalog and validator.
//!
//! Every payload crossing the orchestrator ↔ executor boundary is validated
//! here before any component acts on it. The catalog is a closed set of
//! payload kinds with hand-written structural validators; there is no
//! reflection and no runtime schema loading. Validation is a pure function
//! over a `serde_json::Value` and reports the first offending field in
//! lexicographic path order, so error output is deterministic regardless of
//! map iteration order.
//!
//! The companion [`builders`] module constructs payloads that are guaranteed
//! to validate when the documented argument bounds are respected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use courier_types::{EndTaskReason, NotificationKind, TaskPriority, TaskType};

pub mod builders;
pub mod catalog;

pub use builders::{
    AgentEndTaskBuilder, NotificationBuilder, TaskExecutionBuilder, build_status_request,
    build_webhook_registration,
};
pub use catalog::describe;

//─────────────────────────────
//  Payload kinds
//─────────────────────────────

/// The closed set of payload shapes the substrate accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Orchestrator → executor task dispatch
    TaskExecution,
    /// Orchestrator → executor batched dispatch
    TaskBatch,
    /// Executor → orchestrator lifecycle notification
    Notification,
    /// Webhook endpoint registration
    WebhookRegistration,
    /// Status query
    StatusRequest,
    /// Executor task-end report
    AgentEndTask,
}

impl PayloadKind {
    /// Wire-format name of the payload kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::TaskExecution => "task_execution",
            PayloadKind::TaskBatch => "task_batch",
            PayloadKind::Notification => "notification",
            PayloadKind::WebhookRegistration => "webhook_registration",
            PayloadKind::StatusRequest => "status_request",
            PayloadKind::AgentEndTask => "agent_end_task",
        }
    }

    /// Parse a wire-format name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "task_execution" => PayloadKind::TaskExecution,
            "task_batch" => PayloadKind::TaskBatch,
            "notification" => PayloadKind::Notification,
            "webhook_registration" => PayloadKind::WebhookRegistration,
            "status_request" => PayloadKind::StatusRequest,
            "agent_end_task" => PayloadKind::AgentEndTask,
            _ => return None,
        })
    }

    /// All members of the catalog.
    pub fn all() -> &'static [PayloadKind] {
        &[
            PayloadKind::TaskExecution,
            PayloadKind::TaskBatch,
            PayloadKind::Notification,
            PayloadKind::WebhookRegistration,
            PayloadKind::StatusRequest,
            PayloadKind::AgentEndTask,
        ]
    }
}

//─────────────────────────────
//  Violations
//─────────────────────────────

/// A structural violation found during validation.
///
/// `path` addresses the offending field with `/`-separated segments
/// (`orchestrator_info/agent_id`, `tasks/2/description`). When several
/// fields are invalid, the violation with the lexicographically smallest
/// path is reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("invalid field `{path}`: {message}")]
pub struct SchemaViolation {
    /// Slash-separated path to the offending field
    pub path: String,
    /// Human-readable description of the violation
    pub message: String,
    /// Pointer into the catalog entry that was violated
    pub schema_pointer: String,
}

#[derive(Default)]
struct Violations {
    kind: &'static str,
    found: Vec<SchemaViolation>,
}

impl Violations {
    fn new(kind: PayloadKind) -> Self {
        Self { kind: kind.as_str(), found: Vec::new() }
    }

    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        let path = path.into();
        let schema_pointer = format!("{}#/{}", self.kind, path);
        self.found.push(SchemaViolation { path, message: message.into(), schema_pointer });
    }

    fn into_result(mut self) -> Result<(), SchemaViolation> {
        if self.found.is_empty() {
            return Ok(());
        }
        self.found.sort_by(|a, b| a.path.cmp(&b.path));
        Err(self.found.remove(0))
    }
}

//─────────────────────────────
//  Entry point
//─────────────────────────────

/// Validate `payload` against the catalog entry for `kind`.
///
/// Pure function: no side effects, no clock access beyond none at all.
/// Returns the first violation in lexicographic path order.
pub fn validate(payload: &Value, kind: PayloadKind) -> Result<(), SchemaViolation> {
    let mut v = Violations::new(kind);
    let Some(map) = payload.as_object() else {
        v.push("", "payload must be a JSON object");
        return v.into_result();
    };
    match kind {
        PayloadKind::TaskExecution => check_task_execution(map, "", &mut v),
        PayloadKind::TaskBatch => check_task_batch(map, &mut v),
        PayloadKind::Notification => check_notification(map, &mut v),
        PayloadKind::WebhookRegistration => check_webhook_registration(map, &mut v),
        PayloadKind::StatusRequest => check_status_request(map, &mut v),
        PayloadKind::AgentEndTask => check_agent_end_task(map, &mut v),
    }
    v.into_result()
}

/// True if `s` is a well-formed opaque identifier: 1..=100 characters from
/// `[A-Za-z0-9_-]`.
pub fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 100
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

//─────────────────────────────
//  Field helpers
//─────────────────────────────

fn join(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}/{field}")
    }
}

fn get_str<'a>(
    map: &'a Map<String, Value>,
    prefix: &str,
    field: &str,
    required: bool,
    v: &mut Violations,
) -> Option<&'a str> {
    match map.get(field) {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => {
            v.push(join(prefix, field), "must be a string");
            None
        }
        None => {
            if required {
                v.push(join(prefix, field), "required field is missing");
            }
            None
        }
    }
}

fn get_i64(
    map: &Map<String, Value>,
    prefix: &str,
    field: &str,
    required: bool,
    v: &mut Violations,
) -> Option<i64> {
    match map.get(field) {
        Some(value) => match value.as_i64() {
            Some(n) => Some(n),
            None => {
                v.push(join(prefix, field), "must be an integer");
                None
            }
        },
        None => {
            if required {
                v.push(join(prefix, field), "required field is missing");
            }
            None
        }
    }
}

fn get_object<'a>(
    map: &'a Map<String, Value>,
    prefix: &str,
    field: &str,
    required: bool,
    v: &mut Violations,
) -> Option<&'a Map<String, Value>> {
    match map.get(field) {
        Some(Value::Object(inner)) => Some(inner),
        Some(_) => {
            v.push(join(prefix, field), "must be an object");
            None
        }
        None => {
            if required {
                v.push(join(prefix, field), "required field is missing");
            }
            None
        }
    }
}

fn check_bool(map: &Map<String, Value>, prefix: &str, field: &str, v: &mut Violations) {
    if let Some(value) = map.get(field) {
        if !value.is_boolean() {
            v.push(join(prefix, field), "must be a boolean");
        }
    }
}

fn check_rfc3339(map: &Map<String, Value>, prefix: &str, field: &str, required: bool, v: &mut Violations) {
    if let Some(s) = get_str(map, prefix, field, required, v) {
        if chrono::DateTime::parse_from_rfc3339(s).is_err() {
            v.push(join(prefix, field), "must be an ISO-8601 timestamp");
        }
    }
}

fn check_id_field(map: &Map<String, Value>, prefix: &str, field: &str, v: &mut Violations) {
    if let Some(s) = get_str(map, prefix, field, true, v) {
        if !is_valid_id(s) {
            v.push(
                join(prefix, field),
                "must be 1..=100 characters from [A-Za-z0-9_-]",
            );
        }
    }
}

fn check_string_array(map: &Map<String, Value>, prefix: &str, field: &str, v: &mut Violations) {
    if let Some(value) = map.get(field) {
        match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        v.push(format!("{}/{}", join(prefix, field), i), "must be a string");
                    }
                }
            }
            None => v.push(join(prefix, field), "must be an array of strings"),
        }
    }
}

fn check_no_unknown_fields(
    map: &Map<String, Value>,
    prefix: &str,
    allowed: &[&str],
    v: &mut Violations,
) {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            v.push(join(prefix, key), "unknown field");
        }
    }
}

//─────────────────────────────
//  Task execution
//─────────────────────────────

const TASK_EXECUTION_FIELDS: &[&str] = &[
    "task_id",
    "task_type",
    "description",
    "priority",
    "complexity",
    "estimated_duration",
    "timeout",
    "orchestrator_info",
    "parameters",
    "context",
    "execution_options",
];

fn check_task_execution(map: &Map<String, Value>, prefix: &str, v: &mut Violations) {
    check_no_unknown_fields(map, prefix, TASK_EXECUTION_FIELDS, v);
    check_id_field(map, prefix, "task_id", v);

    if let Some(s) = get_str(map, prefix, "task_type", true, v) {
        if TaskType::parse(s).is_none() {
            v.push(join(prefix, "task_type"), "not a recognized task type");
        }
    }
    if let Some(s) = get_str(map, prefix, "description", true, v) {
        if s.len() < 10 || s.len() > 10_000 {
            v.push(join(prefix, "description"), "length must be within 10..=10000");
        }
    }
    if let Some(s) = get_str(map, prefix, "priority", true, v) {
        if TaskPriority::parse(s).is_none() {
            v.push(join(prefix, "priority"), "must be one of low, normal, high, critical");
        }
    }
    if let Some(s) = get_str(map, prefix, "complexity", false, v) {
        if !matches!(s, "low" | "medium" | "high" | "critical") {
            v.push(join(prefix, "complexity"), "must be one of low, medium, high, critical");
        }
    }
    if let Some(n) = get_i64(map, prefix, "estimated_duration", false, v) {
        if !(1..=86_400).contains(&n) {
            v.push(join(prefix, "estimated_duration"), "must be within 1..=86400 seconds");
        }
    }
    if let Some(n) = get_i64(map, prefix, "timeout", false, v) {
        if !(30..=3_600).contains(&n) {
            v.push(join(prefix, "timeout"), "must be within 30..=3600 seconds");
        }
    }
    if let Some(info) = get_object(map, prefix, "orchestrator_info", true, v) {
        check_orchestrator_info(info, &join(prefix, "orchestrator_info"), v);
    }
    for field in ["parameters", "context", "execution_options"] {
        if let Some(value) = map.get(field) {
            if !value.is_object() {
                v.push(join(prefix, field), "must be an object");
            }
        }
    }
}

fn check_orchestrator_info(map: &Map<String, Value>, prefix: &str, v: &mut Violations) {
    let _ = get_str(map, prefix, "agent_id", true, v);
    check_rfc3339(map, prefix, "timestamp", true, v);
    for field in ["session_id", "user_id", "callback_url"] {
        let _ = get_str(map, prefix, field, false, v);
    }
}

//─────────────────────────────
//  Task batch
//─────────────────────────────

fn check_task_batch(map: &Map<String, Value>, v: &mut Violations) {
    check_no_unknown_fields(map, "", &["batch_id", "tasks", "batch_options", "orchestrator_info"], v);
    check_id_field(map, "", "batch_id", v);

    match map.get("tasks") {
        Some(Value::Array(tasks)) => {
            if tasks.is_empty() || tasks.len() > 100 {
                v.push("tasks", "batch size must be within 1..=100");
            }
            for (i, task) in tasks.iter().enumerate() {
                let prefix = format!("tasks/{i}");
                match task.as_object() {
                    Some(task_map) => check_task_execution(task_map, &prefix, v),
                    None => v.push(prefix, "must be an object"),
                }
            }
        }
        Some(_) => v.push("tasks", "must be an array"),
        None => v.push("tasks", "required field is missing"),
    }

    if let Some(info) = get_object(map, "", "orchestrator_info", true, v) {
        check_orchestrator_info(info, "orchestrator_info", v);
    }
    if let Some(options) = get_object(map, "", "batch_options", false, v) {
        if let Some(s) = get_str(options, "batch_options", "execution_mode", false, v) {
            if !matches!(s, "sequential" | "parallel" | "dependency_based") {
                v.push(
                    "batch_options/execution_mode",
                    "must be one of sequential, parallel, dependency_based",
                );
            }
        }
        if let Some(n) = get_i64(options, "batch_options", "max_concurrent", false, v) {
            if !(1..=10).contains(&n) {
                v.push("batch_options/max_concurrent", "must be within 1..=10");
            }
        }
        check_bool(options, "batch_options", "fail_fast", v);
        if let Some(n) = get_i64(options, "batch_options", "timeout", false, v) {
            if !(60..=7_200).contains(&n) {
                v.push("batch_options/timeout", "must be within 60..=7200 seconds");
            }
        }
    }
}

//─────────────────────────────
//  Notification
//─────────────────────────────

const NOTIFICATION_FIELDS: &[&str] = &[
    "id",
    "type",
    "priority",
    "source",
    "target",
    "timestamp",
    "data",
    "metadata",
    "retry_count",
    "expires_at",
];

fn check_notification(map: &Map<String, Value>, v: &mut Violations) {
    check_no_unknown_fields(map, "", NOTIFICATION_FIELDS, v);
    check_id_field(map, "", "id", v);

    let mut kind = None;
    if let Some(s) = get_str(map, "", "type", true, v) {
        match NotificationKind::parse(s) {
            Some(k) => kind = Some(k),
            None => v.push("type", "not a recognized notification type"),
        }
    }
    if let Some(s) = get_str(map, "", "priority", true, v) {
        if !matches!(s, "low" | "medium" | "high" | "critical") {
            v.push("priority", "must be one of low, medium, high, critical");
        }
    }
    let _ = get_str(map, "", "source", true, v);
    let _ = get_str(map, "", "target", true, v);
    check_rfc3339(map, "", "timestamp", true, v);
    if map.contains_key("expires_at") {
        check_rfc3339(map, "", "expires_at", false, v);
    }
    if let Some(value) = map.get("retry_count") {
        if value.as_u64().is_none() {
            v.push("retry_count", "must be a non-negative integer");
        }
    }
    if let Some(value) = map.get("metadata") {
        if !value.is_object() && !value.is_null() {
            v.push("metadata", "must be an object");
        }
    }

    let data = get_object(map, "", "data", true, v);
    if let (Some(kind), Some(data)) = (kind, data) {
        check_notification_data(kind, data, v);
    }
}

fn check_notification_data(kind: NotificationKind, data: &Map<String, Value>, v: &mut Violations) {
    match kind {
        NotificationKind::TaskStarted => {
            let _ = get_str(data, "data", "task_type", true, v);
            let _ = get_i64(data, "data", "estimated_duration", true, v);
        }
        NotificationKind::TaskProgress => {
            match data.get("progress_percentage").and_then(Value::as_f64) {
                Some(pct) if (0.0..=100.0).contains(&pct) => {}
                Some(_) => v.push("data/progress_percentage", "must be within 0..=100"),
                None => v.push("data/progress_percentage", "required number is missing"),
            }
            let _ = get_str(data, "data", "current_step", true, v);
        }
        NotificationKind::TaskCompleted => {
            let _ = get_object(data, "data", "result", true, v);
            let _ = get_str(data, "data", "execution_summary", true, v);
        }
        NotificationKind::TaskFailed => {
            let _ = get_str(data, "data", "error_type", true, v);
            let _ = get_str(data, "data", "error_message", true, v);
        }
        // Free-form data for the non-lifecycle kinds.
        NotificationKind::TaskEscalated
        | NotificationKind::AgentStatus
        | NotificationKind::SystemAlert => {}
    }
}

//─────────────────────────────
//  Webhook registration
//─────────────────────────────

const WEBHOOK_REGISTRATION_FIELDS: &[&str] =
    &["webhook_id", "url", "secret", "event_types", "timeout", "retry_policy", "active"];

fn check_webhook_registration(map: &Map<String, Value>, v: &mut Violations) {
    check_no_unknown_fields(map, "", WEBHOOK_REGISTRATION_FIELDS, v);
    check_id_field(map, "", "webhook_id", v);

    if let Some(url) = get_str(map, "", "url", true, v) {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            v.push("url", "must be an http(s) URL");
        }
    }
    if let Some(secret) = get_str(map, "", "secret", false, v) {
        if secret.len() < 16 {
            v.push("secret", "must be at least 16 characters");
        }
    }
    if let Some(value) = map.get("event_types") {
        match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let ok = item
                        .as_str()
                        .map(|s| s == "all" || courier_types::WebhookEventType::parse(s).is_some())
                        .unwrap_or(false);
                    if !ok {
                        v.push(format!("event_types/{i}"), "not a recognized event type");
                    }
                }
            }
            None => v.push("event_types", "must be an array"),
        }
    }
    if let Some(n) = get_i64(map, "", "timeout", false, v) {
        if !(5..=300).contains(&n) {
            v.push("timeout", "must be within 5..=300 seconds");
        }
    }
    if let Some(value) = map.get("retry_policy") {
        if !value.is_object() {
            v.push("retry_policy", "must be an object");
        }
    }
    check_bool(map, "", "active", v);
}

//─────────────────────────────
//  Status request
//─────────────────────────────

fn check_status_request(map: &Map<String, Value>, v: &mut Violations) {
    check_no_unknown_fields(
        map,
        "",
        &["request_type", "target_id", "include_details", "include_metrics", "include_history", "time_range"],
        v,
    );
    if let Some(s) = get_str(map, "", "request_type", true, v) {
        if !matches!(s, "task_status" | "agent_status" | "system_status" | "batch_status") {
            v.push(
                "request_type",
                "must be one of task_status, agent_status, system_status, batch_status",
            );
        }
    }
    let _ = get_str(map, "", "target_id", false, v);
    for field in ["include_details", "include_metrics", "include_history"] {
        check_bool(map, "", field, v);
    }
    if let Some(range) = get_object(map, "", "time_range", false, v) {
        check_rfc3339(range, "time_range", "start_time", false, v);
        check_rfc3339(range, "time_range", "end_time", false, v);
    }
}

//─────────────────────────────
//  Agent end-task
//─────────────────────────────

const AGENT_END_TASK_FIELDS: &[&str] = &[
    "task_id",
    "agent_id",
    "completion_status",
    "timestamp",
    "execution_summary",
    "cleanup_actions",
    "next_steps",
    "result_data",
    "execution_metrics",
    "quality_assessment",
    "next_actions",
    "metadata",
];

fn check_agent_end_task(map: &Map<String, Value>, v: &mut Violations) {
    check_no_unknown_fields(map, "", AGENT_END_TASK_FIELDS, v);
    check_id_field(map, "", "task_id", v);
    let _ = get_str(map, "", "agent_id", true, v);

    if let Some(s) = get_str(map, "", "completion_status", true, v) {
        if EndTaskReason::parse(s).is_none() {
            v.push("completion_status", "not a recognized completion status");
        }
    }
    check_rfc3339(map, "", "timestamp", true, v);
    check_string_array(map, "", "cleanup_actions", v);
    check_string_array(map, "", "next_steps", v);
    for field in [
        "execution_summary",
        "result_data",
        "execution_metrics",
        "quality_assessment",
        "next_actions",
        "metadata",
    ] {
        if let Some(value) = map.get(field) {
            if !value.is_object() {
                v.push(field, "must be an object");
            }
        }
    }
}
