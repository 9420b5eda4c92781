#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-types** – Shared vocabulary for the Courier messaging substrate.
//!
//! This crate sits at the bottom of the workspace and defines the closed
//! enumerations and wire primitives every other crate agrees on: task types,
//! priorities, execution statuses, audit levels, the notification payload
//! shape, and the canonical JSON form used for signing and deduplication.
//!
//! It is deliberately free of I/O and async concerns so that the higher
//! layers (store, engine, webhook manager) can share types without sharing
//! runtime assumptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

//─────────────────────────────
//  Task vocabulary
//─────────────────────────────

/// Closed set of task categories an orchestrator may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Produce new source code
    CodeGeneration,
    /// Diagnose and fix a defect
    CodeDebugging,
    /// Analyze a dataset
    DataAnalysis,
    /// Write or revise documentation
    Documentation,
    /// Author or run tests
    Testing,
    /// Roll out an artifact
    Deployment,
    /// Change system configuration
    Configuration,
    /// Observe a running system
    Monitoring,
    /// Open-ended investigation
    Research,
    /// Anything that fits no other bucket
    General,
}

impl TaskType {
    /// Wire-format name of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CodeGeneration => "code_generation",
            TaskType::CodeDebugging => "code_debugging",
            TaskType::DataAnalysis => "data_analysis",
            TaskType::Documentation => "documentation",
            TaskType::Testing => "testing",
            TaskType::Deployment => "deployment",
            TaskType::Configuration => "configuration",
            TaskType::Monitoring => "monitoring",
            TaskType::Research => "research",
            TaskType::General => "general",
        }
    }

    /// Parse a wire-format name, returning `None` for anything outside the set.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "code_generation" => TaskType::CodeGeneration,
            "code_debugging" => TaskType::CodeDebugging,
            "data_analysis" => TaskType::DataAnalysis,
            "documentation" => TaskType::Documentation,
            "testing" => TaskType::Testing,
            "deployment" => TaskType::Deployment,
            "configuration" => TaskType::Configuration,
            "monitoring" => TaskType::Monitoring,
            "research" => TaskType::Research,
            "general" => TaskType::General,
            _ => return None,
        })
    }

    /// All members, in wire order.
    pub fn all() -> &'static [TaskType] {
        &[
            TaskType::CodeGeneration,
            TaskType::CodeDebugging,
            TaskType::DataAnalysis,
            TaskType::Documentation,
            TaskType::Testing,
            TaskType::Deployment,
            TaskType::Configuration,
            TaskType::Monitoring,
            TaskType::Research,
            TaskType::General,
        ]
    }
}

/// Priority assigned to a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work
    Low,
    /// Default priority
    Normal,
    /// Preempts normal work
    High,
    /// Drop everything
    Critical,
}

impl TaskPriority {
    /// Wire-format name of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    /// Parse a wire-format name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "low" => TaskPriority::Low,
            "normal" => TaskPriority::Normal,
            "high" => TaskPriority::High,
            "critical" => TaskPriority::Critical,
            _ => return None,
        })
    }
}

//─────────────────────────────
//  Notification vocabulary
//─────────────────────────────

/// Priority of a notification, independent of task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPriority {
    /// Informational only
    Low,
    /// Default priority
    Medium,
    /// Should be surfaced promptly
    High,
    /// Must be surfaced immediately
    Critical,
}

impl NotifyPriority {
    /// Wire-format name of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyPriority::Low => "low",
            NotifyPriority::Medium => "medium",
            NotifyPriority::High => "high",
            NotifyPriority::Critical => "critical",
        }
    }
}

/// Discriminator for the shape of a notification's `data` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Executor accepted a task and began work
    TaskStarted,
    /// Progress update for a running task
    TaskProgress,
    /// Task finished successfully
    TaskCompleted,
    /// Task finished with an error
    TaskFailed,
    /// Task was escalated to a human
    TaskEscalated,
    /// Executor agent status change
    AgentStatus,
    /// System-level alert
    SystemAlert,
}

impl NotificationKind {
    /// Wire-format name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TaskStarted => "task_started",
            NotificationKind::TaskProgress => "task_progress",
            NotificationKind::TaskCompleted => "task_completed",
            NotificationKind::TaskFailed => "task_failed",
            NotificationKind::TaskEscalated => "task_escalated",
            NotificationKind::AgentStatus => "agent_status",
            NotificationKind::SystemAlert => "system_alert",
        }
    }

    /// Parse a wire-format name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "task_started" => NotificationKind::TaskStarted,
            "task_progress" => NotificationKind::TaskProgress,
            "task_completed" => NotificationKind::TaskCompleted,
            "task_failed" => NotificationKind::TaskFailed,
            "task_escalated" => NotificationKind::TaskEscalated,
            "agent_status" => NotificationKind::AgentStatus,
            "system_alert" => NotificationKind::SystemAlert,
            _ => return None,
        })
    }
}

/// A single notification travelling between orchestrator and executor.
///
/// Immutable once created; the processed flag lives in a separate store
/// record so re-reads of the payload never observe partial mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Unique notification identifier
    pub id: String,
    /// Shape discriminator for `data`
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Delivery priority
    pub priority: NotifyPriority,
    /// Originating system ("orchestrator", "executor", or an agent id)
    pub source: String,
    /// Destination system
    pub target: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload
    pub data: Value,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Number of delivery retries already performed
    #[serde(default)]
    pub retry_count: u32,
    /// Point after which the notification must not be dispatched
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationPayload {
    /// True if the notification must not be dispatched at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at < now)
    }
}

//─────────────────────────────
//  Execution vocabulary
//─────────────────────────────

/// Lifecycle state of a single action execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet running
    Pending,
    /// Adapter invocation in flight
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by an external caller
    Cancelled,
    /// Deadline exceeded
    Timeout,
}

impl ExecutionStatus {
    /// True once the execution can no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Wire-format name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// Reason an executor agent reported the end of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndTaskReason {
    /// Objectives met
    Success,
    /// Unrecoverable error
    Failure,
    /// Task deadline exceeded
    Timeout,
    /// Cancelled by the orchestrator or a user
    Cancelled,
    /// Handed off to a human
    Escalated,
    /// Ran out of budget, memory, or quota
    ResourceExhausted,
}

impl EndTaskReason {
    /// Wire-format name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndTaskReason::Success => "success",
            EndTaskReason::Failure => "failure",
            EndTaskReason::Timeout => "timeout",
            EndTaskReason::Cancelled => "cancelled",
            EndTaskReason::Escalated => "escalated",
            EndTaskReason::ResourceExhausted => "resource_exhausted",
        }
    }

    /// Parse a wire-format name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => EndTaskReason::Success,
            "failure" => EndTaskReason::Failure,
            "timeout" => EndTaskReason::Timeout,
            "cancelled" => EndTaskReason::Cancelled,
            "escalated" => EndTaskReason::Escalated,
            "resource_exhausted" => EndTaskReason::ResourceExhausted,
            _ => return None,
        })
    }
}

//─────────────────────────────
//  Security vocabulary
//─────────────────────────────

/// Security clearance levels, totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Baseline access
    Standard,
    /// Sensitive operations
    Elevated,
    /// Administrative operations
    Admin,
}

impl SecurityLevel {
    /// Numeric rank used in clearance comparisons.
    pub fn rank(&self) -> u8 {
        match self {
            SecurityLevel::Standard => 0,
            SecurityLevel::Elevated => 1,
            SecurityLevel::Admin => 2,
        }
    }

    /// Wire-format name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Standard => "standard",
            SecurityLevel::Elevated => "elevated",
            SecurityLevel::Admin => "admin",
        }
    }
}

//─────────────────────────────
//  Audit and webhook vocabulary
//─────────────────────────────

/// Severity of an audit event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    /// Routine activity
    Info,
    /// Suspicious or degraded activity
    Warning,
    /// Operation failed
    Error,
    /// Security or integrity incident
    Critical,
}

impl AuditLevel {
    /// Wire-format name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Warning => "warning",
            AuditLevel::Error => "error",
            AuditLevel::Critical => "critical",
        }
    }
}

/// Event families a webhook endpoint may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    /// Task start/progress/end events
    TaskLifecycle,
    /// Executor agent status changes
    AgentStatus,
    /// System-level events
    SystemEvent,
    /// Error reports
    ErrorEvent,
    /// Rolling performance metrics
    PerformanceMetric,
}

impl WebhookEventType {
    /// Wire-format name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::TaskLifecycle => "task_lifecycle",
            WebhookEventType::AgentStatus => "agent_status",
            WebhookEventType::SystemEvent => "system_event",
            WebhookEventType::ErrorEvent => "error_event",
            WebhookEventType::PerformanceMetric => "performance_metric",
        }
    }

    /// Parse a wire-format name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "task_lifecycle" => WebhookEventType::TaskLifecycle,
            "agent_status" => WebhookEventType::AgentStatus,
            "system_event" => WebhookEventType::SystemEvent,
            "error_event" => WebhookEventType::ErrorEvent,
            "performance_metric" => WebhookEventType::PerformanceMetric,
            _ => return None,
        })
    }
}

//─────────────────────────────
//  Canonical JSON
//─────────────────────────────

/// Serialize a JSON value canonically: object keys sorted lexicographically,
/// no insignificant whitespace.
///
/// Signers and verifiers must both use this form; the HMAC of a payload is
/// computed over exactly these bytes. Arrays keep their order, numbers and
/// strings use `serde_json`'s standard rendering.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key serialization cannot fail for a String.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"zebra": 1, "apple": {"nested_z": true, "nested_a": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"apple":{"nested_a":null,"nested_z":true},"zebra":1}"#
        );
    }

    #[test]
    fn test_canonical_json_preserves_array_order() {
        let value = json!({"items": [3, 1, 2]});
        assert_eq!(canonical_json(&value), r#"{"items":[3,1,2]}"#);
    }

    #[test]
    fn test_canonical_json_independent_of_insertion_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_security_level_ordering() {
        assert!(SecurityLevel::Admin.rank() > SecurityLevel::Elevated.rank());
        assert!(SecurityLevel::Elevated.rank() > SecurityLevel::Standard.rank());
        assert!(SecurityLevel::Admin >= SecurityLevel::Elevated);
    }

    #[test]
    fn test_task_type_round_trip() {
        for task_type in TaskType::all() {
            assert_eq!(TaskType::parse(task_type.as_str()), Some(*task_type));
        }
        assert_eq!(TaskType::parse("unknown_kind"), None);
    }

    #[test]
    fn test_notification_expiry() {
        let now = Utc::now();
        let mut payload = NotificationPayload {
            id: "n1".to_string(),
            kind: NotificationKind::TaskStarted,
            priority: NotifyPriority::Medium,
            source: "executor".to_string(),
            target: "orchestrator".to_string(),
            timestamp: now,
            data: json!({}),
            metadata: None,
            retry_count: 0,
            expires_at: None,
        };
        assert!(!payload.is_expired(now));

        payload.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(payload.is_expired(now));

        payload.expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(!payload.is_expired(now));
    }

    #[test]
    fn test_enum_serde_wire_names() {
        assert_eq!(
            serde_json::to_string(&NotificationKind::TaskProgress).unwrap(),
            "\"task_progress\""
        );
        assert_eq!(
            serde_json::to_string(&EndTaskReason::ResourceExhausted).unwrap(),
            "\"resource_exhausted\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }
}
