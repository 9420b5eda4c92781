//! Human-readable descriptors for the payload catalog.
//!
//! Served by `GET /schemas` and `GET /schemas/{payload_type}` so clients can
//! discover field requirements without reading this crate's source.

use serde_json::{json, Value};

use crate::PayloadKind;

/// Describe one catalog entry: required fields and the constraints the
/// validator enforces.
pub fn describe(kind: PayloadKind) -> Value {
    match kind {
        PayloadKind::TaskExecution => json!({
            "payload_type": "task_execution",
            "required": ["task_id", "task_type", "description", "priority", "orchestrator_info"],
            "constraints": {
                "task_id": "1..=100 characters from [A-Za-z0-9_-]",
                "task_type": courier_types::TaskType::all().iter().map(|t| t.as_str()).collect::<Vec<_>>(),
                "description": "length within 10..=10000",
                "priority": ["low", "normal", "high", "critical"],
                "estimated_duration": "optional, 1..=86400 seconds",
                "timeout": "optional, 30..=3600 seconds",
                "orchestrator_info": {"required": ["agent_id", "timestamp"]}
            }
        }),
        PayloadKind::TaskBatch => json!({
            "payload_type": "task_batch",
            "required": ["batch_id", "tasks", "orchestrator_info"],
            "constraints": {
                "batch_id": "1..=100 characters from [A-Za-z0-9_-]",
                "tasks": "1..=100 task_execution payloads",
                "batch_options.execution_mode": ["sequential", "parallel", "dependency_based"],
                "batch_options.max_concurrent": "1..=10"
            }
        }),
        PayloadKind::Notification => json!({
            "payload_type": "notification",
            "required": ["id", "type", "priority", "source", "target", "timestamp", "data"],
            "constraints": {
                "type": ["task_started", "task_progress", "task_completed", "task_failed",
                         "task_escalated", "agent_status", "system_alert"],
                "priority": ["low", "medium", "high", "critical"],
                "data.task_started": {"required": ["task_type", "estimated_duration"]},
                "data.task_progress": {"required": ["progress_percentage", "current_step"],
                                        "progress_percentage": "0..=100"},
                "data.task_completed": {"required": ["result", "execution_summary"]},
                "data.task_failed": {"required": ["error_type", "error_message"]}
            }
        }),
        PayloadKind::WebhookRegistration => json!({
            "payload_type": "webhook_registration",
            "required": ["webhook_id", "url"],
            "constraints": {
                "webhook_id": "1..=100 characters from [A-Za-z0-9_-]",
                "url": "http(s) URL",
                "secret": "optional, at least 16 characters",
                "event_types": ["task_lifecycle", "agent_status", "system_event",
                                "error_event", "performance_metric", "all"]
            }
        }),
        PayloadKind::StatusRequest => json!({
            "payload_type": "status_request",
            "required": ["request_type"],
            "constraints": {
                "request_type": ["task_status", "agent_status", "system_status", "batch_status"]
            }
        }),
        PayloadKind::AgentEndTask => json!({
            "payload_type": "agent_end_task",
            "required": ["task_id", "agent_id", "completion_status", "timestamp"],
            "constraints": {
                "completion_status": ["success", "failure", "timeout", "cancelled",
                                       "escalated", "resource_exhausted"],
                "cleanup_actions": "optional array of strings",
                "next_steps": "optional array of strings"
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_descriptor() {
        for kind in PayloadKind::all() {
            let descriptor = describe(*kind);
            assert_eq!(descriptor["payload_type"], kind.as_str());
            assert!(descriptor["required"].is_array());
        }
    }
}
