//! Deterministic mock adapter.
//!
//! Stands in for any external integration whose credentials are not
//! configured. Responses are derived from a hash of the action name and
//! canonical input, so the same call always produces the same identifiers
//! and tests can assert on exact values.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use courier_types::canonical_json;

use crate::adapter::{ActionAdapter, AdapterError};

/// Deterministic stand-in for a real adapter.
pub struct MockAdapter {
    id: String,
}

impl MockAdapter {
    /// Mock registered under `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    fn tag(action_name: &str, input: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(action_name.as_bytes());
        hasher.update(b":");
        hasher.update(canonical_json(input).as_bytes());
        hex::encode(hasher.finalize())[..8].to_uppercase()
    }
}

#[async_trait]
impl ActionAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, action_name: &str, input: &Value) -> Result<Value, AdapterError> {
        let tag = Self::tag(action_name, input);
        let result = match action_name {
            "escalate_to_human" => {
                let stakeholders = input
                    .get("stakeholders")
                    .cloned()
                    .unwrap_or_else(|| json!([]));
                let estimated = match input.get("urgency").and_then(Value::as_str) {
                    Some("critical") => "15-30 minutes",
                    Some("high") => "30-60 minutes",
                    Some("low") => "4-8 hours",
                    _ => "2-4 hours",
                };
                json!({
                    "escalation_id": format!("ESC-{tag}"),
                    "status": "notified",
                    "notified_stakeholders": stakeholders,
                    "estimated_response_time": estimated,
                })
            }
            "request_approval" => json!({
                "approval_id": tag.to_lowercase(),
                "status": "pending",
                "approvers_notified": input.get("approvers").cloned().unwrap_or_else(|| json!([])),
            }),
            "send_email" => json!({
                "message_id": format!("MSG-{tag}"),
                "status": "sent",
                "recipients": input
                    .get("recipients")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0),
            }),
            "send_chat_message" => json!({
                "message_ts": tag.to_lowercase(),
                "channel": input.get("channel").cloned().unwrap_or(Value::Null),
                "status": "sent",
            }),
            "trigger_workflow" => json!({
                "workflow_run_id": format!("RUN-{tag}"),
                "status": "triggered",
            }),
            "stop_workflow" => json!({
                "workflow_run_id": input.get("run_id").cloned().unwrap_or(Value::Null),
                "status": "stopped",
            }),
            "create_ticket" => json!({
                "ticket_id": format!("TCK-{tag}"),
                "status": "created",
                "url": format!("https://tickets.example.test/TCK-{tag}"),
            }),
            "create_issue" => json!({
                "issue_id": format!("ISS-{tag}"),
                "status": "created",
            }),
            "update_documentation" => json!({
                "page_id": format!("DOC-{tag}"),
                "status": "updated",
            }),
            "create_alert" => json!({
                "alert_id": format!("ALR-{tag}"),
                "status": "created",
            }),
            "trigger_security_scan" => json!({
                "scan_id": format!("SCAN-{tag}"),
                "status": "started",
            }),
            other => json!({"action": other, "status": "ok"}),
        };
        Ok(result)
    }
}
