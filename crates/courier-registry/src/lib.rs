#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-registry** – Central registry of external actions.
//!
//! An [`ActionDefinition`] is the declarative contract for one external
//! action: input schema, adapter identifier, category, and the policy knobs
//! the execution engine enforces (rate limit, timeout, retry budget,
//! approval flag). Definitions are immutable after registration and
//! registration is idempotent by name.
//!
//! The builtin catalog covers the canonical action set: escalation,
//! approvals, email and chat messages, workflow triggers, ticket and issue
//! creation, documentation updates, alerting, and security scans.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use courier_types::SecurityLevel;

pub mod adapter;
pub mod mock;
pub mod schema;

pub use adapter::{ActionAdapter, AdapterError, AdapterRegistry};
pub use mock::MockAdapter;
pub use schema::{ActionSchema, FieldKind, FieldSpec};

//─────────────────────────────
//  Definitions
//─────────────────────────────

/// Category of an action, for discovery grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// Human escalation and approval
    Escalation,
    /// Notifications and communications
    Notification,
    /// Workflow and pipeline triggers
    Workflow,
    /// External system integration
    Integration,
    /// Documentation and knowledge management
    Documentation,
    /// Monitoring and alerting
    Monitoring,
    /// Security and compliance actions
    Security,
}

/// Declarative definition of one external action. Immutable after
/// registration.
#[derive(Clone)]
pub struct ActionDefinition {
    /// Unique action name
    pub name: &'static str,
    /// Human description
    pub description: &'static str,
    /// Adapter identifier resolved at execution time
    pub adapter: &'static str,
    /// Input contract
    pub input_schema: ActionSchema,
    /// Output descriptor, informational only
    pub output_schema: Value,
    /// Discovery category
    pub category: ActionCategory,
    /// Clearance required to execute
    pub security_level: SecurityLevel,
    /// Global executions allowed per minute
    pub rate_limit: u32,
    /// Adapter invocation deadline in seconds
    pub timeout_secs: u64,
    /// Retry budget on retryable failure
    pub retry_count: u32,
    /// Whether an approval grant must exist
    pub requires_approval: bool,
    /// Example invocations for discovery
    pub examples: Vec<Value>,
}

impl ActionDefinition {
    fn new(
        name: &'static str,
        description: &'static str,
        adapter: &'static str,
        category: ActionCategory,
        input_schema: ActionSchema,
    ) -> Self {
        Self {
            name,
            description,
            adapter,
            input_schema,
            output_schema: json!({}),
            category,
            security_level: SecurityLevel::Standard,
            rate_limit: 10,
            timeout_secs: 30,
            retry_count: 3,
            requires_approval: false,
            examples: Vec::new(),
        }
    }

    fn security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    fn rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit = per_minute;
        self
    }

    fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    fn output(mut self, descriptor: Value) -> Self {
        self.output_schema = descriptor;
        self
    }

    fn example(mut self, example: Value) -> Self {
        self.examples.push(example);
        self
    }
}

//─────────────────────────────
//  Registry
//─────────────────────────────

/// Registry of action definitions, idempotent by name.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<&'static str, Arc<ActionDefinition>>,
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the builtin catalog.
    pub fn builtin() -> Self {
        let registry = Self::new();
        for definition in builtin_actions() {
            registry.register(definition);
        }
        registry
    }

    /// Register a definition. A second registration under the same name is
    /// a no-op; definitions are immutable once in.
    pub fn register(&self, definition: ActionDefinition) {
        if self.actions.contains_key(definition.name) {
            debug!(action = definition.name, "ignoring duplicate registration");
            return;
        }
        self.actions.insert(definition.name, Arc::new(definition));
    }

    /// Fetch a definition by name.
    pub fn get(&self, name: &str) -> Option<Arc<ActionDefinition>> {
        self.actions.get(name).map(|entry| entry.clone())
    }

    /// All definitions in a category.
    pub fn by_category(&self, category: ActionCategory) -> Vec<Arc<ActionDefinition>> {
        self.actions
            .iter()
            .filter(|entry| entry.category == category)
            .map(|entry| entry.clone())
            .collect()
    }

    /// All registered definitions.
    pub fn all(&self) -> Vec<Arc<ActionDefinition>> {
        self.actions.iter().map(|entry| entry.clone()).collect()
    }

    /// Input-schema descriptors keyed by action name.
    pub fn schemas(&self) -> Value {
        let mut map = serde_json::Map::new();
        for entry in self.actions.iter() {
            map.insert(entry.name.to_string(), entry.input_schema.describe());
        }
        Value::Object(map)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True if no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

//─────────────────────────────
//  Builtin catalog
//─────────────────────────────

const URGENCIES: &[&str] = &["low", "medium", "high", "critical"];
const MESSAGE_PRIORITIES: &[&str] = &["low", "normal", "high"];
const APPROVAL_TYPES: &[&str] = &["single", "majority", "unanimous"];
const WORKFLOW_TYPES: &[&str] = &["deployment", "testing", "security_scan", "backup", "custom"];
const ENVIRONMENTS: &[&str] = &["development", "staging", "production"];
const SCAN_TYPES: &[&str] = &["dependency", "container", "static_analysis", "penetration"];

/// Build the canonical action set.
pub fn builtin_actions() -> Vec<ActionDefinition> {
    vec![
        ActionDefinition::new(
            "escalate_to_human",
            "Escalate a decision or incident to human stakeholders",
            "escalation",
            ActionCategory::Escalation,
            ActionSchema::new(vec![
                FieldSpec::required("context", FieldKind::String),
                FieldSpec::required("stakeholders", FieldKind::StringArray),
                FieldSpec::optional("urgency", FieldKind::Enum(URGENCIES)),
                FieldSpec::optional("deadline", FieldKind::String),
                FieldSpec::optional("notification_channels", FieldKind::StringArray),
            ]),
        )
        .security_level(SecurityLevel::Elevated)
        .rate_limit(5)
        .output(json!({"escalation_id": "string", "status": "string"}))
        .example(json!({
            "context": "Critical vulnerability found in production",
            "urgency": "critical",
            "stakeholders": ["security_team", "tech_lead"]
        })),
        ActionDefinition::new(
            "request_approval",
            "Request approval for an action or decision",
            "escalation",
            ActionCategory::Escalation,
            ActionSchema::new(vec![
                FieldSpec::required("action_description", FieldKind::String),
                FieldSpec::required("approvers", FieldKind::StringArray),
                FieldSpec::required("justification", FieldKind::String),
                FieldSpec::optional("impact_assessment", FieldKind::String),
                FieldSpec::optional("deadline", FieldKind::String),
                FieldSpec::optional("approval_type", FieldKind::Enum(APPROVAL_TYPES)),
            ]),
        )
        .security_level(SecurityLevel::Elevated)
        .rate_limit(5)
        .output(json!({"approval_id": "string", "status": "string"})),
        ActionDefinition::new(
            "send_email",
            "Send an email notification",
            "email",
            ActionCategory::Notification,
            ActionSchema::new(vec![
                FieldSpec::required("recipients", FieldKind::StringArray),
                FieldSpec::required("subject", FieldKind::String),
                FieldSpec::optional("body", FieldKind::String),
                FieldSpec::optional("template", FieldKind::String),
                FieldSpec::optional("data", FieldKind::Object),
                FieldSpec::optional("priority", FieldKind::Enum(MESSAGE_PRIORITIES)),
                FieldSpec::optional("cc", FieldKind::StringArray),
                FieldSpec::optional("bcc", FieldKind::StringArray),
            ]),
        )
        .rate_limit(50)
        .output(json!({"message_id": "string", "status": "string"})),
        ActionDefinition::new(
            "send_chat_message",
            "Send a message to a chat channel or user",
            "chat",
            ActionCategory::Notification,
            ActionSchema::new(vec![
                FieldSpec::required("channel", FieldKind::String),
                FieldSpec::required("message", FieldKind::String),
                FieldSpec::optional("template", FieldKind::String),
                FieldSpec::optional("data", FieldKind::Object),
                FieldSpec::optional("thread_ts", FieldKind::String),
            ]),
        )
        .rate_limit(100)
        .output(json!({"message_ts": "string", "status": "string"})),
        ActionDefinition::new(
            "trigger_workflow",
            "Trigger an external workflow or pipeline",
            "workflow",
            ActionCategory::Workflow,
            ActionSchema::new(vec![
                FieldSpec::required("workflow_type", FieldKind::Enum(WORKFLOW_TYPES)),
                FieldSpec::optional("environment", FieldKind::Enum(ENVIRONMENTS)),
                FieldSpec::optional("parameters", FieldKind::Object),
                FieldSpec::optional("priority", FieldKind::Enum(MESSAGE_PRIORITIES)),
            ]),
        )
        .security_level(SecurityLevel::Elevated)
        .rate_limit(20)
        .requires_approval()
        .output(json!({"workflow_run_id": "string", "status": "string"})),
        ActionDefinition::new(
            "stop_workflow",
            "Stop a running workflow or pipeline",
            "workflow",
            ActionCategory::Workflow,
            ActionSchema::new(vec![
                FieldSpec::required("run_id", FieldKind::String),
                FieldSpec::optional("reason", FieldKind::String),
            ]),
        )
        .security_level(SecurityLevel::Elevated)
        .rate_limit(10)
        .requires_approval()
        .output(json!({"workflow_run_id": "string", "status": "string"})),
        ActionDefinition::new(
            "create_ticket",
            "Create a ticket in the issue tracker",
            "ticket",
            ActionCategory::Integration,
            ActionSchema::new(vec![
                FieldSpec::required("summary", FieldKind::String),
                FieldSpec::required("project", FieldKind::String),
                FieldSpec::optional("description", FieldKind::String),
                FieldSpec::optional("issue_type", FieldKind::String),
                FieldSpec::optional("priority", FieldKind::Enum(MESSAGE_PRIORITIES)),
                FieldSpec::optional("labels", FieldKind::StringArray),
            ]),
        )
        .rate_limit(30)
        .output(json!({"ticket_id": "string", "url": "string"})),
        ActionDefinition::new(
            "create_issue",
            "Open an issue in the code forge",
            "issue",
            ActionCategory::Integration,
            ActionSchema::new(vec![
                FieldSpec::required("repository", FieldKind::String),
                FieldSpec::required("title", FieldKind::String),
                FieldSpec::optional("body", FieldKind::String),
                FieldSpec::optional("labels", FieldKind::StringArray),
                FieldSpec::optional("assignees", FieldKind::StringArray),
            ]),
        )
        .rate_limit(25)
        .output(json!({"issue_id": "string", "status": "string"})),
        ActionDefinition::new(
            "update_documentation",
            "Create or update a documentation page",
            "documentation",
            ActionCategory::Documentation,
            ActionSchema::new(vec![
                FieldSpec::required("page", FieldKind::String),
                FieldSpec::required("content", FieldKind::String),
                FieldSpec::optional("space", FieldKind::String),
                FieldSpec::optional("append", FieldKind::Boolean),
            ]),
        )
        .security_level(SecurityLevel::Elevated)
        .rate_limit(15)
        .output(json!({"page_id": "string", "status": "string"})),
        ActionDefinition::new(
            "create_alert",
            "Create an alert in the monitoring system",
            "monitoring",
            ActionCategory::Monitoring,
            ActionSchema::new(vec![
                FieldSpec::required("name", FieldKind::String),
                FieldSpec::required("condition", FieldKind::String),
                FieldSpec::optional("severity", FieldKind::Enum(URGENCIES)),
                FieldSpec::optional("channels", FieldKind::StringArray),
            ]),
        )
        .security_level(SecurityLevel::Elevated)
        .rate_limit(10)
        .requires_approval()
        .output(json!({"alert_id": "string", "status": "string"})),
        ActionDefinition::new(
            "trigger_security_scan",
            "Start a security scan against a target",
            "security",
            ActionCategory::Security,
            ActionSchema::new(vec![
                FieldSpec::required("target", FieldKind::String),
                FieldSpec::optional("scan_type", FieldKind::Enum(SCAN_TYPES)),
                FieldSpec::optional("parameters", FieldKind::Object),
            ]),
        )
        .security_level(SecurityLevel::Admin)
        .rate_limit(5)
        .requires_approval()
        .output(json!({"scan_id": "string", "status": "string"})),
    ]
}

/// Adapter identifiers the builtin catalog references.
pub fn builtin_adapter_ids() -> Vec<&'static str> {
    vec!["escalation", "email", "chat", "workflow", "ticket", "issue", "documentation", "monitoring", "security"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_registers() {
        let registry = ActionRegistry::builtin();
        assert_eq!(registry.len(), 11);
        assert!(registry.get("send_email").is_some());
        assert!(registry.get("trigger_security_scan").unwrap().requires_approval);
    }

    #[test]
    fn test_registration_is_idempotent() {
        let registry = ActionRegistry::builtin();
        let before = registry.len();
        for definition in builtin_actions() {
            registry.register(definition);
        }
        assert_eq!(registry.len(), before);

        // The original definition survives a conflicting re-registration.
        let mut altered = builtin_actions().remove(0);
        altered.rate_limit = 999;
        let name = altered.name;
        registry.register(altered);
        assert_ne!(registry.get(name).unwrap().rate_limit, 999);
    }

    #[test]
    fn test_category_lookup() {
        let registry = ActionRegistry::builtin();
        let notifications = registry.by_category(ActionCategory::Notification);
        let names: Vec<&str> = notifications.iter().map(|d| d.name).collect();
        assert!(names.contains(&"send_email"));
        assert!(names.contains(&"send_chat_message"));
        assert_eq!(registry.by_category(ActionCategory::Security).len(), 1);
    }

    #[test]
    fn test_schemas_descriptor_covers_all_actions() {
        let registry = ActionRegistry::builtin();
        let schemas = registry.schemas();
        let map = schemas.as_object().unwrap();
        assert_eq!(map.len(), registry.len());
        assert!(map["send_email"]["fields"].is_array());
    }

    #[test]
    fn test_every_builtin_adapter_id_is_listed() {
        let ids = builtin_adapter_ids();
        for definition in builtin_actions() {
            assert!(ids.contains(&definition.adapter), "missing adapter {}", definition.adapter);
        }
    }
}
