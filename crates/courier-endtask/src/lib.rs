#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-endtask** – Agent end-task lifecycle.
//!
//! When an executor reports the end of a task, this manager persists the
//! event, runs the registered cleanup handler over each requested cleanup
//! action, emits the matching lifecycle notification, fans the event out to
//! `task_lifecycle` webhook subscribers, and finally marks the stored event
//! processed. Cleanup and per-reason handler failures are recorded in the
//! report but never abort the sequence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use courier_notify::NotificationProtocol;
use courier_schema::AgentEndTaskBuilder;
use courier_store_core::{EventStore, RecordKind, StoreError};
use courier_types::{EndTaskReason, NotificationKind, NotifyPriority, WebhookEventType};
use courier_webhook::WebhookManager;

//─────────────────────────────
//  Events and reports
//─────────────────────────────

/// A task-end event as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndTaskEvent {
    /// Task that ended
    pub task_id: String,
    /// Reporting agent
    pub agent_id: String,
    /// Why the task ended
    pub reason: EndTaskReason,
    /// Report time
    pub timestamp: DateTime<Utc>,
    /// Executor's summary of the work
    pub execution_summary: Value,
    /// Cleanup actions the executor expects to run
    pub cleanup_actions: Vec<String>,
    /// Recommended follow-up tasks
    pub next_steps: Vec<String>,
    /// Free-form metadata (`task_type` selects the cleanup handler)
    pub metadata: Value,
    /// Whether the full end-task sequence ran
    pub processed: bool,
    /// Whether the webhook fan-out was queued
    pub webhook_sent: bool,
}

/// Outcome of the cleanup phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Actions that completed
    pub executed: Vec<String>,
    /// Actions that failed, with the error message
    pub failed: Vec<FailedCleanup>,
}

/// One failed cleanup action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCleanup {
    /// The action that failed
    pub action: String,
    /// Why it failed
    pub error: String,
}

/// Report returned to the caller of [`EndTaskManager::end_task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndTaskReport {
    /// Task that ended
    pub task_id: String,
    /// Why it ended
    pub reason: EndTaskReason,
    /// Store id of the persisted event
    pub record_id: u64,
    /// Cleanup outcome
    pub cleanup: CleanupReport,
    /// Id of the emitted lifecycle notification, if any
    pub notification_id: Option<String>,
    /// Whether webhook deliveries were queued
    pub webhook_sent: bool,
    /// Report time
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced by the end-task manager.
#[derive(Debug, thiserror::Error)]
pub enum EndTaskError {
    /// Persisting the event failed; nothing else ran
    #[error(transparent)]
    Store(#[from] StoreError),
}

//─────────────────────────────
//  Handler contracts
//─────────────────────────────

/// Runs one cleanup action for tasks of a given type.
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    /// Execute `action` in the context of `event`.
    async fn run(&self, event: &AgentEndTaskEvent, action: &str) -> anyhow::Result<()>;
}

/// Observes task ends for a specific reason.
#[async_trait]
pub trait ReasonHandler: Send + Sync {
    /// React to `event`. Errors are recorded, never propagated.
    async fn on_end(&self, event: &AgentEndTaskEvent) -> anyhow::Result<()>;
}

/// Default cleanup handler: acknowledges each action in the log.
struct LoggingCleanup;

#[async_trait]
impl CleanupHandler for LoggingCleanup {
    async fn run(&self, event: &AgentEndTaskEvent, action: &str) -> anyhow::Result<()> {
        info!(task_id = %event.task_id, action, "executing cleanup action");
        Ok(())
    }
}

//─────────────────────────────
//  Manager
//─────────────────────────────

/// Coordinates the end-task sequence.
pub struct EndTaskManager {
    store: Arc<dyn EventStore>,
    webhooks: Arc<WebhookManager>,
    notify: Arc<NotificationProtocol>,
    cleanup_handlers: DashMap<String, Arc<dyn CleanupHandler>>,
    reason_handlers: DashMap<&'static str, Arc<dyn ReasonHandler>>,
}

impl EndTaskManager {
    /// Wire the manager to its collaborators. A logging cleanup handler is
    /// pre-registered for the `general` task type.
    pub fn new(
        store: Arc<dyn EventStore>,
        webhooks: Arc<WebhookManager>,
        notify: Arc<NotificationProtocol>,
    ) -> Self {
        let manager = Self {
            store,
            webhooks,
            notify,
            cleanup_handlers: DashMap::new(),
            reason_handlers: DashMap::new(),
        };
        manager.register_cleanup_handler("general", Arc::new(LoggingCleanup));
        manager
    }

    /// Register the cleanup handler for a task type.
    pub fn register_cleanup_handler(&self, task_type: &str, handler: Arc<dyn CleanupHandler>) {
        self.cleanup_handlers.insert(task_type.to_string(), handler);
    }

    /// Register a handler observing ends with a specific reason.
    pub fn register_reason_handler(&self, reason: EndTaskReason, handler: Arc<dyn ReasonHandler>) {
        self.reason_handlers.insert(reason.as_str(), handler);
    }

    /// Run the full end-task sequence and return its report.
    #[allow(clippy::too_many_arguments)]
    pub async fn end_task(
        &self,
        task_id: &str,
        agent_id: &str,
        reason: EndTaskReason,
        execution_summary: Value,
        cleanup_actions: Vec<String>,
        next_steps: Vec<String>,
        metadata: Value,
    ) -> Result<EndTaskReport, EndTaskError> {
        let event = AgentEndTaskEvent {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            reason,
            timestamp: Utc::now(),
            execution_summary,
            cleanup_actions,
            next_steps,
            metadata,
            processed: false,
            webhook_sent: false,
        };

        // Persistence is the one step that must succeed.
        let body = serde_json::to_value(&event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let record_id = self.store.append(RecordKind::EndTaskEvent, body).await?;

        let cleanup = self.run_cleanup(&event).await;
        let notification_id = self.send_notification(&event, &cleanup).await;
        let webhook_sent = self.fan_out(&event).await;

        if let Err(e) = self
            .store
            .update(
                RecordKind::EndTaskEvent,
                record_id,
                json!({"processed": true, "webhook_sent": webhook_sent}),
            )
            .await
        {
            warn!(task_id, error = %e, "failed to mark end-task event processed");
        }

        let reason_handler =
            self.reason_handlers.get(event.reason.as_str()).map(|entry| entry.clone());
        if let Some(handler) = reason_handler {
            if let Err(e) = handler.on_end(&event).await {
                warn!(task_id, reason = event.reason.as_str(), error = %e, "reason handler failed");
            }
        }

        info!(task_id, reason = reason.as_str(), "task ended");
        Ok(EndTaskReport {
            task_id: event.task_id,
            reason,
            record_id,
            cleanup,
            notification_id,
            webhook_sent,
            timestamp: event.timestamp,
        })
    }

    async fn run_cleanup(&self, event: &AgentEndTaskEvent) -> CleanupReport {
        let task_type = event
            .metadata
            .get("task_type")
            .and_then(Value::as_str)
            .unwrap_or("general");
        let handler = self
            .cleanup_handlers
            .get(task_type)
            .or_else(|| self.cleanup_handlers.get("general"))
            .map(|entry| entry.clone());

        let mut report = CleanupReport::default();
        let Some(handler) = handler else {
            for action in &event.cleanup_actions {
                report.failed.push(FailedCleanup {
                    action: action.clone(),
                    error: format!("no cleanup handler for task type `{task_type}`"),
                });
            }
            return report;
        };

        for action in &event.cleanup_actions {
            match handler.run(event, action).await {
                Ok(()) => report.executed.push(action.clone()),
                Err(e) => {
                    warn!(task_id = %event.task_id, action, error = %e, "cleanup action failed");
                    report.failed.push(FailedCleanup {
                        action: action.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn send_notification(
        &self,
        event: &AgentEndTaskEvent,
        cleanup: &CleanupReport,
    ) -> Option<String> {
        let (kind, data) = if event.reason == EndTaskReason::Success {
            (
                NotificationKind::TaskCompleted,
                json!({
                    "task_id": event.task_id,
                    "result": event.execution_summary,
                    "execution_summary": format!(
                        "task {} completed; {} cleanup action(s) run",
                        event.task_id,
                        cleanup.executed.len()
                    ),
                    "next_steps": event.next_steps,
                }),
            )
        } else {
            (
                NotificationKind::TaskFailed,
                json!({
                    "task_id": event.task_id,
                    "error_type": event.reason.as_str(),
                    "error_message": format!(
                        "task {} ended with reason {}",
                        event.task_id,
                        event.reason.as_str()
                    ),
                    "execution_summary": event.execution_summary,
                }),
            )
        };
        let priority = if event.reason == EndTaskReason::Success {
            NotifyPriority::High
        } else {
            NotifyPriority::Critical
        };
        match self.notify.send("orchestrator", kind, priority, data, None).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(task_id = %event.task_id, error = %e, "end-task notification failed");
                None
            }
        }
    }

    async fn fan_out(&self, event: &AgentEndTaskEvent) -> bool {
        let payload = AgentEndTaskBuilder::new(&event.task_id, &event.agent_id, event.reason)
            .execution_summary(event.execution_summary.clone())
            .cleanup_actions(event.cleanup_actions.clone())
            .next_steps(event.next_steps.clone())
            .metadata(event.metadata.clone())
            .next_actions(json!({
                "cleanup_required": !event.cleanup_actions.is_empty(),
                "follow_up_tasks": event.next_steps,
                "escalation_needed": event.reason == EndTaskReason::Escalated,
                "user_notification_required": matches!(
                    event.reason,
                    EndTaskReason::Failure | EndTaskReason::Escalated
                ),
            }))
            .build();

        match self.webhooks.send(WebhookEventType::TaskLifecycle, payload, None) {
            Ok(queued) => queued > 0,
            Err(e) => {
                warn!(task_id = %event.task_id, error = %e, "end-task webhook fan-out failed");
                false
            }
        }
    }
}
