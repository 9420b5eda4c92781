//! Default notification handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{error, info, warn};

use courier_types::{NotificationKind, NotificationPayload, NotifyPriority};

use crate::NotificationHandler;

/// Tracks task lifecycle notifications into an in-memory progress table.
pub struct TaskProgressHandler {
    active_tasks: DashMap<String, TaskTrack>,
}

/// Progress snapshot for one task.
#[derive(Debug, Clone)]
pub struct TaskTrack {
    /// When the task started
    pub started_at: DateTime<Utc>,
    /// Last reported progress percentage
    pub progress: f64,
    /// Last known status
    pub status: &'static str,
    /// When a terminal notification arrived
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskProgressHandler {
    /// Empty tracker.
    pub fn new() -> Self {
        Self { active_tasks: DashMap::new() }
    }

    /// Snapshot of one task's progress.
    pub fn track(&self, task_id: &str) -> Option<TaskTrack> {
        self.active_tasks.get(task_id).map(|entry| entry.clone())
    }

    /// Number of tasks currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.active_tasks.len()
    }
}

impl Default for TaskProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationHandler for TaskProgressHandler {
    fn id(&self) -> &str {
        "task_progress_handler"
    }

    fn matches(&self, notification: &NotificationPayload) -> bool {
        matches!(
            notification.kind,
            NotificationKind::TaskStarted
                | NotificationKind::TaskProgress
                | NotificationKind::TaskCompleted
                | NotificationKind::TaskFailed
        )
    }

    async fn handle(&self, notification: &NotificationPayload) -> anyhow::Result<()> {
        let Some(task_id) = notification.data.get("task_id").and_then(Value::as_str) else {
            warn!(id = %notification.id, "task notification without task_id");
            anyhow::bail!("missing task_id");
        };

        match notification.kind {
            NotificationKind::TaskStarted => {
                self.active_tasks.insert(
                    task_id.to_string(),
                    TaskTrack {
                        started_at: notification.timestamp,
                        progress: 0.0,
                        status: "running",
                        completed_at: None,
                    },
                );
                info!(task_id, "task started");
            }
            NotificationKind::TaskProgress => {
                if let Some(mut track) = self.active_tasks.get_mut(task_id) {
                    let progress = notification
                        .data
                        .get("progress_percentage")
                        .and_then(Value::as_f64)
                        .unwrap_or(track.progress);
                    track.progress = progress;
                    info!(task_id, progress, "task progress");
                }
            }
            NotificationKind::TaskCompleted | NotificationKind::TaskFailed => {
                if let Some(mut track) = self.active_tasks.get_mut(task_id) {
                    track.status = if notification.kind == NotificationKind::TaskCompleted {
                        "completed"
                    } else {
                        "failed"
                    };
                    track.completed_at = Some(notification.timestamp);
                    info!(task_id, status = track.status, "task finished");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Surfaces system alerts and critical notifications to the operator log.
pub struct SystemAlertHandler;

#[async_trait]
impl NotificationHandler for SystemAlertHandler {
    fn id(&self) -> &str {
        "system_alert_handler"
    }

    fn matches(&self, notification: &NotificationPayload) -> bool {
        notification.kind == NotificationKind::SystemAlert
            || notification.priority == NotifyPriority::Critical
    }

    async fn handle(&self, notification: &NotificationPayload) -> anyhow::Result<()> {
        let alert_type = notification
            .data
            .get("alert_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let message = notification
            .data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message provided");
        error!(alert_type, message, "system alert");
        Ok(())
    }
}
