//! Task dispatch tracking.
//!
//! The substrate does not execute tasks itself; it validates them, hands
//! them to connected executors over the live stream, and tracks their
//! lifecycle from the notifications executors send back. This module keeps
//! the dispatch ledger the status endpoint reads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use courier_notify::TaskProgressHandler;

/// A task accepted for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedTask {
    /// Orchestrator-assigned task id
    pub task_id: String,
    /// Substrate-assigned execution id
    pub execution_id: String,
    /// Dispatch acceptance time
    pub received_at: DateTime<Utc>,
    /// The validated payload as received
    pub payload: Value,
}

/// Ledger of dispatched tasks, merged with executor progress reports.
pub struct TaskLedger {
    tasks: DashMap<String, DispatchedTask>,
    progress: Arc<TaskProgressHandler>,
}

impl TaskLedger {
    /// Ledger reading progress from the given handler.
    pub fn new(progress: Arc<TaskProgressHandler>) -> Self {
        Self { tasks: DashMap::new(), progress }
    }

    /// Accept a validated task payload, assigning an execution id.
    pub fn accept(&self, task_id: &str, payload: Value) -> DispatchedTask {
        let task = DispatchedTask {
            task_id: task_id.to_string(),
            execution_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            payload,
        };
        self.tasks.insert(task_id.to_string(), task.clone());
        task
    }

    /// Status of a task: dispatch record plus any executor progress.
    pub fn status(&self, task_id: &str) -> Option<Value> {
        let task = self.tasks.get(task_id)?;
        let mut status = serde_json::json!({
            "task_id": task.task_id,
            "execution_id": task.execution_id,
            "received_at": task.received_at.to_rfc3339(),
            "status": "accepted",
        });
        if let Some(track) = self.progress.track(task_id) {
            status["status"] = serde_json::json!(track.status);
            status["progress_percentage"] = serde_json::json!(track.progress);
            if let Some(at) = track.completed_at {
                status["completed_at"] = serde_json::json!(at.to_rfc3339());
            }
        }
        Some(status)
    }

    /// Number of accepted tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when nothing has been dispatched.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
