#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-notify** – Bidirectional notification protocol.
//!
//! Transport-agnostic core of the orchestrator ↔ executor notification
//! channel. Inbound events arrive from HTTP or a persistent stream; the
//! protocol takes each through the same lifecycle:
//! `received → persisted → dispatched → (handled | no_handler) → marked_processed`,
//! with `expired` possible at any pre-dispatch point.
//!
//! Handlers are registered with a predicate and run isolated: one handler's
//! failure never prevents another from running, and the event counts as
//! handled if any handler succeeds. Streaming clients receive a best-effort
//! broadcast; the durable path is persistence in the event store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_store_core::{EventStore, RecordKind, StoreError};
use courier_types::{NotificationKind, NotificationPayload, NotifyPriority};

pub mod handlers;

pub use handlers::{SystemAlertHandler, TaskProgressHandler};

/// Default per-handler execution deadline.
pub const HANDLER_DEADLINE: Duration = Duration::from_secs(30);

/// Buffer size for the live broadcast to streaming clients.
const BROADCAST_BUFFER: usize = 256;

//─────────────────────────────
//  Handler contract
//─────────────────────────────

/// A registered notification handler.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Stable handler identifier.
    fn id(&self) -> &str;

    /// Predicate deciding whether this handler runs for `notification`.
    fn matches(&self, notification: &NotificationPayload) -> bool;

    /// Process the notification. `Ok(())` counts the event as handled.
    async fn handle(&self, notification: &NotificationPayload) -> anyhow::Result<()>;
}

struct HandlerEntry {
    handler: Arc<dyn NotificationHandler>,
    active: AtomicBool,
}

//─────────────────────────────
//  Outcomes and errors
//─────────────────────────────

/// Terminal outcome of processing one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// At least one handler succeeded
    Handled,
    /// No registered handler matched; logged at warning
    NoHandler,
    /// Matching handlers ran, none succeeded
    Unhandled,
    /// The notification expired before dispatch
    Expired,
}

/// Errors surfaced by the protocol.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Payload could not be decoded into a notification
    #[error("malformed notification: {0}")]
    Malformed(String),
}

//─────────────────────────────
//  Metrics
//─────────────────────────────

/// Rolling counters exposed by the health endpoint.
#[derive(Debug, Default)]
pub struct NotifyMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    no_handler: AtomicU64,
}

impl NotifyMetrics {
    /// Snapshot the counters as JSON.
    pub fn snapshot(&self) -> Value {
        json!({
            "notifications_sent": self.sent.load(Ordering::Relaxed),
            "notifications_received": self.received.load(Ordering::Relaxed),
            "notifications_handled": self.handled.load(Ordering::Relaxed),
            "notifications_failed": self.failed.load(Ordering::Relaxed),
            "notifications_expired": self.expired.load(Ordering::Relaxed),
            "notifications_without_handler": self.no_handler.load(Ordering::Relaxed),
        })
    }
}

//─────────────────────────────
//  Protocol
//─────────────────────────────

/// The notification protocol core shared by HTTP and WebSocket transports.
pub struct NotificationProtocol {
    system_id: String,
    store: Arc<dyn EventStore>,
    handlers: DashMap<String, HandlerEntry>,
    broadcast_tx: broadcast::Sender<NotificationPayload>,
    shutdown: CancellationToken,
    handler_deadline: Duration,
    metrics: NotifyMetrics,
}

impl NotificationProtocol {
    /// Create a protocol instance identified as `system_id`.
    pub fn new(system_id: impl Into<String>, store: Arc<dyn EventStore>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            system_id: system_id.into(),
            store,
            handlers: DashMap::new(),
            broadcast_tx,
            shutdown: CancellationToken::new(),
            handler_deadline: HANDLER_DEADLINE,
            metrics: NotifyMetrics::default(),
        }
    }

    /// Register the default task-progress and system-alert handlers.
    pub fn with_default_handlers(self) -> Self {
        self.register_handler(Arc::new(TaskProgressHandler::new()));
        self.register_handler(Arc::new(SystemAlertHandler));
        self
    }

    /// Identifier of this protocol endpoint.
    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    /// Register a handler. Replaces any handler with the same id.
    pub fn register_handler(&self, handler: Arc<dyn NotificationHandler>) {
        info!(handler = handler.id(), "registered notification handler");
        self.handlers.insert(
            handler.id().to_string(),
            HandlerEntry { handler, active: AtomicBool::new(true) },
        );
    }

    /// Toggle a handler without unregistering it. Returns false for unknown ids.
    pub fn set_handler_active(&self, handler_id: &str, active: bool) -> bool {
        match self.handlers.get(handler_id) {
            Some(entry) => {
                entry.active.store(active, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Subscribe to the live broadcast used by streaming transports.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationPayload> {
        self.broadcast_tx.subscribe()
    }

    /// Number of currently connected streaming subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }

    /// Protocol counters.
    pub fn metrics(&self) -> &NotifyMetrics {
        &self.metrics
    }

    /// Signal shutdown: in-flight handler invocations are cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Decode a validated JSON payload into a notification.
    pub fn decode(&self, payload: &Value) -> Result<NotificationPayload, NotifyError> {
        serde_json::from_value(payload.clone()).map_err(|e| NotifyError::Malformed(e.to_string()))
    }

    /// Process one inbound notification through the full lifecycle.
    pub async fn process(
        &self,
        notification: NotificationPayload,
    ) -> Result<ProcessOutcome, NotifyError> {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        if notification.is_expired(now) {
            warn!(id = %notification.id, "dropping expired notification");
            self.metrics.expired.fetch_add(1, Ordering::Relaxed);
            return Ok(ProcessOutcome::Expired);
        }

        // Persist before dispatch; the store is the durable path.
        let body = serde_json::to_value(&notification)
            .map_err(|e| NotifyError::Malformed(e.to_string()))?;
        let record_id = self.store.append(RecordKind::Notification, body).await?;

        let outcome = self.dispatch(&notification).await;

        // Best-effort live broadcast; lagging or absent subscribers are fine.
        let _ = self.broadcast_tx.send(notification.clone());

        self.store
            .append(
                RecordKind::NotificationMarker,
                json!({
                    "notification_id": notification.id,
                    "record_id": record_id,
                    "processed": true,
                    "outcome": match outcome {
                        ProcessOutcome::Handled => "handled",
                        ProcessOutcome::NoHandler => "no_handler",
                        ProcessOutcome::Unhandled => "unhandled",
                        ProcessOutcome::Expired => "expired",
                    },
                    "processed_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;

        Ok(outcome)
    }

    async fn dispatch(&self, notification: &NotificationPayload) -> ProcessOutcome {
        let matching: Vec<Arc<dyn NotificationHandler>> = self
            .handlers
            .iter()
            .filter(|entry| {
                entry.active.load(Ordering::Relaxed) && entry.handler.matches(notification)
            })
            .map(|entry| entry.handler.clone())
            .collect();

        if matching.is_empty() {
            warn!(id = %notification.id, kind = notification.kind.as_str(), "no handler for notification");
            self.metrics.no_handler.fetch_add(1, Ordering::Relaxed);
            return ProcessOutcome::NoHandler;
        }

        let mut handled = false;
        for handler in matching {
            let invocation =
                tokio::time::timeout(self.handler_deadline, handler.handle(notification));
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    warn!(handler = handler.id(), "handler cancelled by shutdown");
                    break;
                }
                result = invocation => result,
            };
            match result {
                Ok(Ok(())) => {
                    debug!(handler = handler.id(), id = %notification.id, "notification handled");
                    handled = true;
                }
                Ok(Err(e)) => {
                    // Isolated: a failing handler never blocks the others.
                    warn!(handler = handler.id(), error = %e, "handler failed");
                }
                Err(_elapsed) => {
                    warn!(handler = handler.id(), "handler exceeded deadline");
                }
            }
        }

        if handled {
            self.metrics.handled.fetch_add(1, Ordering::Relaxed);
            ProcessOutcome::Handled
        } else {
            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            ProcessOutcome::Unhandled
        }
    }

    //─────────────────────────────
    //  Outbound senders
    //─────────────────────────────

    /// Create, persist, and broadcast an outbound notification. Returns its id.
    pub async fn send(
        &self,
        target: impl Into<String>,
        kind: NotificationKind,
        priority: NotifyPriority,
        data: Value,
        metadata: Option<Value>,
    ) -> Result<String, NotifyError> {
        let notification = NotificationPayload {
            id: Uuid::new_v4().simple().to_string(),
            kind,
            priority,
            source: self.system_id.clone(),
            target: target.into(),
            timestamp: Utc::now(),
            data,
            metadata,
            retry_count: 0,
            expires_at: None,
        };

        let body = serde_json::to_value(&notification)
            .map_err(|e| NotifyError::Malformed(e.to_string()))?;
        self.store.append(RecordKind::Notification, body).await?;
        let _ = self.broadcast_tx.send(notification.clone());
        self.metrics.sent.fetch_add(1, Ordering::Relaxed);
        Ok(notification.id)
    }

    /// Announce that a task has started.
    pub async fn send_task_started(
        &self,
        target: &str,
        task_id: &str,
        task_type: &str,
        estimated_duration: i64,
    ) -> Result<String, NotifyError> {
        self.send(
            target,
            NotificationKind::TaskStarted,
            NotifyPriority::Medium,
            json!({
                "task_id": task_id,
                "task_type": task_type,
                "estimated_duration": estimated_duration,
            }),
            None,
        )
        .await
    }

    /// Report progress on a running task.
    pub async fn send_task_progress(
        &self,
        target: &str,
        task_id: &str,
        progress_percentage: f64,
        current_step: &str,
    ) -> Result<String, NotifyError> {
        self.send(
            target,
            NotificationKind::TaskProgress,
            NotifyPriority::Low,
            json!({
                "task_id": task_id,
                "progress_percentage": progress_percentage,
                "current_step": current_step,
            }),
            None,
        )
        .await
    }

    /// Announce task completion with its result.
    pub async fn send_task_completed(
        &self,
        target: &str,
        task_id: &str,
        result: Value,
        execution_summary: &str,
    ) -> Result<String, NotifyError> {
        self.send(
            target,
            NotificationKind::TaskCompleted,
            NotifyPriority::High,
            json!({
                "task_id": task_id,
                "result": result,
                "execution_summary": execution_summary,
            }),
            None,
        )
        .await
    }

    /// Raise a system alert; critical severity escalates the priority.
    pub async fn send_system_alert(
        &self,
        target: &str,
        alert_type: &str,
        message: &str,
        severity: &str,
    ) -> Result<String, NotifyError> {
        let priority = if severity == "critical" {
            NotifyPriority::Critical
        } else {
            NotifyPriority::High
        };
        self.send(
            target,
            NotificationKind::SystemAlert,
            priority,
            json!({
                "alert_type": alert_type,
                "message": message,
                "severity": severity,
                "system_id": self.system_id,
            }),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store_memory::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        id: &'static str,
        only: Option<NotificationKind>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHandler {
        fn new(id: &'static str, only: Option<NotificationKind>, fail: bool) -> Arc<Self> {
            Arc::new(Self { id, only, calls: AtomicUsize::new(0), fail })
        }
    }

    #[async_trait]
    impl NotificationHandler for CountingHandler {
        fn id(&self) -> &str {
            self.id
        }

        fn matches(&self, notification: &NotificationPayload) -> bool {
            self.only.map(|kind| kind == notification.kind).unwrap_or(true)
        }

        async fn handle(&self, _notification: &NotificationPayload) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("handler intentionally failed");
            }
            Ok(())
        }
    }

    fn notification(kind: NotificationKind) -> NotificationPayload {
        NotificationPayload {
            id: Uuid::new_v4().simple().to_string(),
            kind,
            priority: NotifyPriority::Medium,
            source: "executor".to_string(),
            target: "orchestrator".to_string(),
            timestamp: Utc::now(),
            data: json!({"task_id": "t1"}),
            metadata: None,
            retry_count: 0,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_persist_dispatch_mark() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store.clone());
        let handler = CountingHandler::new("h1", None, false);
        protocol.register_handler(handler.clone());

        let outcome = protocol.process(notification(NotificationKind::TaskStarted)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Handled);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // Payload persisted and processed marker recorded.
        assert_eq!(store.record_count(RecordKind::Notification).await, 1);
        let markers = store
            .scan(RecordKind::NotificationMarker, 0)
            .await
            .unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].body["processed"], true);
        assert_eq!(markers[0].body["outcome"], "handled");
    }

    #[tokio::test]
    async fn test_expired_notification_never_dispatched() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store.clone());
        let handler = CountingHandler::new("h1", None, false);
        protocol.register_handler(handler.clone());

        let mut expired = notification(NotificationKind::TaskStarted);
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));

        let outcome = protocol.process(expired).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Expired);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.record_count(RecordKind::Notification).await, 0);
    }

    #[tokio::test]
    async fn test_no_handler_is_warning_not_error() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store.clone());

        let outcome = protocol.process(notification(NotificationKind::AgentStatus)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NoHandler);
        // Still persisted and marked processed.
        assert_eq!(store.record_count(RecordKind::Notification).await, 1);
    }

    #[tokio::test]
    async fn test_handler_isolation_any_success_counts() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store);
        let failing = CountingHandler::new("bad", None, true);
        let succeeding = CountingHandler::new("good", None, false);
        protocol.register_handler(failing.clone());
        protocol.register_handler(succeeding.clone());

        let outcome = protocol.process(notification(NotificationKind::TaskProgress)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Handled);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(succeeding.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_predicate_filters_handlers() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store);
        let progress_only =
            CountingHandler::new("progress", Some(NotificationKind::TaskProgress), false);
        protocol.register_handler(progress_only.clone());

        protocol.process(notification(NotificationKind::TaskStarted)).await.unwrap();
        assert_eq!(progress_only.calls.load(Ordering::SeqCst), 0);

        protocol.process(notification(NotificationKind::TaskProgress)).await.unwrap();
        assert_eq!(progress_only.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deactivated_handler_skipped() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store);
        let handler = CountingHandler::new("h1", None, false);
        protocol.register_handler(handler.clone());
        assert!(protocol.set_handler_active("h1", false));

        let outcome = protocol.process(notification(NotificationKind::TaskStarted)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NoHandler);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        assert!(!protocol.set_handler_active("ghost", true));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store);
        let mut rx = protocol.subscribe();

        let sent_id = protocol
            .send_task_started("orchestrator", "t1", "testing", 60)
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, sent_id);
        assert_eq!(received.kind, NotificationKind::TaskStarted);
    }

    #[tokio::test]
    async fn test_metrics_counters() {
        let store = MemoryStore::shared();
        let protocol = NotificationProtocol::new("executor", store);
        protocol.register_handler(CountingHandler::new("h1", None, false));

        protocol.process(notification(NotificationKind::TaskStarted)).await.unwrap();
        protocol.send_system_alert("orchestrator", "disk", "disk full", "critical").await.unwrap();

        let snapshot = protocol.metrics().snapshot();
        assert_eq!(snapshot["notifications_received"], 1);
        assert_eq!(snapshot["notifications_handled"], 1);
        assert_eq!(snapshot["notifications_sent"], 1);
    }
}
