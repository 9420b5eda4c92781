#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-audit** – Structured audit logging for Courier.
//!
//! The audit logger never blocks its callers: events land in a bounded
//! in-memory buffer that a background task drains to sinks (the event store
//! and an append-only file). When the buffer overflows, the oldest
//! non-critical event is dropped; critical events instead wait for space up
//! to a configurable deadline and then surface [`AuditError::SinkUnavailable`].
//!
//! Events at `error` level or above are additionally written to the file
//! sink before `log` returns, so a crash immediately after acknowledgement
//! cannot lose them.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{error, warn};

use courier_store_core::{EventStore, RecordFilter, RecordKind, StoreError};
use courier_types::AuditLevel;

//─────────────────────────────
//  Events
//─────────────────────────────

/// One structured audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic identifier assigned at log time
    pub event_id: u64,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Dotted event family, e.g. `action_execution_start`
    pub event_type: String,
    /// Severity
    pub level: AuditLevel,
    /// Acting user, if any
    pub user_id: Option<String>,
    /// Action involved, if any
    pub action_name: Option<String>,
    /// Execution context involved, if any
    pub execution_id: Option<String>,
    /// Event-specific payload
    pub data: Value,
}

/// Optional correlation fields for [`AuditLogger::log`].
#[derive(Debug, Clone, Default)]
pub struct AuditScope {
    /// Acting user
    pub user_id: Option<String>,
    /// Action involved
    pub action_name: Option<String>,
    /// Execution context involved
    pub execution_id: Option<String>,
}

impl AuditScope {
    /// Scope carrying only an execution correlation.
    pub fn execution(
        execution_id: impl Into<String>,
        action_name: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            user_id,
            action_name: Some(action_name.into()),
            execution_id: Some(execution_id.into()),
        }
    }
}

/// Errors surfaced by the audit logger.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// No sink could accept the event within the allowed time
    #[error("no audit sink available: {0}")]
    SinkUnavailable(String),
    /// The event store rejected a query
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Unsupported export format
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),
}

//─────────────────────────────
//  Sinks
//─────────────────────────────

/// A destination that accepts audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Stable sink name used in diagnostics.
    fn name(&self) -> &'static str;
    /// Write one event. Must not be called concurrently for the same sink.
    async fn accept(&self, event: &AuditEvent) -> anyhow::Result<()>;
    /// Flush buffered state.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sink persisting events into the event store.
pub struct StoreSink {
    store: Arc<dyn EventStore>,
}

impl StoreSink {
    /// Create a sink over `store`.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreSink {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn accept(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let body = serde_json::to_value(event)?;
        self.store.append(RecordKind::AuditEvent, body).await?;
        Ok(())
    }
}

/// Append-only JSON-lines file sink, the stable sink of last resort.
pub struct FileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileSink {
    /// Open (or create) the sink file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self { path, file: tokio::sync::Mutex::new(file) })
    }

    /// Path of the sink file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn accept(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.file.lock().await.sync_data().await?;
        Ok(())
    }
}

//─────────────────────────────
//  Buffer
//─────────────────────────────

struct Buffered {
    event: AuditEvent,
    /// Already written to the file sink at log time.
    filed: bool,
}

struct Buffer {
    queue: VecDeque<Buffered>,
    capacity: usize,
    closed: bool,
}

enum PushOutcome {
    Accepted,
    DroppedOldest,
    /// Buffer saturated; the event is handed back so the caller can wait.
    Full(Buffered),
}

impl Buffer {
    fn push(&mut self, item: Buffered) -> PushOutcome {
        if self.queue.len() < self.capacity {
            self.queue.push_back(item);
            return PushOutcome::Accepted;
        }
        // Overflow: evict the oldest non-critical event. Critical events are
        // never evicted and a critical arrival must wait for space instead.
        if item.event.level < AuditLevel::Critical {
            if let Some(pos) =
                self.queue.iter().position(|b| b.event.level < AuditLevel::Critical)
            {
                self.queue.remove(pos);
                self.queue.push_back(item);
                return PushOutcome::DroppedOldest;
            }
        }
        PushOutcome::Full(item)
    }
}

//─────────────────────────────
//  Logger
//─────────────────────────────

/// Tuning for [`AuditLogger`].
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Buffer capacity before the overflow policy applies
    pub buffer_capacity: usize,
    /// How long a critical event may wait for buffer space
    pub critical_deadline: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { buffer_capacity: 1024, critical_deadline: Duration::from_secs(5) }
    }
}

/// Buffered, multi-sink audit logger.
pub struct AuditLogger {
    store: Arc<dyn EventStore>,
    file_sink: Arc<FileSink>,
    extra_sinks: std::sync::RwLock<Vec<Arc<dyn AuditSink>>>,
    buffer: Arc<Mutex<Buffer>>,
    work: Arc<Notify>,
    space: Arc<Notify>,
    next_event_id: AtomicU64,
    config: AuditConfig,
}

impl AuditLogger {
    /// Create a logger draining into `store` and the file sink at
    /// `file_path`, and spawn its background drain task.
    pub async fn new(
        store: Arc<dyn EventStore>,
        file_path: impl Into<PathBuf>,
        config: AuditConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let file_sink = Arc::new(FileSink::open(file_path).await?);
        let logger = Arc::new(Self {
            store: store.clone(),
            file_sink,
            extra_sinks: std::sync::RwLock::new(Vec::new()),
            buffer: Arc::new(Mutex::new(Buffer {
                queue: VecDeque::new(),
                capacity: config.buffer_capacity,
                closed: false,
            })),
            work: Arc::new(Notify::new()),
            space: Arc::new(Notify::new()),
            next_event_id: AtomicU64::new(1),
            config,
        });
        tokio::spawn(drain_loop(logger.clone()));
        Ok(logger)
    }

    /// Register an additional external sink. Takes effect for events drained
    /// after registration.
    pub fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.extra_sinks.write().unwrap_or_else(|e| e.into_inner()).push(sink);
    }

    /// Log one event. Returns its monotonic event id.
    ///
    /// Non-blocking for `info`/`warning`; `error` and above are written to
    /// the file sink before returning; `critical` waits for buffer space up
    /// to the configured deadline when the buffer is saturated.
    pub async fn log(
        &self,
        event_type: impl Into<String>,
        level: AuditLevel,
        data: Value,
        scope: AuditScope,
    ) -> Result<u64, AuditError> {
        let event = AuditEvent {
            event_id: self.next_event_id.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            level,
            user_id: scope.user_id,
            action_name: scope.action_name,
            execution_id: scope.execution_id,
            data,
        };

        match level {
            AuditLevel::Error | AuditLevel::Critical => {
                error!(event_type = %event.event_type, event_id = event.event_id, "audit");
            }
            AuditLevel::Warning => {
                warn!(event_type = %event.event_type, event_id = event.event_id, "audit");
            }
            AuditLevel::Info => {
                tracing::info!(event_type = %event.event_type, event_id = event.event_id, "audit");
            }
        }

        // Stable sink before acknowledgement for error and critical.
        let filed = level >= AuditLevel::Error;
        if filed {
            self.file_sink
                .accept(&event)
                .await
                .map_err(|e| AuditError::SinkUnavailable(e.to_string()))?;
        }

        let event_id = event.event_id;
        let mut item = Buffered { event, filed };
        let deadline = tokio::time::Instant::now() + self.config.critical_deadline;
        loop {
            let outcome = {
                let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                buffer.push(item)
            };
            match outcome {
                PushOutcome::Accepted => break,
                PushOutcome::DroppedOldest => {
                    warn!("audit buffer overflow: dropped oldest non-critical event");
                    break;
                }
                PushOutcome::Full(returned) => {
                    // Only reachable when the buffer is saturated with
                    // critical events: wait for the drain task to make room.
                    if tokio::time::timeout_at(deadline, self.space.notified()).await.is_err() {
                        return Err(AuditError::SinkUnavailable(
                            "buffer full of critical events past deadline".to_string(),
                        ));
                    }
                    item = returned;
                }
            }
        }
        self.work.notify_one();
        Ok(event_id)
    }

    /// Query persisted audit events, newest-first.
    pub async fn query(&self, filter: &RecordFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let records = self.store.query(RecordKind::AuditEvent, filter).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| serde_json::from_value(record.body).ok())
            .collect())
    }

    /// Substring search across persisted events.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let needle = text.to_lowercase();
        let all = self.query(&RecordFilter::default()).await?;
        Ok(all
            .into_iter()
            .filter(|event| {
                let haystack = format!(
                    "{} {} {} {}",
                    event.event_type,
                    event.user_id.as_deref().unwrap_or(""),
                    event.action_name.as_deref().unwrap_or(""),
                    event.data
                );
                haystack.to_lowercase().contains(&needle)
            })
            .take(if limit == 0 { usize::MAX } else { limit })
            .collect())
    }

    /// Aggregate counts over the trailing `window_hours`.
    pub async fn summary(&self, window_hours: i64) -> Result<Value, AuditError> {
        let since = Utc::now() - chrono::Duration::hours(window_hours);
        let filter = RecordFilter { since: Some(since), ..Default::default() };
        let events = self.query(&filter).await?;

        let mut by_type = std::collections::BTreeMap::new();
        let mut by_level = std::collections::BTreeMap::new();
        let mut by_user = std::collections::BTreeMap::new();
        let mut by_action = std::collections::BTreeMap::new();
        for event in &events {
            *by_type.entry(event.event_type.clone()).or_insert(0u64) += 1;
            *by_level.entry(event.level.as_str().to_string()).or_insert(0u64) += 1;
            if let Some(user) = &event.user_id {
                *by_user.entry(user.clone()).or_insert(0u64) += 1;
            }
            if let Some(action) = &event.action_name {
                *by_action.entry(action.clone()).or_insert(0u64) += 1;
            }
        }

        Ok(json!({
            "window_hours": window_hours,
            "total_events": events.len(),
            "event_types": by_type,
            "levels": by_level,
            "users": by_user,
            "actions": by_action,
        }))
    }

    /// Export matching events as a byte stream in `json` or `csv` form.
    pub async fn export(&self, format: &str, filter: &RecordFilter) -> Result<Vec<u8>, AuditError> {
        let events = self.query(filter).await?;
        match format {
            "json" => serde_json::to_vec_pretty(&events)
                .map_err(|e| AuditError::SinkUnavailable(e.to_string())),
            "csv" => {
                let mut out = String::from(
                    "event_id,timestamp,event_type,level,user_id,action_name,execution_id\n",
                );
                for event in &events {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{}\n",
                        event.event_id,
                        event.timestamp.to_rfc3339(),
                        event.event_type,
                        event.level.as_str(),
                        event.user_id.as_deref().unwrap_or(""),
                        event.action_name.as_deref().unwrap_or(""),
                        event.execution_id.as_deref().unwrap_or(""),
                    ));
                }
                Ok(out.into_bytes())
            }
            other => Err(AuditError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Drain remaining events and flush every sink.
    pub async fn shutdown(&self) {
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.closed = true;
        }
        self.work.notify_one();
        // Give the drain task a chance to empty the queue, then flush the
        // tail ourselves in case it already exited.
        for _ in 0..50 {
            let empty = {
                let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                buffer.queue.is_empty()
            };
            if empty {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let leftovers: Vec<Buffered> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.queue.drain(..).collect()
        };
        for item in leftovers {
            if !item.filed {
                if let Err(e) = self.file_sink.accept(&item.event).await {
                    error!(error = %e, "failed to archive audit event during shutdown");
                }
            }
        }
        if let Err(e) = self.file_sink.flush().await {
            error!(error = %e, "failed to flush audit file sink");
        }
    }
}

async fn drain_loop(logger: Arc<AuditLogger>) {
    let store_sink = StoreSink::new(logger.store.clone());
    loop {
        let item = {
            let mut buffer = logger.buffer.lock().unwrap_or_else(|e| e.into_inner());
            let item = buffer.queue.pop_front();
            if item.is_none() && buffer.closed {
                return;
            }
            item
        };
        let Some(item) = item else {
            logger.work.notified().await;
            continue;
        };
        logger.space.notify_one();

        if let Err(e) = store_sink.accept(&item.event).await {
            error!(error = %e, event_id = item.event.event_id, "store sink rejected audit event");
        }
        if !item.filed {
            if let Err(e) = logger.file_sink.accept(&item.event).await {
                error!(error = %e, event_id = item.event.event_id, "file sink rejected audit event");
            }
        }
        let extra: Vec<Arc<dyn AuditSink>> =
            logger.extra_sinks.read().unwrap_or_else(|e| e.into_inner()).clone();
        for sink in extra {
            if let Err(e) = sink.accept(&item.event).await {
                warn!(sink = sink.name(), error = %e, "external sink rejected audit event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store_memory::MemoryStore;

    async fn wait_for_events(logger: &AuditLogger, count: usize) -> Vec<AuditEvent> {
        for _ in 0..100 {
            let events = logger.query(&RecordFilter::default()).await.unwrap();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("audit events never reached the store");
    }

    #[tokio::test]
    async fn test_log_drains_to_store_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::shared();
        let logger = AuditLogger::new(
            store.clone(),
            dir.path().join("audit.jsonl"),
            AuditConfig::default(),
        )
        .await
        .unwrap();

        let id = logger
            .log(
                "action_execution_start",
                AuditLevel::Info,
                json!({"phase": "start"}),
                AuditScope::execution("e1", "send_email", Some("u1".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(id, 1);

        let events = wait_for_events(&logger, 1).await;
        assert_eq!(events[0].event_type, "action_execution_start");
        assert_eq!(events[0].user_id.as_deref(), Some("u1"));

        logger.shutdown().await;
        let contents =
            tokio::fs::read_to_string(dir.path().join("audit.jsonl")).await.unwrap();
        assert!(contents.contains("action_execution_start"));
    }

    #[tokio::test]
    async fn test_error_events_hit_file_before_ack() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::shared();
        let logger = AuditLogger::new(
            store,
            dir.path().join("audit.jsonl"),
            AuditConfig::default(),
        )
        .await
        .unwrap();

        logger
            .log("action_execution_error", AuditLevel::Error, json!({}), AuditScope::default())
            .await
            .unwrap();

        // The file line exists immediately, before any drain cycle.
        let contents =
            tokio::fs::read_to_string(dir.path().join("audit.jsonl")).await.unwrap();
        assert!(contents.contains("action_execution_error"));
    }

    #[tokio::test]
    async fn test_event_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::shared();
        let logger =
            AuditLogger::new(store, dir.path().join("a.jsonl"), AuditConfig::default())
                .await
                .unwrap();

        let a = logger.log("a", AuditLevel::Info, json!({}), AuditScope::default()).await.unwrap();
        let b = logger.log("b", AuditLevel::Info, json!({}), AuditScope::default()).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_summary_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::shared();
        let logger =
            AuditLogger::new(store, dir.path().join("a.jsonl"), AuditConfig::default())
                .await
                .unwrap();

        logger
            .log(
                "permission_denied",
                AuditLevel::Warning,
                json!({"reason": "missing role"}),
                AuditScope { user_id: Some("mallory".to_string()), ..Default::default() },
            )
            .await
            .unwrap();
        logger
            .log("action_execution_start", AuditLevel::Info, json!({}), AuditScope::default())
            .await
            .unwrap();
        wait_for_events(&logger, 2).await;

        let summary = logger.summary(1).await.unwrap();
        assert_eq!(summary["total_events"], 2);
        assert_eq!(summary["levels"]["warning"], 1);

        let hits = logger.search("missing role", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].event_type, "permission_denied");
    }

    #[tokio::test]
    async fn test_export_formats() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::shared();
        let logger =
            AuditLogger::new(store, dir.path().join("a.jsonl"), AuditConfig::default())
                .await
                .unwrap();
        logger.log("tick", AuditLevel::Info, json!({}), AuditScope::default()).await.unwrap();
        wait_for_events(&logger, 1).await;

        let jsonl = logger.export("json", &RecordFilter::default()).await.unwrap();
        assert!(String::from_utf8(jsonl).unwrap().contains("tick"));

        let csv = logger.export("csv", &RecordFilter::default()).await.unwrap();
        let csv = String::from_utf8(csv).unwrap();
        assert!(csv.starts_with("event_id,timestamp"));
        assert!(csv.contains("tick"));

        assert!(matches!(
            logger.export("xml", &RecordFilter::default()).await,
            Err(AuditError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_buffer_drops_oldest_non_critical() {
        let mut buffer = Buffer { queue: VecDeque::new(), capacity: 2, closed: false };
        let make = |id: u64, level: AuditLevel| Buffered {
            event: AuditEvent {
                event_id: id,
                timestamp: Utc::now(),
                event_type: "t".to_string(),
                level,
                user_id: None,
                action_name: None,
                execution_id: None,
                data: json!({}),
            },
            filed: false,
        };

        assert!(matches!(buffer.push(make(1, AuditLevel::Info)), PushOutcome::Accepted));
        assert!(matches!(buffer.push(make(2, AuditLevel::Critical)), PushOutcome::Accepted));
        // Full: evicts event 1 (oldest non-critical), keeps the critical.
        assert!(matches!(buffer.push(make(3, AuditLevel::Info)), PushOutcome::DroppedOldest));
        assert_eq!(buffer.queue.front().unwrap().event.event_id, 2);

        // A buffer of only critical events refuses non-critical arrivals...
        let mut buffer = Buffer { queue: VecDeque::new(), capacity: 1, closed: false };
        assert!(matches!(buffer.push(make(1, AuditLevel::Critical)), PushOutcome::Accepted));
        assert!(matches!(buffer.push(make(2, AuditLevel::Info)), PushOutcome::Full(_)));
        // ...and critical arrivals as well (they wait rather than evict).
        assert!(matches!(buffer.push(make(3, AuditLevel::Critical)), PushOutcome::Full(_)));
    }
}
