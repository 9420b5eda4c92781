#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-store-jsonl** – Append-only JSON-lines event-store driver.
//!
//! A log-structured driver: every mutation is appended as one JSON object
//! per line and fsynced before the call returns, satisfying the store
//! contract's durable-before-return guarantee. Reads are served from an
//! in-memory index rebuilt by replaying the log on open.
//!
//! The log is never rewritten in place. `prune` drops records from the index
//! and appends a prune marker so a later replay reaches the same state; log
//! compaction is an offline concern.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use courier_store_core::{
    merge_patch, EventStore, RecordFilter, RecordKind, StoreError, StoredRecord,
};

//─────────────────────────────
//  Log entries
//─────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Append { record: StoredRecord },
    Update { kind: RecordKind, id: u64, patch: Value },
    Set { kind: RecordKind, id: u64, field: String, value: Value },
    Prune { now: DateTime<Utc> },
}

//─────────────────────────────
//  In-memory index
//─────────────────────────────

#[derive(Debug, Default)]
struct Index {
    partitions: HashMap<RecordKind, BTreeMap<u64, StoredRecord>>,
    next_id: u64,
}

impl Index {
    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Append { record } => {
                self.next_id = self.next_id.max(record.id + 1);
                self.partitions.entry(record.kind).or_default().insert(record.id, record);
            }
            LogEntry::Update { kind, id, patch } => {
                if let Some(record) =
                    self.partitions.get_mut(&kind).and_then(|partition| partition.get_mut(&id))
                {
                    merge_patch(&mut record.body, &patch);
                }
            }
            LogEntry::Set { kind, id, field, value } => {
                if let Some(record) =
                    self.partitions.get_mut(&kind).and_then(|partition| partition.get_mut(&id))
                {
                    if let Value::Object(body) = &mut record.body {
                        body.insert(field, value);
                    }
                }
            }
            LogEntry::Prune { now } => {
                self.prune(now);
            }
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for (kind, partition) in self.partitions.iter_mut() {
            let Some(retention) = kind.retention() else { continue };
            let cutoff = now - retention;
            let before = partition.len();
            partition.retain(|_, record| record.created_at >= cutoff);
            removed += before - partition.len();
        }
        removed
    }
}

//─────────────────────────────
//  Driver
//─────────────────────────────

struct Inner {
    index: Index,
    file: tokio::fs::File,
}

/// JSON-lines event store backed by a single append-only log file.
pub struct JsonlStore {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl JsonlStore {
    /// Open (or create) the store at `path`, replaying any existing log.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        let mut index = Index { next_id: 1, ..Default::default() };
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let mut replayed = 0usize;
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogEntry>(line) {
                        Ok(entry) => {
                            index.apply(entry);
                            replayed += 1;
                        }
                        // A torn tail from a crash mid-write is expected;
                        // anything else is worth surfacing.
                        Err(e) => warn!(line = line_no + 1, error = %e, "skipping unreadable log line"),
                    }
                }
                debug!(path = %path.display(), replayed, "replayed store log");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Unavailable(e.to_string())),
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self { inner: Mutex::new(Inner { index, file }), path })
    }

    /// Path of the backing log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_entry(inner: &mut Inner, entry: &LogEntry) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_string(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push('\n');
        inner
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        inner.file.flush().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        inner.file.sync_data().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for JsonlStore {
    async fn append(&self, kind: RecordKind, body: Value) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.index.next_id;
        let record = StoredRecord { id, kind, created_at: Utc::now(), body };
        let entry = LogEntry::Append { record };
        Self::write_entry(&mut inner, &entry).await?;
        inner.index.apply(entry);
        Ok(id)
    }

    async fn get(&self, kind: RecordKind, id: u64) -> Result<Option<StoredRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .partitions
            .get(&kind)
            .and_then(|partition| partition.get(&id))
            .cloned())
    }

    async fn update(&self, kind: RecordKind, id: u64, patch: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let exists = inner
            .index
            .partitions
            .get(&kind)
            .map(|partition| partition.contains_key(&id))
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::NotFound { kind: kind.as_str(), id });
        }
        let entry = LogEntry::Update { kind, id, patch };
        Self::write_entry(&mut inner, &entry).await?;
        inner.index.apply(entry);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        kind: RecordKind,
        id: u64,
        field: &str,
        expected: &Value,
        new: Value,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .index
            .partitions
            .get(&kind)
            .and_then(|partition| partition.get(&id))
            .ok_or(StoreError::NotFound { kind: kind.as_str(), id })?
            .body
            .get(field)
            .cloned()
            .unwrap_or(Value::Null);
        if &current != expected {
            return Ok(false);
        }
        let entry = LogEntry::Set { kind, id, field: field.to_string(), value: new };
        Self::write_entry(&mut inner, &entry).await?;
        inner.index.apply(entry);
        Ok(true)
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(partition) = inner.index.partitions.get(&kind) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for record in partition.values().rev() {
            if filter.matches(record) {
                out.push(record.clone());
                if filter.limit > 0 && out.len() >= filter.limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn scan(&self, kind: RecordKind, since_id: u64) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .partitions
            .get(&kind)
            .map(|partition| {
                partition
                    .range((since_id + 1)..)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = LogEntry::Prune { now };
        Self::write_entry(&mut inner, &entry).await?;
        Ok(inner.index.prune(now))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let inner = self.inner.lock().await;
        inner.file.sync_all().await.map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        let id = store
            .append(RecordKind::Notification, json!({"id": "n1", "type": "task_started"}))
            .await
            .unwrap();
        store.close().await.unwrap();
        drop(store);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let record = reopened.get(RecordKind::Notification, id).await.unwrap().unwrap();
        assert_eq!(record.body["id"], "n1");
    }

    #[tokio::test]
    async fn test_updates_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        let id = store
            .append(RecordKind::EndTaskEvent, json!({"processed": false}))
            .await
            .unwrap();
        store
            .update(RecordKind::EndTaskEvent, id, json!({"processed": true}))
            .await
            .unwrap();
        drop(store);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let record = reopened.get(RecordKind::EndTaskEvent, id).await.unwrap().unwrap();
        assert_eq!(record.body["processed"], true);
    }

    #[tokio::test]
    async fn test_ids_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        let first = store.append(RecordKind::AuditEvent, json!({})).await.unwrap();
        drop(store);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let second = reopened.append(RecordKind::AuditEvent, json!({})).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_compare_and_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        let id = store
            .append(RecordKind::Approval, json!({"status": "pending"}))
            .await
            .unwrap();

        let swapped = store
            .compare_and_set(RecordKind::Approval, id, "status", &json!("pending"), json!("approved"))
            .await
            .unwrap();
        assert!(swapped);

        let swapped = store
            .compare_and_set(RecordKind::Approval, id, "status", &json!("pending"), json!("rejected"))
            .await
            .unwrap();
        assert!(!swapped);
        drop(store);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let record = reopened.get(RecordKind::Approval, id).await.unwrap().unwrap();
        assert_eq!(record.body["status"], "approved");
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        store.append(RecordKind::AuditEvent, json!({"n": 1})).await.unwrap();
        drop(store);

        // Simulate a crash mid-write.
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{\"op\":\"append\",\"record\":{\"id\":9,");
        tokio::fs::write(&path, contents).await.unwrap();

        let reopened = JsonlStore::open(&path).await.unwrap();
        let records = reopened.scan(RecordKind::AuditEvent, 0).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_marker_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        store.append(RecordKind::Notification, json!({})).await.unwrap();
        let removed = store.prune(Utc::now() + chrono::Duration::days(2)).await.unwrap();
        assert_eq!(removed, 1);
        drop(store);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let records = reopened.scan(RecordKind::Notification, 0).await.unwrap();
        assert!(records.is_empty());
    }
}
