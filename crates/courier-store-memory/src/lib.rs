#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-store-memory** – In-memory event-store driver for Courier.
//!
//! A fast, non-persistent driver suitable for testing, development, and
//! deployments where durability is delegated elsewhere. All records are held
//! in ordered in-memory maps and lost when the process terminates.
//!
//! The driver also exposes a live broadcast of appended records, which the
//! service layer uses to stream store activity without polling.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use courier_store_core::{
    merge_patch, EventStore, RecordFilter, RecordKind, StoreError, StoredRecord,
};

/// Default buffer size for the live record broadcast channel.
const DEFAULT_BUFFER: usize = 1024;

/// An in-memory, non-persistent event store.
///
/// Records live in a `BTreeMap` per kind so scans come back in id order
/// without sorting. A single atomic counter hands out ids across all kinds,
/// keeping them monotonic within the store.
#[derive(Debug)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<RecordKind, BTreeMap<u64, StoredRecord>>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<StoredRecord>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Creates a store with a custom broadcast buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(buffer_size);
        Self {
            partitions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            broadcast_tx,
        }
    }

    /// Subscribe to the live stream of appended records.
    ///
    /// Slow subscribers may miss records if the broadcast buffer overflows;
    /// `scan` is the catch-up path.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredRecord> {
        self.broadcast_tx.subscribe()
    }

    /// Number of records currently held for `kind`.
    pub async fn record_count(&self, kind: RecordKind) -> usize {
        self.partitions
            .read()
            .await
            .get(&kind)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Wrap the store in an `Arc` for sharing across components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, kind: RecordKind, body: Value) -> Result<u64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = StoredRecord { id, kind, created_at: Utc::now(), body };

        self.partitions
            .write()
            .await
            .entry(kind)
            .or_default()
            .insert(id, record.clone());

        // Ignore send errors when nobody is listening.
        let _ = self.broadcast_tx.send(record);
        Ok(id)
    }

    async fn get(&self, kind: RecordKind, id: u64) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self
            .partitions
            .read()
            .await
            .get(&kind)
            .and_then(|partition| partition.get(&id))
            .cloned())
    }

    async fn update(&self, kind: RecordKind, id: u64, patch: Value) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        let record = partitions
            .get_mut(&kind)
            .and_then(|partition| partition.get_mut(&id))
            .ok_or(StoreError::NotFound { kind: kind.as_str(), id })?;
        merge_patch(&mut record.body, &patch);
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
        let mut partitions = self.partitions.write().await;
        let record = partitions
            .get_mut(&kind)
            .and_then(|partition| partition.get_mut(&id))
            .ok_or(StoreError::NotFound { kind: kind.as_str(), id })?;

        let current = record.body.get(field).unwrap_or(&Value::Null);
        if current != expected {
            return Ok(false);
        }
        if let Value::Object(body) = &mut record.body {
            body.insert(field.to_string(), new);
        }
        Ok(true)
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(&kind) else {
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
        let partitions = self.partitions.read().await;
        Ok(partitions
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
        let mut removed = 0;
        let mut partitions = self.partitions.write().await;
        for (kind, partition) in partitions.iter_mut() {
            let Some(retention) = kind.retention() else { continue };
            let cutoff = now - retention;
            let before = partition.len();
            partition.retain(|_, record| record.created_at >= cutoff);
            removed += before - partition.len();
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
