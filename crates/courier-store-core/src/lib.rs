#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-store-core** – Core event-store abstractions for Courier.
//!
//! This crate defines the persistence contract consumed by every other
//! component: an append-only store of JSON records partitioned by
//! [`RecordKind`], with monotonic ids, last-writer-wins field updates, a
//! compare-and-set primitive for approval records, filtered newest-first
//! queries, and a reconciliation scan.
//!
//! Storage drivers (in-memory, JSON-lines file, and future backends) live in
//! separate crates that depend on this abstraction. The Event Store
//! exclusively owns persistence of notifications, delivery attempts,
//! end-task events, audit events, and approvals; other components hold
//! transient views only.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use async_trait::async_trait;

//─────────────────────────────
//  Record kinds
//─────────────────────────────

/// Partitions of the store, one per persisted entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Registered webhook endpoints (mutable counters)
    Webhook,
    /// Individual delivery attempts (append-only)
    DeliveryAttempt,
    /// Delivery tasks whose retry budget is exhausted
    DeadLetter,
    /// Agent end-task events
    EndTaskEvent,
    /// Rolling per-webhook delivery metrics
    WebhookMetric,
    /// Structured audit events (append-only)
    AuditEvent,
    /// Notification payloads (immutable)
    Notification,
    /// Processed markers for notifications, separate from the payload
    NotificationMarker,
    /// Approval requests (compare-and-set updates)
    Approval,
}

impl RecordKind {
    /// Stream/table name used by file-backed drivers.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Webhook => "webhooks",
            RecordKind::DeliveryAttempt => "delivery_attempts",
            RecordKind::DeadLetter => "dead_letters",
            RecordKind::EndTaskEvent => "agent_end_task_events",
            RecordKind::WebhookMetric => "webhook_metrics",
            RecordKind::AuditEvent => "audit_events",
            RecordKind::Notification => "notifications",
            RecordKind::NotificationMarker => "notification_markers",
            RecordKind::Approval => "approvals",
        }
    }

    /// All record kinds.
    pub fn all() -> &'static [RecordKind] {
        &[
            RecordKind::Webhook,
            RecordKind::DeliveryAttempt,
            RecordKind::DeadLetter,
            RecordKind::EndTaskEvent,
            RecordKind::WebhookMetric,
            RecordKind::AuditEvent,
            RecordKind::Notification,
            RecordKind::NotificationMarker,
            RecordKind::Approval,
        ]
    }

    /// Retention period after which records of this kind may be pruned.
    ///
    /// `None` means retention is handled externally (audit events rotate via
    /// the file sink, webhook registrations live until unregistered).
    pub fn retention(&self) -> Option<Duration> {
        match self {
            RecordKind::Notification | RecordKind::NotificationMarker => Some(Duration::hours(24)),
            RecordKind::DeliveryAttempt | RecordKind::DeadLetter | RecordKind::WebhookMetric => {
                Some(Duration::days(7))
            }
            RecordKind::Webhook
            | RecordKind::EndTaskEvent
            | RecordKind::AuditEvent
            | RecordKind::Approval => None,
        }
    }
}

//─────────────────────────────
//  Records and filters
//─────────────────────────────

/// A record as held by the store: monotonic id, kind, creation time, and the
/// JSON body supplied by the owning component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Monotonic identifier, unique within the store
    pub id: u64,
    /// Partition this record belongs to
    pub kind: RecordKind,
    /// Append time
    pub created_at: DateTime<Utc>,
    /// Component-defined JSON body
    pub body: Value,
}

/// Filter for [`EventStore::query`]. Body-field filters match against the
/// top-level fields of the record body; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Only records created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only records created at or before this instant
    pub until: Option<DateTime<Utc>>,
    /// Match `body.event_type`
    pub event_type: Option<String>,
    /// Match `body.user_id`
    pub user_id: Option<String>,
    /// Match `body.action_name`
    pub action_name: Option<String>,
    /// Match `body.level`
    pub level: Option<String>,
    /// Maximum records to return (0 means unlimited)
    pub limit: usize,
}

impl RecordFilter {
    /// True if `record` passes every set filter field.
    pub fn matches(&self, record: &StoredRecord) -> bool {
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at > until {
                return false;
            }
        }
        let field_matches = |field: &str, expected: &Option<String>| -> bool {
            match expected {
                None => true,
                Some(want) => record.body.get(field).and_then(Value::as_str) == Some(want.as_str()),
            }
        };
        field_matches("event_type", &self.event_type)
            && field_matches("user_id", &self.user_id)
            && field_matches("action_name", &self.action_name)
            && field_matches("level", &self.level)
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by store drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing medium rejected or lost the write
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Record body could not be encoded or decoded
    #[error("record serialization failed: {0}")]
    Serialization(String),
    /// The referenced record does not exist
    #[error("record {id} not found in {kind}")]
    NotFound {
        /// Partition searched
        kind: &'static str,
        /// Missing record id
        id: u64,
    },
    /// An update would regress a terminal state or violate an invariant
    #[error("integrity violation: {0}")]
    Integrity(String),
}

//─────────────────────────────
//  Store contract
//─────────────────────────────

/// Abstraction over the durable event store.
///
/// `append` must make the record durable before returning. Ids are monotonic
/// within a store instance across all kinds, so `scan(kind, since_id)` is a
/// reliable reconciliation cursor.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a record, returning its monotonic id.
    async fn append(&self, kind: RecordKind, body: Value) -> Result<u64, StoreError>;

    /// Fetch the latest state of a record. Returns `None` if absent.
    async fn get(&self, kind: RecordKind, id: u64) -> Result<Option<StoredRecord>, StoreError>;

    /// Merge `patch`'s top-level fields into the record body,
    /// last-writer-wins. Fails with [`StoreError::NotFound`] if absent.
    async fn update(&self, kind: RecordKind, id: u64, patch: Value) -> Result<(), StoreError>;

    /// Atomically replace `field` with `new` iff its current value equals
    /// `expected`. Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        kind: RecordKind,
        id: u64,
        field: &str,
        expected: &Value,
        new: Value,
    ) -> Result<bool, StoreError>;

    /// Query records newest-first, applying `filter`.
    async fn query(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Return all records with id greater than `since_id`, oldest-first.
    async fn scan(&self, kind: RecordKind, since_id: u64) -> Result<Vec<StoredRecord>, StoreError>;

    /// Drop records past their kind's retention period. Returns the number
    /// of records removed.
    async fn prune(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Flush any buffered state and release resources.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Merge `patch`'s top-level fields into `body` in place. Shared by drivers
/// so update semantics cannot drift between them.
pub fn merge_patch(body: &mut Value, patch: &Value) {
    if let (Value::Object(body), Value::Object(patch)) = (body, patch) {
        for (key, value) in patch {
            body.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_body_fields() {
        let record = StoredRecord {
            id: 1,
            kind: RecordKind::AuditEvent,
            created_at: Utc::now(),
            body: json!({"event_type": "action_execution_start", "user_id": "u1", "level": "info"}),
        };

        let mut filter = RecordFilter::default();
        assert!(filter.matches(&record));

        filter.event_type = Some("action_execution_start".to_string());
        filter.user_id = Some("u1".to_string());
        assert!(filter.matches(&record));

        filter.level = Some("error".to_string());
        assert!(!filter.matches(&record));
    }

    #[test]
    fn test_filter_time_range() {
        let now = Utc::now();
        let record = StoredRecord {
            id: 1,
            kind: RecordKind::Notification,
            created_at: now,
            body: json!({}),
        };

        let filter = RecordFilter { since: Some(now + Duration::seconds(1)), ..Default::default() };
        assert!(!filter.matches(&record));

        let filter = RecordFilter {
            since: Some(now - Duration::seconds(1)),
            until: Some(now + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(filter.matches(&record));
    }

    #[test]
    fn test_merge_patch_overwrites_top_level() {
        let mut body = json!({"status": "pending", "retry_count": 0});
        merge_patch(&mut body, &json!({"status": "approved", "approved_at": "2024-01-01T00:00:00Z"}));
        assert_eq!(body["status"], "approved");
        assert_eq!(body["retry_count"], 0);
        assert_eq!(body["approved_at"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_retention_policy() {
        assert_eq!(RecordKind::Notification.retention(), Some(Duration::hours(24)));
        assert_eq!(RecordKind::DeliveryAttempt.retention(), Some(Duration::days(7)));
        assert_eq!(RecordKind::AuditEvent.retention(), None);
    }
}
