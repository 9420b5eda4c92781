#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-security** – Security controls for action execution.
//!
//! Centralizes the four gates every action passes through: role and
//! clearance checks against per-action policies, per-user-per-action hourly
//! rate windows, the approval lifecycle with deterministic approval keys,
//! and recursive input sanitization.
//!
//! The decision procedure is fail-closed: a missing permission, missing
//! policy, or expired grant denies. Rate windows are in-memory and advisory;
//! approvals are persisted through the event store with compare-and-set so
//! concurrent grants cannot double-count.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use courier_audit::{AuditLogger, AuditScope};
use courier_store_core::{EventStore, RecordKind};
use courier_types::{canonical_json, AuditLevel, SecurityLevel};

pub mod sanitize;

pub use sanitize::sanitize_input;

//─────────────────────────────
//  Policies and permissions
//─────────────────────────────

/// Security policy for one action, keyed by action name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Action this policy governs
    pub action_name: String,
    /// Role the caller must hold
    pub required_role: String,
    /// Clearance required to execute
    pub security_level: SecurityLevel,
    /// Per-user executions allowed per hour
    pub max_executions_per_hour: u32,
    /// Whether an approval grant must exist before execution
    pub approval_required: bool,
    /// Hours of the day (UTC) the action may run; `None` means always
    pub allowed_hours: Option<Vec<u32>>,
    /// Source addresses allowed to trigger the action; `None` means any
    pub ip_allowlist: Option<Vec<String>>,
}

impl SecurityPolicy {
    /// Policy with the common defaults: no approval, no hour or IP limits.
    pub fn new(
        action_name: impl Into<String>,
        required_role: impl Into<String>,
        security_level: SecurityLevel,
        max_executions_per_hour: u32,
    ) -> Self {
        Self {
            action_name: action_name.into(),
            required_role: required_role.into(),
            security_level,
            max_executions_per_hour,
            approval_required: false,
            allowed_hours: None,
            ip_allowlist: None,
        }
    }

    /// Mark the action as approval-gated.
    pub fn requires_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }
}

/// Permission record for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPermission {
    /// User identifier
    pub user_id: String,
    /// Roles held
    pub roles: HashSet<String>,
    /// Clearance level
    pub clearance: SecurityLevel,
    /// Free-form restrictions applied by adapters
    pub restrictions: Value,
    /// Expiry of the whole permission record
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserPermission {
    /// Permission with the given roles and clearance, never expiring.
    pub fn new(
        user_id: impl Into<String>,
        roles: impl IntoIterator<Item = &'static str>,
        clearance: SecurityLevel,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            roles: roles.into_iter().map(str::to_string).collect(),
            clearance,
            restrictions: json!({}),
            expires_at: None,
        }
    }
}

//─────────────────────────────
//  Approvals
//─────────────────────────────

/// How many approvers must grant before the request is approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Any one approver suffices
    Single,
    /// More than half of the approvers
    Majority,
    /// Every approver
    Unanimous,
}

impl ApprovalMode {
    /// Number of grants required for `approver_count` approvers.
    pub fn required(&self, approver_count: usize) -> usize {
        match self {
            ApprovalMode::Single => 1,
            ApprovalMode::Majority => approver_count / 2 + 1,
            ApprovalMode::Unanimous => approver_count,
        }
    }
}

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting grants
    Pending,
    /// Required grants received
    Approved,
    /// Explicitly rejected
    Rejected,
    /// Expired before enough grants arrived
    Expired,
}

/// An approval request, identified deterministically by action and input so
/// repeated requests for the same logical operation collapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Deterministic identifier (see [`approval_key`])
    pub approval_id: String,
    /// Action awaiting approval
    pub action_name: String,
    /// Input the approval covers
    pub input: Value,
    /// Who asked
    pub requester_id: String,
    /// Who may grant
    pub approvers: Vec<String>,
    /// Grants received so far
    pub approvals_received: Vec<String>,
    /// Grants required for approval
    pub approvals_required: usize,
    /// Current state
    pub status: ApprovalStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry deadline
    pub expires_at: DateTime<Utc>,
}

/// Deterministic approval identifier: the first 16 hex characters of
/// `sha256(action_name || ":" || canonical_json(input))`.
pub fn approval_key(action_name: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action_name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(input).as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the security manager.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// Role, clearance, expiry, or policy gate failed
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The action requires an approval that is absent or ungranted
    #[error("action `{0}` requires approval")]
    ApprovalRequired(String),
    /// Per-user rate window exhausted
    #[error("rate limit exceeded: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the oldest attempt leaves the window
        retry_after_secs: i64,
    },
    /// Input contained a dangerous pattern
    #[error("dangerous input at `{path}`: matched `{pattern}`")]
    DangerousInput {
        /// Path of the offending value
        path: String,
        /// Pattern that matched
        pattern: String,
    },
    /// Referenced approval does not exist
    #[error("unknown approval `{0}`")]
    UnknownApproval(String),
    /// Grantor is not in the approver set
    #[error("`{approver}` is not an approver of `{approval_id}`")]
    NotAnApprover {
        /// Offending grantor
        approver: String,
        /// Approval involved
        approval_id: String,
    },
    /// Grantor already granted this approval
    #[error("`{approver}` already granted `{approval_id}`")]
    DuplicateApproval {
        /// Offending grantor
        approver: String,
        /// Approval involved
        approval_id: String,
    },
    /// The approval is no longer pending
    #[error("approval `{0}` is not pending")]
    NotPending(String),
}

//─────────────────────────────
//  Security manager
//─────────────────────────────

/// Default approval lifetime in hours.
const APPROVAL_TTL_HOURS: i64 = 24;

/// Authorization, rate limiting, and approvals for action execution.
pub struct SecurityManager {
    store: Arc<dyn EventStore>,
    audit: Option<Arc<AuditLogger>>,
    policies: DashMap<String, SecurityPolicy>,
    permissions: DashMap<String, UserPermission>,
    approvals: DashMap<String, ApprovalRequest>,
    approval_record_ids: DashMap<String, u64>,
    rate_windows: DashMap<String, Vec<DateTime<Utc>>>,
}

impl SecurityManager {
    /// Create an empty manager over `store`.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            audit: None,
            policies: DashMap::new(),
            permissions: DashMap::new(),
            approvals: DashMap::new(),
            approval_record_ids: DashMap::new(),
            rate_windows: DashMap::new(),
        }
    }

    /// Attach an audit logger for approval-lifecycle events.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register the builtin policy table and development users.
    pub fn with_defaults(self) -> Self {
        for policy in default_policies() {
            self.policies.insert(policy.action_name.clone(), policy);
        }
        for permission in default_permissions() {
            self.permissions.insert(permission.user_id.clone(), permission);
        }
        self
    }

    /// Install or replace a policy.
    pub fn set_policy(&self, policy: SecurityPolicy) {
        self.policies.insert(policy.action_name.clone(), policy);
    }

    /// Fetch a policy by action name.
    pub fn policy(&self, action_name: &str) -> Option<SecurityPolicy> {
        self.policies.get(action_name).map(|p| p.clone())
    }

    /// Install or replace a user permission record.
    pub fn set_permission(&self, permission: UserPermission) {
        self.permissions.insert(permission.user_id.clone(), permission);
    }

    /// Decision procedure for executing `action_name` as `user_id` at
    /// `needed_level`. Records the attempt in the user's rate window on
    /// success; denial leaves the window untouched.
    pub fn check_permission(
        &self,
        user_id: &str,
        action_name: &str,
        needed_level: SecurityLevel,
    ) -> Result<(), SecurityError> {
        let now = Utc::now();

        // 1. Permission exists and is unexpired.
        let permission = self
            .permissions
            .get(user_id)
            .ok_or_else(|| SecurityError::PermissionDenied(format!("unknown user `{user_id}`")))?;
        if matches!(permission.expires_at, Some(at) if at < now) {
            return Err(SecurityError::PermissionDenied(format!(
                "permission for `{user_id}` expired"
            )));
        }

        // 2. Policy exists (fail-closed).
        let policy = self.policies.get(action_name).ok_or_else(|| {
            SecurityError::PermissionDenied(format!("no policy for `{action_name}`"))
        })?;

        // 3. Required role held.
        if !permission.roles.contains(&policy.required_role) {
            return Err(SecurityError::PermissionDenied(format!(
                "`{user_id}` lacks role `{}`",
                policy.required_role
            )));
        }

        // 4. Clearance rank sufficient.
        if permission.clearance.rank() < needed_level.rank() {
            return Err(SecurityError::PermissionDenied(format!(
                "`{user_id}` clearance `{}` below `{}`",
                permission.clearance.as_str(),
                needed_level.as_str()
            )));
        }

        // 5 + 6. Rate window check, recording the attempt on success.
        self.record_attempt(user_id, action_name, policy.max_executions_per_hour, now)?;

        debug!(user_id, action_name, "permission granted");
        Ok(())
    }

    fn record_attempt(
        &self,
        user_id: &str,
        action_name: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<(), SecurityError> {
        let key = format!("{user_id}:{action_name}");
        let mut window = self.rate_windows.entry(key).or_default();
        let hour_ago = now - Duration::hours(1);
        window.retain(|at| *at > hour_ago);

        if window.len() >= limit as usize {
            let retry_after_secs = window
                .first()
                .map(|oldest| (*oldest + Duration::hours(1) - now).num_seconds().max(1))
                .unwrap_or(3600);
            return Err(SecurityError::RateLimited { retry_after_secs });
        }
        window.push(now);
        Ok(())
    }

    /// Remaining attempts for the user and action within the current hour.
    pub fn remaining_attempts(&self, user_id: &str, action_name: &str) -> Option<u32> {
        let policy = self.policies.get(action_name)?;
        let key = format!("{user_id}:{action_name}");
        let used = self
            .rate_windows
            .get(&key)
            .map(|window| {
                let hour_ago = Utc::now() - Duration::hours(1);
                window.iter().filter(|at| **at > hour_ago).count()
            })
            .unwrap_or(0);
        Some(policy.max_executions_per_hour.saturating_sub(used as u32))
    }

    //─────────────────────────────
    //  Approval lifecycle
    //─────────────────────────────

    /// Create (or return the existing) approval request for the action and
    /// input. Returns the deterministic approval id.
    pub async fn request_approval(
        &self,
        action_name: &str,
        input: &Value,
        requester_id: &str,
        approvers: Vec<String>,
        mode: ApprovalMode,
    ) -> Result<String, SecurityError> {
        let approval_id = approval_key(action_name, input);
        let now = Utc::now();

        if let Some(existing) = self.approvals.get(&approval_id) {
            if existing.status == ApprovalStatus::Pending && existing.expires_at > now {
                return Ok(approval_id);
            }
        }

        let request = ApprovalRequest {
            approval_id: approval_id.clone(),
            action_name: action_name.to_string(),
            input: input.clone(),
            requester_id: requester_id.to_string(),
            approvals_required: mode.required(approvers.len()),
            approvers,
            approvals_received: Vec::new(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + Duration::hours(APPROVAL_TTL_HOURS),
        };

        let body = serde_json::to_value(&request)
            .unwrap_or_else(|_| json!({"approval_id": approval_id}));
        if let Ok(record_id) = self.store.append(RecordKind::Approval, body).await {
            self.approval_record_ids.insert(approval_id.clone(), record_id);
        }
        self.approvals.insert(approval_id.clone(), request);

        self.audit_approval("approval_requested", &approval_id, requester_id).await;
        Ok(approval_id)
    }

    /// Record one grant. Transitions the request to `Approved` once the
    /// required number of distinct approvers have granted.
    pub async fn grant_approval(
        &self,
        approval_id: &str,
        approver: &str,
    ) -> Result<ApprovalStatus, SecurityError> {
        let (status, previous_received, received) = {
            let mut entry = self
                .approvals
                .get_mut(approval_id)
                .ok_or_else(|| SecurityError::UnknownApproval(approval_id.to_string()))?;

            if entry.expires_at < Utc::now() {
                entry.status = ApprovalStatus::Expired;
                return Err(SecurityError::NotPending(approval_id.to_string()));
            }
            if entry.status != ApprovalStatus::Pending {
                return Err(SecurityError::NotPending(approval_id.to_string()));
            }
            if !entry.approvers.iter().any(|a| a == approver) {
                return Err(SecurityError::NotAnApprover {
                    approver: approver.to_string(),
                    approval_id: approval_id.to_string(),
                });
            }
            if entry.approvals_received.iter().any(|a| a == approver) {
                return Err(SecurityError::DuplicateApproval {
                    approver: approver.to_string(),
                    approval_id: approval_id.to_string(),
                });
            }

            let previous = entry.approvals_received.clone();
            entry.approvals_received.push(approver.to_string());
            if entry.approvals_received.len() >= entry.approvals_required {
                entry.status = ApprovalStatus::Approved;
            }
            (entry.status, previous, entry.approvals_received.clone())
        };

        // Persist via compare-and-set so a concurrent writer with a stale
        // view cannot clobber the grant list.
        let record_id = self.approval_record_ids.get(approval_id).map(|r| *r);
        if let Some(record_id) = record_id {
            let swapped = self
                .store
                .compare_and_set(
                    RecordKind::Approval,
                    record_id,
                    "approvals_received",
                    &json!(previous_received),
                    json!(received),
                )
                .await
                .unwrap_or(false);
            if swapped {
                let _ = self
                    .store
                    .update(RecordKind::Approval, record_id, json!({"status": status}))
                    .await;
            } else {
                warn!(approval_id, "approval store record drifted from memory");
            }
        }

        self.audit_approval("approval_granted", approval_id, approver).await;
        Ok(status)
    }

    /// Reject a pending approval outright.
    pub async fn reject_approval(
        &self,
        approval_id: &str,
        approver: &str,
    ) -> Result<(), SecurityError> {
        {
            let mut entry = self
                .approvals
                .get_mut(approval_id)
                .ok_or_else(|| SecurityError::UnknownApproval(approval_id.to_string()))?;
            if entry.status != ApprovalStatus::Pending {
                return Err(SecurityError::NotPending(approval_id.to_string()));
            }
            if !entry.approvers.iter().any(|a| a == approver) {
                return Err(SecurityError::NotAnApprover {
                    approver: approver.to_string(),
                    approval_id: approval_id.to_string(),
                });
            }
            entry.status = ApprovalStatus::Rejected;
        }
        let record_id = self.approval_record_ids.get(approval_id).map(|r| *r);
        if let Some(record_id) = record_id {
            let _ = self
                .store
                .update(RecordKind::Approval, record_id, json!({"status": "rejected"}))
                .await;
        }
        self.audit_approval("approval_rejected", approval_id, approver).await;
        Ok(())
    }

    /// True iff an approval for exactly this action and input is `Approved`
    /// and unexpired.
    pub fn check_approval_status(&self, action_name: &str, input: &Value) -> bool {
        let approval_id = approval_key(action_name, input);
        self.approvals
            .get(&approval_id)
            .map(|request| {
                request.status == ApprovalStatus::Approved && request.expires_at > Utc::now()
            })
            .unwrap_or(false)
    }

    /// Pending approvals awaiting `user_id`.
    pub fn pending_approvals(&self, user_id: &str) -> Vec<ApprovalRequest> {
        self.approvals
            .iter()
            .filter(|entry| {
                entry.status == ApprovalStatus::Pending
                    && entry.approvers.iter().any(|a| a == user_id)
            })
            .map(|entry| entry.clone())
            .collect()
    }

    /// Mark expired approvals and return how many were swept.
    pub async fn sweep_expired_approvals(&self) -> usize {
        let now = Utc::now();
        let mut expired = Vec::new();
        for mut entry in self.approvals.iter_mut() {
            if entry.status == ApprovalStatus::Pending && entry.expires_at < now {
                entry.status = ApprovalStatus::Expired;
                expired.push(entry.approval_id.clone());
            }
        }
        for approval_id in &expired {
            let record_id = self.approval_record_ids.get(approval_id).map(|r| *r);
            if let Some(record_id) = record_id {
                let _ = self
                    .store
                    .update(RecordKind::Approval, record_id, json!({"status": "expired"}))
                    .await;
            }
        }
        expired.len()
    }

    /// Summary counters for the stats endpoint.
    pub fn security_metrics(&self) -> Value {
        let pending = self
            .approvals
            .iter()
            .filter(|entry| entry.status == ApprovalStatus::Pending)
            .count();
        json!({
            "policies": self.policies.len(),
            "users": self.permissions.len(),
            "pending_approvals": pending,
            "total_approvals": self.approvals.len(),
            "active_rate_windows": self.rate_windows.len(),
        })
    }

    async fn audit_approval(&self, event_type: &str, approval_id: &str, actor: &str) {
        if let Some(audit) = &self.audit {
            let _ = audit
                .log(
                    event_type,
                    AuditLevel::Info,
                    json!({"approval_id": approval_id, "actor": actor}),
                    AuditScope::default(),
                )
                .await;
        }
    }
}

//─────────────────────────────
//  Builtin tables
//─────────────────────────────

/// The builtin per-action policy table.
pub fn default_policies() -> Vec<SecurityPolicy> {
    vec![
        SecurityPolicy::new("escalate_to_human", "user", SecurityLevel::Elevated, 10),
        SecurityPolicy::new("request_approval", "user", SecurityLevel::Elevated, 5),
        SecurityPolicy::new("send_email", "user", SecurityLevel::Standard, 50),
        SecurityPolicy::new("send_chat_message", "user", SecurityLevel::Standard, 100),
        SecurityPolicy::new("trigger_workflow", "developer", SecurityLevel::Elevated, 20)
            .requires_approval(),
        SecurityPolicy::new("stop_workflow", "admin", SecurityLevel::Elevated, 10)
            .requires_approval(),
        SecurityPolicy::new("create_ticket", "user", SecurityLevel::Standard, 30),
        SecurityPolicy::new("create_issue", "developer", SecurityLevel::Standard, 25),
        SecurityPolicy::new("update_documentation", "developer", SecurityLevel::Elevated, 15),
        SecurityPolicy::new("create_alert", "admin", SecurityLevel::Elevated, 10)
            .requires_approval(),
        SecurityPolicy::new("trigger_security_scan", "security_admin", SecurityLevel::Admin, 5)
            .requires_approval(),
        SecurityPolicy::new("cancel_execution", "user", SecurityLevel::Elevated, 50),
        SecurityPolicy::new("dispatch_task", "user", SecurityLevel::Standard, 1000),
    ]
}

/// Development user table; production deployments replace this from config.
pub fn default_permissions() -> Vec<UserPermission> {
    vec![
        UserPermission::new(
            "system",
            ["system", "admin", "security_admin", "developer", "user"],
            SecurityLevel::Admin,
        ),
        UserPermission::new("admin", ["admin", "developer", "user"], SecurityLevel::Elevated),
        UserPermission::new("developer", ["developer", "user"], SecurityLevel::Elevated),
        UserPermission::new("user", ["user"], SecurityLevel::Standard),
    ]
}
