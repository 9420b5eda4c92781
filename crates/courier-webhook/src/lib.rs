#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **courier-webhook** – Outbound webhook delivery for Courier.
//!
//! Four cooperating workloads built on bounded queues and a cancellation
//! token:
//!
//! 1. **Ingress** – [`WebhookManager::send`] fans an event out to one
//!    delivery task per matching endpoint; a full queue is a first-class
//!    [`WebhookError::Backpressure`], never a silent drop.
//! 2. **Delivery workers** – N parallel workers POST the canonical JSON
//!    body with identity, timing, and HMAC signature headers under
//!    connect/read/total timeouts.
//! 3. **Retry worker** – failed deliveries reschedule with exponential
//!    backoff and jitter until the retry budget is exhausted, then park as
//!    dead letters.
//! 4. **Metrics worker** – periodically aggregates the trailing hour of
//!    attempts per endpoint into rolling metrics records.
//!
//! Endpoint counters use terminal-outcome semantics: a retry chain bumps
//! `successful_deliveries` or `failed_deliveries` exactly once. Per-attempt
//! accounting lives in the delivery-attempt history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_schema::{validate, PayloadKind, SchemaViolation};
use courier_store_core::{EventStore, RecordFilter, RecordKind, StoreError};
use courier_types::{canonical_json, WebhookEventType};

pub mod sign;

pub use sign::{sign_payload, verify_signature, SIGNATURE_HEADER};

/// HTTP statuses that count a delivery attempt as successful.
const SUCCESS_STATUSES: &[u16] = &[200, 201, 202, 204];

/// Response bodies are truncated to this many bytes in attempt history.
const RESPONSE_BODY_CAP: usize = 1000;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Retry schedule for failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first (attempts 1..=max_retries+1 total)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Exponential multiplier
    pub multiplier: f64,
    /// Apply ±50% jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            capped * (0.5 + rand::random::<f64>())
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

/// Outbound request deadlines.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// TCP connect deadline
    pub connect: Duration,
    /// Socket read deadline
    pub read: Duration,
    /// Whole-request deadline
    pub total: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            total: Duration::from_secs(60),
        }
    }
}

/// Top-level manager tuning.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Parallel delivery workers
    pub workers: usize,
    /// Bounded ingress queue size
    pub queue_capacity: usize,
    /// Retry schedule
    pub retry: RetryConfig,
    /// Request deadlines
    pub timeouts: TimeoutConfig,
    /// Metrics aggregation interval
    pub metrics_interval: Duration,
    /// Drain budget during shutdown
    pub shutdown_grace: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            metrics_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(15),
        }
    }
}

//─────────────────────────────
//  Endpoints and attempts
//─────────────────────────────

/// Which event families an endpoint receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub enum EventFilter {
    /// Every event family
    All,
    /// Only the listed families
    Only(Vec<WebhookEventType>),
}

impl EventFilter {
    /// True if `event_type` passes the filter.
    pub fn accepts(&self, event_type: WebhookEventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(kinds) => kinds.contains(&event_type),
        }
    }
}

impl TryFrom<Vec<String>> for EventFilter {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        if names.iter().any(|name| name == "all") {
            return Ok(EventFilter::All);
        }
        let mut kinds = Vec::new();
        for name in names {
            let kind = WebhookEventType::parse(&name)
                .ok_or_else(|| format!("unknown event type `{name}`"))?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(EventFilter::Only(kinds))
    }
}

impl From<EventFilter> for Vec<String> {
    fn from(filter: EventFilter) -> Self {
        match filter {
            EventFilter::All => vec!["all".to_string()],
            EventFilter::Only(kinds) => {
                kinds.iter().map(|kind| kind.as_str().to_string()).collect()
            }
        }
    }
}

/// A registered webhook endpoint with terminal-outcome counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Unique endpoint identifier
    pub webhook_id: String,
    /// Delivery URL
    pub url: String,
    /// HMAC secret; `None` disables signing
    pub secret: Option<String>,
    /// Event families delivered to this endpoint
    pub event_types: EventFilter,
    /// Whether deliveries are attempted
    pub active: bool,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last registration update
    pub updated_at: DateTime<Utc>,
    /// Time of the most recent attempt
    pub last_delivery_at: Option<DateTime<Utc>>,
    /// Delivery chains that reached a terminal outcome
    pub total_deliveries: u64,
    /// Chains that ended in a successful attempt
    pub successful_deliveries: u64,
    /// Chains that exhausted retries or were refused terminally
    pub failed_deliveries: u64,
}

/// One recorded HTTP delivery attempt. Append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique per attempt
    pub attempt_id: String,
    /// Endpoint attempted
    pub webhook_id: String,
    /// Stable within a retry chain; receivers deduplicate on this
    pub delivery_id: String,
    /// URL attempted
    pub endpoint_url: String,
    /// Event family delivered
    pub event_type: WebhookEventType,
    /// Payload snapshot
    pub payload: Value,
    /// Attempt time
    pub timestamp: DateTime<Utc>,
    /// Whether the response status counted as success
    pub success: bool,
    /// HTTP status, when a response arrived
    pub response_code: Option<u16>,
    /// Response body, truncated
    pub response_body: Option<String>,
    /// Transport-level error, when no response arrived
    pub error_message: Option<String>,
    /// Wall-clock duration of the attempt
    pub duration_ms: u64,
    /// Which retry this was (0 = first attempt)
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
struct DeliveryTask {
    webhook_id: String,
    delivery_id: String,
    event_type: WebhookEventType,
    payload: Value,
    retry_count: u32,
    scheduled_at: Option<tokio::time::Instant>,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the webhook manager.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Registration payload failed validation
    #[error(transparent)]
    Validation(#[from] SchemaViolation),
    /// Ingress queue full; caller may retry later
    #[error("webhook delivery queue is full")]
    Backpressure,
    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Unknown endpoint
    #[error("unknown webhook `{0}`")]
    UnknownWebhook(String),
}

//─────────────────────────────
//  Manager
//─────────────────────────────

/// Webhook registration, delivery, retry, and metrics.
pub struct WebhookManager {
    store: Arc<dyn EventStore>,
    config: WebhookConfig,
    client: reqwest::Client,
    endpoints: DashMap<String, WebhookEndpoint>,
    endpoint_record_ids: DashMap<String, u64>,
    delivery_tx: mpsc::Sender<DeliveryTask>,
    delivery_rx: Mutex<Option<mpsc::Receiver<DeliveryTask>>>,
    retry_tx: mpsc::Sender<DeliveryTask>,
    retry_rx: Mutex<Option<mpsc::Receiver<DeliveryTask>>>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebhookManager {
    /// Create a manager. Call [`WebhookManager::start`] to spawn workers.
    pub fn new(store: Arc<dyn EventStore>, config: WebhookConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect)
            .read_timeout(config.timeouts.read)
            .timeout(config.timeouts.total)
            .build()
            .unwrap_or_default();
        let (delivery_tx, delivery_rx) = mpsc::channel(config.queue_capacity);
        let (retry_tx, retry_rx) = mpsc::channel(config.queue_capacity);
        Arc::new(Self {
            store,
            config,
            client,
            endpoints: DashMap::new(),
            endpoint_record_ids: DashMap::new(),
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the delivery, retry, and metrics workers.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();

        let delivery_rx = self.delivery_rx.lock().await.take();
        if let Some(rx) = delivery_rx {
            let shared_rx = Arc::new(Mutex::new(rx));
            for worker_id in 0..self.config.workers.max(1) {
                let manager = self.clone();
                let rx = shared_rx.clone();
                handles.push(tokio::spawn(async move {
                    manager.delivery_worker(worker_id, rx).await;
                }));
            }
        }

        if let Some(rx) = self.retry_rx.lock().await.take() {
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.retry_worker(rx).await;
            }));
        }

        let manager = self.clone();
        handles.push(tokio::spawn(async move {
            manager.metrics_worker().await;
        }));

        self.workers.lock().unwrap_or_else(|e| e.into_inner()).extend(handles);
        info!(workers = self.config.workers, "webhook manager started");
    }

    //─────────────────────────────
    //  Registration
    //─────────────────────────────

    /// Register an endpoint from a `webhook_registration` payload.
    pub async fn register_from_payload(
        &self,
        payload: &Value,
    ) -> Result<WebhookEndpoint, WebhookError> {
        validate(payload, PayloadKind::WebhookRegistration)?;
        let webhook_id = payload["webhook_id"].as_str().unwrap_or_default().to_string();
        let url = payload["url"].as_str().unwrap_or_default().to_string();
        let secret = payload.get("secret").and_then(Value::as_str).map(str::to_string);
        let names: Vec<String> = payload
            .get("event_types")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["all".to_string()]);
        let event_types = EventFilter::try_from(names)
            .unwrap_or(EventFilter::All);
        let active = payload.get("active").and_then(Value::as_bool).unwrap_or(true);
        self.register(webhook_id, url, event_types, secret, active).await
    }

    /// Register (or replace) an endpoint.
    pub async fn register(
        &self,
        webhook_id: String,
        url: String,
        event_types: EventFilter,
        secret: Option<String>,
        active: bool,
    ) -> Result<WebhookEndpoint, WebhookError> {
        let now = Utc::now();
        let endpoint = match self.endpoints.get(&webhook_id) {
            Some(existing) => WebhookEndpoint {
                url,
                secret,
                event_types,
                active,
                updated_at: now,
                ..existing.value().clone()
            },
            None => WebhookEndpoint {
                webhook_id: webhook_id.clone(),
                url,
                secret,
                event_types,
                active,
                created_at: now,
                updated_at: now,
                last_delivery_at: None,
                total_deliveries: 0,
                successful_deliveries: 0,
                failed_deliveries: 0,
            },
        };

        let body = serde_json::to_value(&endpoint)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let existing_record = self.endpoint_record_ids.get(&webhook_id).map(|r| *r);
        match existing_record {
            Some(record_id) => {
                self.store.update(RecordKind::Webhook, record_id, body).await?;
            }
            None => {
                let record_id = self.store.append(RecordKind::Webhook, body).await?;
                self.endpoint_record_ids.insert(webhook_id.clone(), record_id);
            }
        }
        self.endpoints.insert(webhook_id.clone(), endpoint.clone());
        info!(webhook_id = %webhook_id, url = %endpoint.url, "registered webhook");
        Ok(endpoint)
    }

    /// Deactivate an endpoint. Returns false for unknown ids.
    pub async fn unregister(&self, webhook_id: &str) -> Result<bool, WebhookError> {
        let Some(mut endpoint) = self.endpoints.get_mut(webhook_id) else {
            return Ok(false);
        };
        endpoint.active = false;
        endpoint.updated_at = Utc::now();
        drop(endpoint);
        let record_id = self.endpoint_record_ids.get(webhook_id).map(|r| *r);
        if let Some(record_id) = record_id {
            self.store
                .update(
                    RecordKind::Webhook,
                    record_id,
                    json!({"active": false, "updated_at": Utc::now().to_rfc3339()}),
                )
                .await?;
        }
        info!(webhook_id, "unregistered webhook");
        Ok(true)
    }

    /// Fetch one endpoint.
    pub fn endpoint(&self, webhook_id: &str) -> Option<WebhookEndpoint> {
        self.endpoints.get(webhook_id).map(|entry| entry.clone())
    }

    /// All registered endpoints.
    pub fn endpoints(&self) -> Vec<WebhookEndpoint> {
        self.endpoints.iter().map(|entry| entry.clone()).collect()
    }

    //─────────────────────────────
    //  Ingress
    //─────────────────────────────

    /// Queue one delivery per matching endpoint. `targets` restricts the
    /// fan-out to specific webhook ids. Returns the number queued.
    pub fn send(
        &self,
        event_type: WebhookEventType,
        payload: Value,
        targets: Option<&[String]>,
    ) -> Result<usize, WebhookError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(WebhookError::Backpressure);
        }
        let matching: Vec<String> = self
            .endpoints
            .iter()
            .filter(|entry| {
                entry.active
                    && entry.event_types.accepts(event_type)
                    && targets
                        .map(|ids| ids.iter().any(|id| id == entry.key()))
                        .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut queued = 0;
        for webhook_id in matching {
            let task = DeliveryTask {
                webhook_id,
                delivery_id: Uuid::new_v4().to_string(),
                event_type,
                payload: payload.clone(),
                retry_count: 0,
                scheduled_at: None,
            };
            match self.delivery_tx.try_send(task) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("webhook delivery queue full");
                    return Err(WebhookError::Backpressure);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(WebhookError::Backpressure);
                }
            }
        }
        debug!(queued, event_type = event_type.as_str(), "queued webhook deliveries");
        Ok(queued)
    }

    //─────────────────────────────
    //  Workers
    //─────────────────────────────

    async fn delivery_worker(&self, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<DeliveryTask>>>) {
        debug!(worker_id, "delivery worker running");
        loop {
            let task = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else { return };
            self.process_delivery(task).await;
        }
    }

    async fn retry_worker(&self, mut rx: mpsc::Receiver<DeliveryTask>) {
        debug!("retry worker running");
        loop {
            let task = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                task = rx.recv() => task,
            };
            let Some(task) = task else { return };
            if let Some(at) = task.scheduled_at {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        self.record_cancelled(&task).await;
                        return;
                    }
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            self.process_delivery(task).await;
        }
    }

    async fn metrics_worker(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.metrics_interval) => {}
            }
            if let Err(e) = self.aggregate_metrics().await {
                error!(error = %e, "webhook metrics aggregation failed");
            }
        }
    }

    async fn process_delivery(&self, task: DeliveryTask) {
        let Some(endpoint) = self.endpoint(&task.webhook_id) else {
            debug!(webhook_id = %task.webhook_id, "dropping delivery for unknown endpoint");
            return;
        };
        if !endpoint.active {
            debug!(webhook_id = %task.webhook_id, "dropping delivery for inactive endpoint");
            return;
        }

        let body = canonical_json(&task.payload);
        let mut request = self
            .client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "courier-webhook/0.1")
            .header("X-Webhook-ID", &endpoint.webhook_id)
            .header("X-Event-Type", task.event_type.as_str())
            .header("X-Delivery-ID", &task.delivery_id)
            .header("X-Timestamp", Utc::now().to_rfc3339());
        if let Some(secret) = &endpoint.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &task.payload));
        }

        let started = tokio::time::Instant::now();
        let response = tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.record_cancelled(&task).await;
                return;
            }
            response = request.body(body).send() => response,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut attempt = DeliveryAttempt {
            attempt_id: Uuid::new_v4().to_string(),
            webhook_id: task.webhook_id.clone(),
            delivery_id: task.delivery_id.clone(),
            endpoint_url: endpoint.url.clone(),
            event_type: task.event_type,
            payload: task.payload.clone(),
            timestamp: Utc::now(),
            success: false,
            response_code: None,
            response_body: None,
            error_message: None,
            duration_ms,
            retry_count: task.retry_count,
        };

        let mut gone = false;
        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                attempt.response_code = Some(status);
                attempt.success = SUCCESS_STATUSES.contains(&status);
                gone = status == 410;
                let text = response.text().await.unwrap_or_default();
                attempt.response_body = Some(truncate(&text, RESPONSE_BODY_CAP));
            }
            Err(e) => {
                attempt.error_message = Some(e.to_string());
            }
        }

        self.record_attempt(&attempt).await;
        if let Some(mut entry) = self.endpoints.get_mut(&task.webhook_id) {
            entry.last_delivery_at = Some(attempt.timestamp);
        }

        if attempt.success {
            info!(
                webhook_id = %task.webhook_id,
                status = attempt.response_code,
                duration_ms,
                "webhook delivered"
            );
            self.finalize(&task.webhook_id, true).await;
            return;
        }

        if gone {
            // 410 Gone: the receiver told us to stop trying, permanently.
            warn!(webhook_id = %task.webhook_id, "endpoint returned 410, disabling");
            let _ = self.unregister(&task.webhook_id).await;
            self.finalize(&task.webhook_id, false).await;
            return;
        }

        if task.retry_count < self.config.retry.max_retries {
            self.schedule_retry(task).await;
        } else {
            self.dead_letter(&task, &attempt).await;
            self.finalize(&task.webhook_id, false).await;
        }
    }

    async fn schedule_retry(&self, mut task: DeliveryTask) {
        task.retry_count += 1;
        let delay = self.config.retry.delay_for(task.retry_count);
        task.scheduled_at = Some(tokio::time::Instant::now() + delay);
        info!(
            webhook_id = %task.webhook_id,
            retry = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduled webhook retry"
        );
        if self.retry_tx.send(task).await.is_err() {
            warn!("retry queue closed, dropping retry");
        }
    }

    async fn dead_letter(&self, task: &DeliveryTask, last_attempt: &DeliveryAttempt) {
        warn!(
            webhook_id = %task.webhook_id,
            delivery_id = %task.delivery_id,
            attempts = task.retry_count + 1,
            "delivery exhausted retries, dead-lettering"
        );
        let _ = self
            .store
            .append(
                RecordKind::DeadLetter,
                json!({
                    "delivery_id": task.delivery_id,
                    "webhook_id": task.webhook_id,
                    "event_type": task.event_type.as_str(),
                    "payload": task.payload,
                    "attempts": task.retry_count + 1,
                    "last_response_code": last_attempt.response_code,
                    "last_error": last_attempt.error_message,
                    "parked_at": Utc::now().to_rfc3339(),
                }),
            )
            .await;
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) {
        match serde_json::to_value(attempt) {
            Ok(body) => {
                if let Err(e) = self.store.append(RecordKind::DeliveryAttempt, body).await {
                    error!(error = %e, "failed to persist delivery attempt");
                }
            }
            Err(e) => error!(error = %e, "failed to encode delivery attempt"),
        }
    }

    async fn record_cancelled(&self, task: &DeliveryTask) {
        let attempt = DeliveryAttempt {
            attempt_id: Uuid::new_v4().to_string(),
            webhook_id: task.webhook_id.clone(),
            delivery_id: task.delivery_id.clone(),
            endpoint_url: self
                .endpoint(&task.webhook_id)
                .map(|e| e.url)
                .unwrap_or_default(),
            event_type: task.event_type,
            payload: task.payload.clone(),
            timestamp: Utc::now(),
            success: false,
            response_code: None,
            response_body: None,
            error_message: Some("cancelled by shutdown".to_string()),
            duration_ms: 0,
            retry_count: task.retry_count,
        };
        self.record_attempt(&attempt).await;
    }

    /// Terminal-outcome counter update for one delivery chain.
    async fn finalize(&self, webhook_id: &str, success: bool) {
        let snapshot = {
            let Some(mut entry) = self.endpoints.get_mut(webhook_id) else { return };
            entry.total_deliveries += 1;
            if success {
                entry.successful_deliveries += 1;
            } else {
                entry.failed_deliveries += 1;
            }
            entry.clone()
        };
        let record_id = self.endpoint_record_ids.get(webhook_id).map(|r| *r);
        if let Some(record_id) = record_id {
            let _ = self
                .store
                .update(
                    RecordKind::Webhook,
                    record_id,
                    json!({
                        "total_deliveries": snapshot.total_deliveries,
                        "successful_deliveries": snapshot.successful_deliveries,
                        "failed_deliveries": snapshot.failed_deliveries,
                        "last_delivery_at": snapshot.last_delivery_at,
                    }),
                )
                .await;
        }
    }

    //─────────────────────────────
    //  Metrics and stats
    //─────────────────────────────

    /// Aggregate the trailing hour of attempts into per-endpoint metrics.
    pub async fn aggregate_metrics(&self) -> Result<usize, WebhookError> {
        let since = Utc::now() - chrono::Duration::hours(1);
        let filter = RecordFilter { since: Some(since), ..Default::default() };
        let attempts = self.store.query(RecordKind::DeliveryAttempt, &filter).await?;

        let mut per_webhook: std::collections::BTreeMap<String, (u64, u64, u64)> =
            Default::default();
        for record in &attempts {
            let Some(webhook_id) = record.body.get("webhook_id").and_then(Value::as_str) else {
                continue;
            };
            let entry = per_webhook.entry(webhook_id.to_string()).or_default();
            entry.0 += 1;
            if record.body.get("success").and_then(Value::as_bool).unwrap_or(false) {
                entry.1 += 1;
            }
            entry.2 += record.body.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
        }

        let mut written = 0;
        for (webhook_id, (total, successes, duration_sum)) in per_webhook {
            let metric = json!({
                "webhook_id": webhook_id,
                "timestamp": Utc::now().to_rfc3339(),
                "avg_delivery_ms": if total > 0 { duration_sum / total } else { 0 },
                "success_rate": if total > 0 { successes as f64 / total as f64 } else { 0.0 },
                "error_rate": if total > 0 { (total - successes) as f64 / total as f64 } else { 0.0 },
                "throughput": total as f64 / 3600.0,
            });
            self.store.append(RecordKind::WebhookMetric, metric).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Endpoint stats plus its recent metric records.
    pub async fn stats(&self, webhook_id: &str) -> Result<Value, WebhookError> {
        let endpoint = self
            .endpoint(webhook_id)
            .ok_or_else(|| WebhookError::UnknownWebhook(webhook_id.to_string()))?;
        let metrics = self
            .store
            .query(RecordKind::WebhookMetric, &RecordFilter::default())
            .await?
            .into_iter()
            .filter(|record| {
                record.body.get("webhook_id").and_then(Value::as_str) == Some(webhook_id)
            })
            .take(24)
            .map(|record| record.body)
            .collect::<Vec<_>>();

        let mut stats = serde_json::to_value(&endpoint)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if let Value::Object(map) = &mut stats {
            // The secret never leaves the manager.
            map.remove("secret");
            map.insert("recent_metrics".to_string(), Value::Array(metrics));
        }
        Ok(stats)
    }

    //─────────────────────────────
    //  Shutdown
    //─────────────────────────────

    /// Stop ingress, drain queues up to the grace period, then cancel
    /// remaining work. In-flight deliveries beyond the grace period are
    /// recorded as cancelled attempts.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;

        loop {
            let drained = self.delivery_tx.capacity() == self.delivery_tx.max_capacity()
                && self.retry_tx.capacity() == self.retry_tx.max_capacity();
            if drained || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.shutdown.cancel();
        let handles: Vec<_> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
        info!("webhook manager stopped");
    }
}

fn truncate(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store_memory::MemoryStore;
    use std::collections::HashSet;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn test_config() -> WebhookConfig {
        WebhookConfig {
            workers: 2,
            queue_capacity: 64,
            retry: RetryConfig {
                max_retries: 5,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter: false,
            },
            timeouts: TimeoutConfig {
                connect: Duration::from_secs(2),
                read: Duration::from_secs(2),
                total: Duration::from_secs(4),
            },
            metrics_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    async fn wait_for<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    async fn attempts(store: &MemoryStore) -> Vec<Value> {
        store
            .scan(RecordKind::DeliveryAttempt, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.body)
            .collect()
    }

    #[tokio::test]
    async fn test_delivery_with_signature_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("X-Webhook-ID"))
            .and(header_exists("X-Event-Type"))
            .and(header_exists("X-Delivery-ID"))
            .and(header_exists("X-Timestamp"))
            .and(header_exists("X-Signature-SHA256"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store.clone(), test_config());
        manager.start().await;
        manager
            .register(
                "w1".to_string(),
                format!("{}/hook", server.uri()),
                EventFilter::Only(vec![WebhookEventType::TaskLifecycle]),
                Some("super-secret-value".to_string()),
                true,
            )
            .await
            .unwrap();

        let payload = json!({"task_id": "t1", "status": "completed"});
        let queued = manager
            .send(WebhookEventType::TaskLifecycle, payload.clone(), None)
            .unwrap();
        assert_eq!(queued, 1);

        let manager_ref = manager.clone();
        wait_for(move || manager_ref.endpoint("w1").unwrap().successful_deliveries == 1).await;

        // Verify the received body signature against the shared secret.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let request: &Request = &requests[0];
        let signature = request
            .headers
            .get("X-Signature-SHA256")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let received: Value = serde_json::from_slice(&request.body).unwrap();
        assert!(verify_signature("super-secret-value", &received, &signature));
        assert_eq!(received, payload);

        let history = attempts(&store).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["success"], true);
        assert_eq!(history[0]["response_code"], 200);
    }

    #[tokio::test]
    async fn test_event_type_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store, test_config());
        manager.start().await;
        manager
            .register(
                "lifecycle-only".to_string(),
                server.uri(),
                EventFilter::Only(vec![WebhookEventType::TaskLifecycle]),
                None,
                true,
            )
            .await
            .unwrap();

        let queued = manager
            .send(WebhookEventType::SystemEvent, json!({"n": 1}), None)
            .unwrap();
        assert_eq!(queued, 0);

        let queued = manager
            .send(WebhookEventType::TaskLifecycle, json!({"n": 2}), None)
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn test_retry_then_succeed_records_all_attempts() {
        let server = MockServer::start().await;
        // Two 502s, then 200s.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(2)
            .mount(&server)
            .await;

        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store.clone(), test_config());
        manager.start().await;
        manager
            .register("w1".to_string(), server.uri(), EventFilter::All, None, true)
            .await
            .unwrap();

        manager
            .send(WebhookEventType::TaskLifecycle, json!({"retry": "chain"}), None)
            .unwrap();

        let manager_ref = manager.clone();
        wait_for(move || manager_ref.endpoint("w1").unwrap().total_deliveries == 1).await;

        let endpoint = manager.endpoint("w1").unwrap();
        assert_eq!(endpoint.successful_deliveries, 1);
        assert_eq!(endpoint.failed_deliveries, 0);

        let history = attempts(&store).await;
        assert_eq!(history.len(), 3);
        // Same delivery chain, distinct attempt ids.
        let delivery_ids: HashSet<&str> =
            history.iter().map(|a| a["delivery_id"].as_str().unwrap()).collect();
        assert_eq!(delivery_ids.len(), 1);
        let attempt_ids: HashSet<&str> =
            history.iter().map(|a| a["attempt_id"].as_str().unwrap()).collect();
        assert_eq!(attempt_ids.len(), 3);
        assert_eq!(history[0]["retry_count"], 0);
        assert_eq!(history[2]["retry_count"], 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.retry.max_retries = 2;
        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store.clone(), config);
        manager.start().await;
        manager
            .register("w1".to_string(), server.uri(), EventFilter::All, None, true)
            .await
            .unwrap();

        manager
            .send(WebhookEventType::ErrorEvent, json!({"boom": true}), None)
            .unwrap();

        let manager_ref = manager.clone();
        wait_for(move || manager_ref.endpoint("w1").unwrap().failed_deliveries == 1).await;

        let endpoint = manager.endpoint("w1").unwrap();
        assert_eq!(endpoint.total_deliveries, 1);
        assert_eq!(endpoint.successful_deliveries, 0);

        // max_retries + 1 attempts, one dead letter.
        assert_eq!(attempts(&store).await.len(), 3);
        let dead = store.scan(RecordKind::DeadLetter, 0).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body["attempts"], 3);
    }

    #[tokio::test]
    async fn test_gone_disables_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store, test_config());
        manager.start().await;
        manager
            .register("w1".to_string(), server.uri(), EventFilter::All, None, true)
            .await
            .unwrap();

        manager
            .send(WebhookEventType::TaskLifecycle, json!({"n": 1}), None)
            .unwrap();

        let manager_ref = manager.clone();
        wait_for(move || !manager_ref.endpoint("w1").unwrap().active).await;
        assert_eq!(manager.endpoint("w1").unwrap().failed_deliveries, 1);
    }

    #[tokio::test]
    async fn test_backpressure_when_queue_full() {
        let mut config = test_config();
        config.queue_capacity = 1;
        let store = MemoryStore::shared();
        // Workers intentionally not started, so the queue cannot drain.
        let manager = WebhookManager::new(store, config);
        manager
            .register("w1".to_string(), "http://127.0.0.1:9/hook".to_string(), EventFilter::All, None, true)
            .await
            .unwrap();

        manager
            .send(WebhookEventType::TaskLifecycle, json!({"n": 1}), None)
            .unwrap();
        let err = manager
            .send(WebhookEventType::TaskLifecycle, json!({"n": 2}), None)
            .unwrap_err();
        assert!(matches!(err, WebhookError::Backpressure));
    }

    #[tokio::test]
    async fn test_targeted_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store, test_config());
        manager.start().await;
        for id in ["w1", "w2"] {
            manager
                .register(id.to_string(), server.uri(), EventFilter::All, None, true)
                .await
                .unwrap();
        }

        let queued = manager
            .send(
                WebhookEventType::TaskLifecycle,
                json!({"n": 1}),
                Some(&["w2".to_string()]),
            )
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn test_metrics_aggregation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store.clone(), test_config());
        manager.start().await;
        manager
            .register("w1".to_string(), server.uri(), EventFilter::All, None, true)
            .await
            .unwrap();
        manager
            .send(WebhookEventType::TaskLifecycle, json!({"n": 1}), None)
            .unwrap();

        let manager_ref = manager.clone();
        wait_for(move || manager_ref.endpoint("w1").unwrap().successful_deliveries == 1).await;

        let written = manager.aggregate_metrics().await.unwrap();
        assert_eq!(written, 1);

        let stats = manager.stats("w1").await.unwrap();
        assert_eq!(stats["successful_deliveries"], 1);
        assert!(stats.get("secret").is_none());
        let metrics = stats["recent_metrics"].as_array().unwrap();
        assert_eq!(metrics.len(), 1);
        assert!((metrics[0]["success_rate"].as_f64().unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_registration_payload_validation() {
        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store, test_config());

        let err = manager
            .register_from_payload(&json!({"webhook_id": "w1", "url": "not-a-url"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Validation(_)));

        let endpoint = manager
            .register_from_payload(&json!({
                "webhook_id": "w1",
                "url": "https://example.test/hook",
                "secret": "0123456789abcdef",
                "event_types": ["task_lifecycle", "agent_status"]
            }))
            .await
            .unwrap();
        assert_eq!(
            endpoint.event_types,
            EventFilter::Only(vec![
                WebhookEventType::TaskLifecycle,
                WebhookEventType::AgentStatus
            ])
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_sends() {
        let store = MemoryStore::shared();
        let manager = WebhookManager::new(store, test_config());
        manager.start().await;
        manager.shutdown().await;

        let err = manager
            .send(WebhookEventType::TaskLifecycle, json!({}), None)
            .unwrap_err();
        assert!(matches!(err, WebhookError::Backpressure));
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(retry.delay_for(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for(3), Duration::from_secs(4));
        // Capped at max_delay.
        assert_eq!(retry.delay_for(20), Duration::from_secs(300));

        let jittered = RetryConfig { jitter: true, ..retry };
        for attempt in 1..=5 {
            let delay = jittered.delay_for(attempt);
            let base = Duration::from_secs(1 << (attempt - 1));
            assert!(delay >= base / 2);
            assert!(delay <= Duration::from_secs(300));
        }
    }
}
