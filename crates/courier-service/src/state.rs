//! Composition root: builds every component and hands out shared state.
//!
//! There are no process-wide singletons; the service constructs one
//! [`AppState`] and threads it through the router. Components receive their
//! collaborators explicitly.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{info, warn};

use courier_audit::{AuditConfig, AuditLogger};
use courier_engine::ExecutionEngine;
use courier_endtask::EndTaskManager;
use courier_notify::{NotificationProtocol, SystemAlertHandler, TaskProgressHandler};
use courier_registry::{builtin_adapter_ids, ActionRegistry, AdapterRegistry};
use courier_security::SecurityManager;
use courier_store_core::EventStore;
use courier_webhook::{RetryConfig, WebhookConfig, WebhookManager};

use crate::config::ServiceConfig;
use crate::tasks::TaskLedger;

/// Shared handles for the HTTP and WebSocket surface.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration
    pub config: Arc<ServiceConfig>,
    /// The event store
    pub store: Arc<dyn EventStore>,
    /// Audit logger
    pub audit: Arc<AuditLogger>,
    /// Security manager
    pub security: Arc<SecurityManager>,
    /// Action registry
    pub registry: Arc<ActionRegistry>,
    /// Execution engine
    pub engine: Arc<ExecutionEngine>,
    /// Notification protocol
    pub notify: Arc<NotificationProtocol>,
    /// Webhook manager
    pub webhooks: Arc<WebhookManager>,
    /// End-task manager
    pub endtask: Arc<EndTaskManager>,
    /// Task dispatch ledger
    pub tasks: Arc<TaskLedger>,
    /// Service start time
    pub started_at: Instant,
}

impl AppState {
    /// Build the full component graph over `store`.
    pub async fn build(config: ServiceConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        let audit = AuditLogger::new(
            store.clone(),
            config.audit_file.clone(),
            AuditConfig::default(),
        )
        .await?;

        let security =
            Arc::new(SecurityManager::new(store.clone()).with_defaults().with_audit(audit.clone()));
        let registry = Arc::new(ActionRegistry::builtin());

        // Every adapter family resolves; credentialless families run the
        // deterministic mock.
        let adapters = Arc::new(AdapterRegistry::with_mocks(&builtin_adapter_ids()));
        let configured = config.credentials.configured();
        for id in builtin_adapter_ids() {
            if configured.contains(&id) {
                info!(adapter = id, "credentials configured");
            } else {
                warn!(adapter = id, "no credentials configured, using mock adapter");
            }
        }

        let engine = Arc::new(ExecutionEngine::new(
            security.clone(),
            registry.clone(),
            adapters,
            audit.clone(),
        ));

        let progress = Arc::new(TaskProgressHandler::new());
        let notify = Arc::new({
            let protocol = NotificationProtocol::new(config.system_id.clone(), store.clone());
            protocol.register_handler(progress.clone());
            protocol.register_handler(Arc::new(SystemAlertHandler));
            protocol
        });

        let webhooks = WebhookManager::new(
            store.clone(),
            WebhookConfig {
                workers: config.webhook_workers,
                queue_capacity: config.webhook_queue_capacity,
                retry: RetryConfig {
                    max_retries: config.webhook_max_retries,
                    ..RetryConfig::default()
                },
                shutdown_grace: config.shutdown_grace,
                ..WebhookConfig::default()
            },
        );
        webhooks.start().await;

        let endtask = Arc::new(EndTaskManager::new(
            store.clone(),
            webhooks.clone(),
            notify.clone(),
        ));

        // Periodic maintenance: retention pruning and approval expiry.
        {
            let store = store.clone();
            let security = security.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match store.prune(chrono::Utc::now()).await {
                        Ok(removed) if removed > 0 => info!(removed, "pruned expired records"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "store prune failed"),
                    }
                    let swept = security.sweep_expired_approvals().await;
                    if swept > 0 {
                        info!(swept, "expired pending approvals");
                    }
                }
            });
        }

        Ok(Self {
            config: Arc::new(config),
            store,
            audit,
            security,
            registry,
            engine,
            notify,
            webhooks,
            endtask,
            tasks: Arc::new(TaskLedger::new(progress)),
            started_at: Instant::now(),
        })
    }

    /// Orderly shutdown: stop ingress, drain queues, flush audit sinks,
    /// close the store, cancel remaining executions. Best-effort, logged.
    pub async fn shutdown(&self) {
        info!("shutting down: stopping ingress and draining queues");
        self.notify.shutdown();
        self.webhooks.shutdown().await;

        info!("shutting down: flushing audit sinks");
        self.audit.shutdown().await;

        info!("shutting down: closing event store");
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "event store close failed");
        }

        info!("shutting down: cancelling remaining executions");
        self.engine.cancel_all();
    }
}
