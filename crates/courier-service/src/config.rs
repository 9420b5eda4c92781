//! Typed environment configuration.
//!
//! Credentials are optional by design: an adapter whose credentials are
//! absent degrades to the deterministic mock so the substrate stays fully
//! exercisable in development and tests.

use std::time::Duration;

use anyhow::{Context, Result};

/// Which store driver backs the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Non-persistent in-memory store
    Memory,
    /// Append-only JSON-lines log at the given path
    Jsonl(String),
}

/// Credentials for one adapter family; `None` means mock.
#[derive(Debug, Clone, Default)]
pub struct AdapterCredentials {
    /// SMTP relay host for the email adapter
    pub smtp_host: Option<String>,
    /// Bot token for the chat adapter
    pub chat_bot_token: Option<String>,
    /// Base URL of the issue tracker
    pub issue_tracker_url: Option<String>,
    /// API token of the issue tracker
    pub issue_tracker_token: Option<String>,
    /// Monitoring system API key
    pub monitoring_api_key: Option<String>,
}

impl AdapterCredentials {
    /// Adapter identifiers that have credentials configured.
    pub fn configured(&self) -> Vec<&'static str> {
        let mut ids = Vec::new();
        if self.smtp_host.is_some() {
            ids.push("email");
        }
        if self.chat_bot_token.is_some() {
            ids.push("chat");
        }
        if self.issue_tracker_url.is_some() && self.issue_tracker_token.is_some() {
            ids.push("ticket");
        }
        if self.monitoring_api_key.is_some() {
            ids.push("monitoring");
        }
        ids
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// System identifier used as notification source
    pub system_id: String,
    /// Store driver selection
    pub store: StoreBackend,
    /// Audit file sink path
    pub audit_file: String,
    /// Parallel webhook delivery workers
    pub webhook_workers: usize,
    /// Bounded webhook queue capacity
    pub webhook_queue_capacity: usize,
    /// Webhook retry budget
    pub webhook_max_retries: u32,
    /// Shutdown drain budget
    pub shutdown_grace: Duration,
    /// Adapter credentials
    pub credentials: AdapterCredentials,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            system_id: "courier".to_string(),
            store: StoreBackend::Memory,
            audit_file: "data/audit.jsonl".to_string(),
            webhook_workers: 4,
            webhook_queue_capacity: 1024,
            webhook_max_retries: 5,
            shutdown_grace: Duration::from_secs(15),
            credentials: AdapterCredentials::default(),
        }
    }
}

impl ServiceConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let store = match std::env::var("COURIER_STORE").as_deref() {
            Ok("memory") | Err(_) => StoreBackend::Memory,
            Ok("jsonl") => {
                let path = std::env::var("COURIER_STORE_PATH")
                    .unwrap_or_else(|_| "data/store.jsonl".to_string());
                StoreBackend::Jsonl(path)
            }
            Ok(other) => anyhow::bail!("unsupported COURIER_STORE backend `{other}`"),
        };

        let parse_usize = |name: &str, default: usize| -> Result<usize> {
            match std::env::var(name) {
                Ok(raw) => raw.parse().with_context(|| format!("{name} must be an integer")),
                Err(_) => Ok(default),
            }
        };
        let parse_u32 = |name: &str, default: u32| -> Result<u32> {
            match std::env::var(name) {
                Ok(raw) => raw.parse().with_context(|| format!("{name} must be an integer")),
                Err(_) => Ok(default),
            }
        };

        Ok(Self {
            system_id: std::env::var("COURIER_SYSTEM_ID")
                .unwrap_or_else(|_| defaults.system_id.clone()),
            store,
            audit_file: std::env::var("COURIER_AUDIT_FILE")
                .unwrap_or_else(|_| defaults.audit_file.clone()),
            webhook_workers: parse_usize("COURIER_WEBHOOK_WORKERS", defaults.webhook_workers)?,
            webhook_queue_capacity: parse_usize(
                "COURIER_WEBHOOK_QUEUE",
                defaults.webhook_queue_capacity,
            )?,
            webhook_max_retries: parse_u32(
                "COURIER_WEBHOOK_MAX_RETRIES",
                defaults.webhook_max_retries,
            )?,
            shutdown_grace: Duration::from_secs(u64::from(parse_u32(
                "COURIER_SHUTDOWN_GRACE_SECS",
                15,
            )?)),
            credentials: AdapterCredentials {
                smtp_host: std::env::var("COURIER_SMTP_HOST").ok(),
                chat_bot_token: std::env::var("COURIER_CHAT_BOT_TOKEN").ok(),
                issue_tracker_url: std::env::var("COURIER_ISSUE_TRACKER_URL").ok(),
                issue_tracker_token: std::env::var("COURIER_ISSUE_TRACKER_TOKEN").ok(),
                monitoring_api_key: std::env::var("COURIER_MONITORING_API_KEY").ok(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.webhook_max_retries, 5);
        assert!(config.credentials.configured().is_empty());
    }

    #[test]
    fn test_configured_adapters() {
        let credentials = AdapterCredentials {
            smtp_host: Some("smtp.example.test".to_string()),
            issue_tracker_url: Some("https://issues.example.test".to_string()),
            // Token missing, so the ticket adapter stays mocked.
            ..Default::default()
        };
        assert_eq!(credentials.configured(), vec!["email"]);
    }
}
