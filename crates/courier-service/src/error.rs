//! Structured API error responses.
//!
//! Every failure surfaces as `{error_kind, message, path?}` with the status
//! the contract prescribes: 400 for validation, 403 for permission and
//! approval gates, 404 for missing resources, 429 for rate limits, and 503
//! with `Retry-After` for transient conditions.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use courier_engine::EngineError;
use courier_notify::NotifyError;
use courier_registry::AdapterError;
use courier_schema::SchemaViolation;
use courier_security::SecurityError;
use courier_store_core::StoreError;
use courier_webhook::WebhookError;

/// API-facing error with a structured body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    path: Option<String>,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self { status, kind, message: message.into(), path: None, retry_after: None }
    }

    /// 404 with the given message.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 400 for a malformed request outside schema validation.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error_kind": self.kind,
            "message": self.message,
            "path": self.path,
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<SchemaViolation> for ApiError {
    fn from(violation: SchemaViolation) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation_error",
            message: violation.message.clone(),
            path: Some(violation.path),
            retry_after: None,
        }
    }
}

impl From<SecurityError> for ApiError {
    fn from(error: SecurityError) -> Self {
        match error {
            SecurityError::ApprovalRequired(_) => {
                Self::new(StatusCode::FORBIDDEN, "approval_required", error.to_string())
            }
            SecurityError::RateLimited { retry_after_secs } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                kind: "rate_limited",
                message: error.to_string(),
                path: None,
                retry_after: Some(retry_after_secs.max(1) as u64),
            },
            SecurityError::DangerousInput { ref path, .. } => Self {
                status: StatusCode::BAD_REQUEST,
                kind: "validation_error",
                message: error.to_string(),
                path: Some(path.clone()),
                retry_after: None,
            },
            SecurityError::UnknownApproval(_) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", error.to_string())
            }
            _ => Self::new(StatusCode::FORBIDDEN, "permission_denied", error.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::UnknownAction(_) | EngineError::UnknownExecution(_) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", error.to_string())
            }
            EngineError::Validation(violation) => violation.into(),
            EngineError::Security(inner) => inner.into(),
            EngineError::RateLimited { retry_after_secs, .. } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                kind: "rate_limited",
                message: error.to_string(),
                path: None,
                retry_after: Some(retry_after_secs.max(1) as u64),
            },
            EngineError::Adapter(AdapterError::Unavailable(_)) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                kind: "adapter_unavailable",
                message: error.to_string(),
                path: None,
                retry_after: Some(30),
            },
            EngineError::Adapter(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "adapter_error", error.to_string())
            }
            EngineError::Timeout { .. } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                kind: "timeout",
                message: error.to_string(),
                path: None,
                retry_after: Some(30),
            },
            EngineError::Cancelled => {
                Self::new(StatusCode::CONFLICT, "cancelled", error.to_string())
            }
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(error: WebhookError) -> Self {
        match error {
            WebhookError::Validation(violation) => violation.into(),
            WebhookError::Backpressure => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                kind: "backpressure",
                message: error.to_string(),
                path: None,
                retry_after: Some(5),
            },
            WebhookError::UnknownWebhook(_) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", error.to_string())
            }
            WebhookError::Store(inner) => inner.into(),
        }
    }
}

impl From<NotifyError> for ApiError {
    fn from(error: NotifyError) -> Self {
        match error {
            NotifyError::Malformed(message) => {
                Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
            }
            NotifyError::Store(inner) => inner.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: "store_unavailable",
            message: error.to_string(),
            path: None,
            retry_after: Some(10),
        }
    }
}

impl From<courier_endtask::EndTaskError> for ApiError {
    fn from(error: courier_endtask::EndTaskError) -> Self {
        match error {
            courier_endtask::EndTaskError::Store(inner) => inner.into(),
        }
    }
}

impl From<courier_audit::AuditError> for ApiError {
    fn from(error: courier_audit::AuditError) -> Self {
        match error {
            courier_audit::AuditError::UnsupportedFormat(_) => {
                Self::new(StatusCode::BAD_REQUEST, "validation_error", error.to_string())
            }
            _ => Self::new(StatusCode::SERVICE_UNAVAILABLE, "sink_unavailable", error.to_string()),
        }
    }
}
