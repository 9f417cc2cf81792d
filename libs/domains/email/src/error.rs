//! Error types for the email domain.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Result type for email operations.
pub type EmailResult<T> = Result<T, EmailError>;

/// Errors that can occur in the email delivery pipeline.
#[derive(Debug, Error)]
pub enum EmailError {
    /// Bad input. Synchronous, never retried.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Recipient has an active unsubscribe record.
    #[error("Recipient is unsubscribed: {0}")]
    Suppressed(String),

    /// Template missing or failed to render.
    #[error("Template error: {0}")]
    Template(String),

    /// Provider rejected or failed a send. Retryable up to max attempts.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No active provider passed config validation.
    #[error("No email provider available")]
    NoProviderAvailable,

    /// Ephemeral queue lane error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Relational store error.
    #[error("Database error: {0}")]
    Database(String),

    /// A webhook payload or event could not be parsed.
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Message not found.
    #[error("Email message not found: {0}")]
    NotFound(Uuid),

    /// Requested status change violates the state machine.
    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EmailError {
    /// Whether the processor should consume an attempt and re-arm the
    /// message. Configuration problems are retryable on the normal cadence
    /// since config may be fixed before the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmailError::Provider(_)
                | EmailError::Configuration(_)
                | EmailError::NoProviderAvailable
        )
    }
}

impl From<redis::RedisError> for EmailError {
    fn from(err: redis::RedisError) -> Self {
        EmailError::Queue(err.to_string())
    }
}

impl From<sea_orm::DbErr> for EmailError {
    fn from(err: sea_orm::DbErr) -> Self {
        EmailError::Database(err.to_string())
    }
}

impl From<handlebars::RenderError> for EmailError {
    fn from(err: handlebars::RenderError) -> Self {
        EmailError::Template(err.to_string())
    }
}

impl From<reqwest::Error> for EmailError {
    fn from(err: reqwest::Error) -> Self {
        EmailError::Provider(err.to_string())
    }
}

impl From<serde_json::Error> for EmailError {
    fn from(err: serde_json::Error) -> Self {
        EmailError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl IntoResponse for EmailError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            EmailError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            EmailError::Suppressed(email) => (
                StatusCode::BAD_REQUEST,
                "recipient_unsubscribed",
                format!("Recipient '{}' has unsubscribed", email),
            ),
            EmailError::Template(msg) => {
                (StatusCode::BAD_REQUEST, "template_error", msg.clone())
            }
            EmailError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Email message {} not found", id),
            ),
            EmailError::InvalidTransition { from, to } => (
                StatusCode::CONFLICT,
                "invalid_transition",
                format!("Cannot move message from '{}' to '{}'", from, to),
            ),
            EmailError::WebhookParse(msg) => {
                (StatusCode::BAD_REQUEST, "webhook_parse_error", msg.clone())
            }
            EmailError::Provider(msg) => {
                tracing::error!("Provider error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "provider_error",
                    "Email provider rejected the send".to_string(),
                )
            }
            EmailError::NoProviderAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no_provider_available",
                "No email provider is currently available".to_string(),
            ),
            EmailError::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "configuration_error",
                    "Email provider configuration error".to_string(),
                )
            }
            EmailError::Queue(msg) | EmailError::Database(msg) | EmailError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "error": {
                    "type": error_type,
                    "message": message
                }
            })),
        )
            .into_response()
    }
}
