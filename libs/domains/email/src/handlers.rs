use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EmailResult;
use crate::models::{EmailMessage, ImmediateSendResult, QueueStats, SendRequest};
use crate::service::EmailService;
use crate::tracker::{StatusTracker, WebhookOutcome};

/// Shared state for the email router.
#[derive(Clone)]
pub struct EmailState {
    pub service: Arc<EmailService>,
    pub tracker: Arc<StatusTracker>,
}

/// Create the email router with all HTTP endpoints
pub fn router(service: Arc<EmailService>, tracker: Arc<StatusTracker>) -> Router {
    let state = EmailState { service, tracker };

    Router::new()
        .route("/send", post(send))
        .route("/send-immediate", post(send_immediate))
        .route("/status/{id}", get(status))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/{id}/cancel", post(cancel))
        .route("/queue/{id}/retry", post(retry))
        .route("/webhooks/{provider}", post(webhook))
        .with_state(state)
}

/// Subset of the log record returned by the mutation endpoints.
#[derive(Debug, Serialize)]
struct MessageResponse {
    id: Uuid,
    status: String,
    attempts: u32,
    provider: Option<String>,
}

impl From<&EmailMessage> for MessageResponse {
    fn from(message: &EmailMessage) -> Self {
        Self {
            id: message.id,
            status: message.status.to_string(),
            attempts: message.attempts,
            provider: message.provider.clone(),
        }
    }
}

/// Queue an email for delivery
///
/// POST /email/send
async fn send(
    State(state): State<EmailState>,
    Json(request): Json<SendRequest>,
) -> EmailResult<impl IntoResponse> {
    let message = state.service.send(request).await?;
    Ok((StatusCode::ACCEPTED, Json(MessageResponse::from(&message))))
}

/// Send synchronously, bypassing the queue
///
/// POST /email/send-immediate
async fn send_immediate(
    State(state): State<EmailState>,
    Json(request): Json<SendRequest>,
) -> EmailResult<Json<ImmediateSendResult>> {
    let result = state.service.send_immediate(request).await?;
    Ok(Json(result))
}

/// Full delivery status for a message
///
/// GET /email/status/:id
async fn status(
    State(state): State<EmailState>,
    Path(id): Path<Uuid>,
) -> EmailResult<Json<EmailMessage>> {
    let message = state.service.status(id).await?;
    Ok(Json(message))
}

/// Queue depth per status plus the ephemeral lane depth
///
/// GET /email/queue/stats
async fn queue_stats(State(state): State<EmailState>) -> EmailResult<Json<QueueStats>> {
    let stats = state.service.queue_stats().await?;
    Ok(Json(stats))
}

/// Cancel a pending message
///
/// POST /email/queue/:id/cancel
async fn cancel(
    State(state): State<EmailState>,
    Path(id): Path<Uuid>,
) -> EmailResult<Json<MessageResponse>> {
    let message = state.service.cancel(id).await?;
    Ok(Json(MessageResponse::from(&message)))
}

/// Re-queue a failed message
///
/// POST /email/queue/:id/retry
async fn retry(
    State(state): State<EmailState>,
    Path(id): Path<Uuid>,
) -> EmailResult<Json<MessageResponse>> {
    let message = state.service.retry(id).await?;
    Ok(Json(MessageResponse::from(&message)))
}

/// Ingest a provider webhook
///
/// POST /email/webhooks/:provider
async fn webhook(
    State(state): State<EmailState>,
    Path(provider): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> EmailResult<Json<WebhookOutcome>> {
    let outcome = state.tracker.handle_webhook(&provider, &payload).await?;
    Ok(Json(outcome))
}
