//! Email service: intake, rendering, and the operations exposed over HTTP.
//!
//! `send` is the asynchronous path: validate, render, persist a log record,
//! arm the durable queue, and nudge the ephemeral lane. `send_immediate`
//! bypasses the queue entirely and reports the provider outcome inline.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::error::{EmailError, EmailResult};
use crate::gateway::ProviderGateway;
use crate::lane::EphemeralLane;
use crate::models::{
    AnalyticsCounter, AnalyticsKey, EmailMessage, EmailStatus, ImmediateSendResult, QueueItem,
    QueueStats, SendRequest, DEFAULT_MAX_ATTEMPTS,
};
use crate::repository::{
    AnalyticsRepository, EmailLogRepository, QueueRepository, UnsubscribeRepository,
};
use crate::templates::TemplateRenderer;

/// Service-level configuration.
#[derive(Debug, Clone)]
pub struct EmailServiceConfig {
    /// Sender address used when a request carries none.
    pub default_from: String,
    /// Attempt budget for queued messages.
    pub max_attempts: u32,
}

impl Default for EmailServiceConfig {
    fn default() -> Self {
        Self {
            default_from: std::env::var("EMAIL_DEFAULT_FROM")
                .unwrap_or_else(|_| "noreply@localhost".to_string()),
            max_attempts: std::env::var("EMAIL_MAX_ATTEMPTS")
                .unwrap_or_default()
                .parse()
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

pub struct EmailService {
    logs: Arc<dyn EmailLogRepository>,
    queue: Arc<dyn QueueRepository>,
    lane: Arc<dyn EphemeralLane>,
    unsubscribes: Arc<dyn UnsubscribeRepository>,
    analytics: Arc<dyn AnalyticsRepository>,
    gateway: Arc<ProviderGateway>,
    renderer: Arc<TemplateRenderer>,
    config: EmailServiceConfig,
}

impl EmailService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logs: Arc<dyn EmailLogRepository>,
        queue: Arc<dyn QueueRepository>,
        lane: Arc<dyn EphemeralLane>,
        unsubscribes: Arc<dyn UnsubscribeRepository>,
        analytics: Arc<dyn AnalyticsRepository>,
        gateway: Arc<ProviderGateway>,
        renderer: Arc<TemplateRenderer>,
        config: EmailServiceConfig,
    ) -> Self {
        Self {
            logs,
            queue,
            lane,
            unsubscribes,
            analytics,
            gateway,
            renderer,
            config,
        }
    }

    /// Queue an email for asynchronous delivery.
    ///
    /// Returns the log record in `Pending` status. Scheduled messages become
    /// due at `scheduled_at`; everything else is due immediately and the
    /// ephemeral lane is nudged for fast pickup.
    #[instrument(skip(self, request), fields(template_id = %request.template_id))]
    pub async fn send(&self, request: SendRequest) -> EmailResult<EmailMessage> {
        self.validate(&request)?;
        self.check_suppression(&request).await?;

        let message = self.render_message(&request)?;
        let mut message = self.logs.create(message).await?;

        let due_at = request.scheduled_at.unwrap_or_else(Utc::now);
        self.queue
            .enqueue(QueueItem::pending(&message, due_at))
            .await?;

        message.status = EmailStatus::Pending;
        let message = self.logs.update(message).await?;

        if request.scheduled_at.is_none() {
            // Lane failures are non-fatal: the durable row is already armed.
            if let Err(e) = self.lane.push(message.id).await {
                warn!(email_id = %message.id, error = %e, "Failed to push to ephemeral lane");
            }
        }

        info!(
            email_id = %message.id,
            scheduled = request.scheduled_at.is_some(),
            "Email queued"
        );
        Ok(message)
    }

    /// Send synchronously, bypassing the queue. Provider failures are final:
    /// they are recorded on the log record and reported in the result, never
    /// retried.
    #[instrument(skip(self, request), fields(template_id = %request.template_id))]
    pub async fn send_immediate(&self, request: SendRequest) -> EmailResult<ImmediateSendResult> {
        self.validate(&request)?;
        self.check_suppression(&request).await?;

        let mut message = self.render_message(&request)?;
        message.status = EmailStatus::Processing;
        // Immediate sends get exactly one attempt.
        message.max_attempts = 1;
        let mut message = self.logs.create(message).await?;

        match self.gateway.send(&message).await {
            Ok(sent) => {
                let now = Utc::now();
                message.status = EmailStatus::Sent;
                message.sent_at = Some(now);
                message.attempts = 1;
                message.provider = Some(sent.provider.clone());
                message.provider_message_id = sent.receipt.message_id.clone();
                let message = self.logs.update(message).await?;

                let key = AnalyticsKey {
                    date: now.date_naive(),
                    provider: sent.provider.clone(),
                    template_type: message.template_id.clone(),
                };
                if let Err(e) = self.analytics.increment(key, AnalyticsCounter::Sent).await {
                    warn!(email_id = %message.id, error = %e, "Failed to record send analytics");
                }

                info!(email_id = %message.id, provider = %sent.provider, "Immediate send succeeded");
                Ok(ImmediateSendResult {
                    success: true,
                    email_log_id: message.id,
                    message_id: sent.receipt.message_id,
                    provider: Some(sent.provider),
                    error: None,
                })
            }
            Err(e) => {
                message.status = EmailStatus::Failed;
                message.attempts = 1;
                message.error_message = Some(e.to_string());
                let message = self.logs.update(message).await?;

                warn!(email_id = %message.id, error = %e, "Immediate send failed");
                Ok(ImmediateSendResult {
                    success: false,
                    email_log_id: message.id,
                    message_id: None,
                    provider: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Cancel a pending message. Only messages still waiting in the queue
    /// can be cancelled.
    pub async fn cancel(&self, id: uuid::Uuid) -> EmailResult<EmailMessage> {
        let mut message = self.logs.get(id).await?.ok_or(EmailError::NotFound(id))?;

        if !self.queue.cancel(id).await? {
            return Err(EmailError::InvalidTransition {
                from: message.status.to_string(),
                to: EmailStatus::Cancelled.to_string(),
            });
        }

        message.status = EmailStatus::Cancelled;
        let message = self.logs.update(message).await?;
        info!(email_id = %id, "Email cancelled");
        Ok(message)
    }

    /// Re-arm a failed message with a fresh attempt budget.
    pub async fn retry(&self, id: uuid::Uuid) -> EmailResult<EmailMessage> {
        let mut message = self.logs.get(id).await?.ok_or(EmailError::NotFound(id))?;

        if !self.queue.requeue(id, Utc::now()).await? {
            return Err(EmailError::InvalidTransition {
                from: message.status.to_string(),
                to: EmailStatus::Pending.to_string(),
            });
        }

        message.status = EmailStatus::Pending;
        message.attempts = 0;
        message.error_message = None;
        let message = self.logs.update(message).await?;

        if let Err(e) = self.lane.push(id).await {
            warn!(email_id = %id, error = %e, "Failed to push retry to ephemeral lane");
        }

        info!(email_id = %id, "Email re-queued for retry");
        Ok(message)
    }

    /// Fetch a message's delivery status.
    pub async fn status(&self, id: uuid::Uuid) -> EmailResult<EmailMessage> {
        self.logs.get(id).await?.ok_or(EmailError::NotFound(id))
    }

    /// Queue depth per status, plus the ephemeral lane depth.
    pub async fn queue_stats(&self) -> EmailResult<QueueStats> {
        let by_status = self.queue.counts().await?;
        let ephemeral_depth = self.lane.len().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read ephemeral lane depth");
            0
        });
        Ok(QueueStats {
            by_status,
            ephemeral_depth,
        })
    }

    fn validate(&self, request: &SendRequest) -> EmailResult<()> {
        if request.to.is_empty() {
            return Err(EmailError::Validation(
                "at least one recipient is required".to_string(),
            ));
        }
        for recipient in &request.to {
            if !is_plausible_email(recipient) {
                return Err(EmailError::Validation(format!(
                    "invalid recipient address '{}'",
                    recipient
                )));
            }
        }
        if request.template_id.trim().is_empty() {
            return Err(EmailError::Validation(
                "template_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn check_suppression(&self, request: &SendRequest) -> EmailResult<()> {
        for recipient in &request.to {
            if self.unsubscribes.find_by_email(recipient).await?.is_some() {
                return Err(EmailError::Suppressed(recipient.clone()));
            }
        }
        Ok(())
    }

    fn render_message(&self, request: &SendRequest) -> EmailResult<EmailMessage> {
        let rendered = self.renderer.render(
            &request.template_id,
            request.language.as_deref(),
            &request.variables,
        )?;
        let from_address = request
            .from
            .clone()
            .unwrap_or_else(|| self.config.default_from.clone());
        Ok(EmailMessage::new_queued(
            request,
            from_address,
            rendered.subject,
            rendered.html,
            rendered.text,
            self.config.max_attempts,
        ))
    }
}

/// Structural check only; real validation happens at the provider.
fn is_plausible_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && domain.contains('.') && !address.contains(' ')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::InMemoryLane;
    use crate::models::{Metadata, ProviderConfig, ProviderKind, UnsubscribeReason,
        UnsubscribeRecord};
    use crate::repository::{
        InMemoryAnalyticsRepository, InMemoryEmailLogRepository, InMemoryProviderRepository,
        InMemoryQueueRepository, InMemoryUnsubscribeRepository, ProviderRepository,
    };
    use serde_json::json;

    struct Fixture {
        service: EmailService,
        queue: Arc<InMemoryQueueRepository>,
        lane: Arc<InMemoryLane>,
        unsubscribes: Arc<InMemoryUnsubscribeRepository>,
    }

    async fn fixture(provider_fails: bool) -> Fixture {
        let logs = Arc::new(InMemoryEmailLogRepository::new());
        let queue = Arc::new(InMemoryQueueRepository::new());
        let lane = Arc::new(InMemoryLane::new());
        let unsubscribes = Arc::new(InMemoryUnsubscribeRepository::new());
        let analytics = Arc::new(InMemoryAnalyticsRepository::new());
        let providers = Arc::new(InMemoryProviderRepository::new());
        providers
            .upsert(ProviderConfig {
                name: "mock".to_string(),
                kind: ProviderKind::Mock,
                credentials: json!({"should_fail": provider_fails}),
                priority: 1,
                is_active: true,
            })
            .await
            .unwrap();
        let gateway = Arc::new(ProviderGateway::new(providers));
        let renderer = Arc::new(TemplateRenderer::new().unwrap());

        Fixture {
            service: EmailService::new(
                logs,
                queue.clone(),
                lane.clone(),
                unsubscribes.clone(),
                analytics,
                gateway,
                renderer,
                EmailServiceConfig {
                    default_from: "noreply@example.com".to_string(),
                    max_attempts: DEFAULT_MAX_ATTEMPTS,
                },
            ),
            queue,
            lane,
            unsubscribes,
        }
    }

    fn request(to: &str) -> SendRequest {
        SendRequest {
            to: vec![to.to_string()],
            template_id: "welcome".to_string(),
            variables: json!({"user_name": "Kim", "dashboard_url": "https://example.com"}),
            language: None,
            from: None,
            scheduled_at: None,
            priority: None,
            user_id: None,
            metadata: Metadata::default(),
        }
    }

    #[tokio::test]
    async fn test_send_queues_message() {
        let fx = fixture(false).await;
        let message = fx.service.send(request("user@example.com")).await.unwrap();

        assert_eq!(message.status, EmailStatus::Pending);
        assert!(message.subject.contains("Kim"));
        assert_eq!(message.from_address, "noreply@example.com");

        let row = fx.queue.get_by_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Pending);
        assert_eq!(fx.lane.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_send_skips_lane() {
        let fx = fixture(false).await;
        let mut req = request("user@example.com");
        let later = Utc::now() + chrono::Duration::hours(2);
        req.scheduled_at = Some(later);

        let message = fx.service.send(req).await.unwrap();
        let row = fx.queue.get_by_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.next_retry_at, later);
        assert_eq!(fx.lane.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_rejects_invalid_recipient() {
        let fx = fixture(false).await;
        let result = fx.service.send(request("not-an-email")).await;
        assert!(matches!(result, Err(EmailError::Validation(_))));
    }

    #[tokio::test]
    async fn test_send_rejects_suppressed_recipient() {
        let fx = fixture(false).await;
        fx.unsubscribes
            .upsert(UnsubscribeRecord::new(
                "user@example.com".to_string(),
                "tok".to_string(),
                UnsubscribeReason::Complaint,
            ))
            .await
            .unwrap();

        let result = fx.service.send(request("user@example.com")).await;
        assert!(matches!(result, Err(EmailError::Suppressed(_))));
    }

    #[tokio::test]
    async fn test_send_immediate_success() {
        let fx = fixture(false).await;
        let result = fx
            .service
            .send_immediate(request("user@example.com"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.provider.as_deref(), Some("mock"));
        assert!(result.message_id.is_some());

        let message = fx.service.status(result.email_log_id).await.unwrap();
        assert_eq!(message.status, EmailStatus::Sent);
    }

    #[tokio::test]
    async fn test_send_immediate_provider_failure_is_final() {
        let fx = fixture(true).await;
        let result = fx
            .service
            .send_immediate(request("user@example.com"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.is_some());

        let message = fx.service.status(result.email_log_id).await.unwrap();
        assert_eq!(message.status, EmailStatus::Failed);
        // Never queued for retry.
        assert!(fx.queue.get_by_message(message.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_message() {
        let fx = fixture(false).await;
        let message = fx.service.send(request("user@example.com")).await.unwrap();

        let cancelled = fx.service.cancel(message.id).await.unwrap();
        assert_eq!(cancelled.status, EmailStatus::Cancelled);

        // A second cancel is an invalid transition.
        let result = fx.service.cancel(message.id).await;
        assert!(matches!(result, Err(EmailError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let fx = fixture(false).await;
        let message = fx.service.send(request("user@example.com")).await.unwrap();

        // Still pending, so retry is rejected.
        let result = fx.service.retry(message.id).await;
        assert!(matches!(result, Err(EmailError::InvalidTransition { .. })));

        fx.queue.mark_failed(message.id, 3).await.unwrap();
        let retried = fx.service.retry(message.id).await.unwrap();
        assert_eq!(retried.status, EmailStatus::Pending);
        assert_eq!(retried.attempts, 0);
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let fx = fixture(false).await;
        fx.service.send(request("a@example.com")).await.unwrap();
        fx.service.send(request("b@example.com")).await.unwrap();

        let stats = fx.service.queue_stats().await.unwrap();
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert_eq!(stats.ephemeral_depth, 2);
    }
}
