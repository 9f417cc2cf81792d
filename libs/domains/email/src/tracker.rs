//! Webhook-driven delivery status tracking.
//!
//! Providers report delivery lifecycle events asynchronously. The tracker
//! normalizes them (via the owning provider's parser), matches them to log
//! records by provider message id, and applies the status machine:
//! `Delivered`/`Open`/`Click` stamp timestamps without touching status, while
//! `Bounce`/`Complaint`/`Unsubscribe` move the message to a terminal status
//! and suppress the recipient. The first terminal status wins; later terminal
//! events still stamp their timestamp and record the suppression.

use std::sync::Arc;

use rand::{distr::Alphanumeric, RngExt};
use tracing::{debug, info, warn};

use crate::error::EmailResult;
use crate::gateway::ProviderGateway;
use crate::models::{
    AnalyticsKey, CanonicalEvent, EmailStatus, EventType, UnsubscribeReason, UnsubscribeRecord,
};
use crate::repository::{AnalyticsRepository, EmailLogRepository, UnsubscribeRepository};

const UNSUBSCRIBE_TOKEN_LEN: usize = 32;

/// Summary of one webhook delivery.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct WebhookOutcome {
    /// Events the provider payload contained after normalization.
    pub received: usize,
    /// Events applied to a log record.
    pub processed: usize,
    /// Events with no matching log record, dropped.
    pub dropped: usize,
}

pub struct StatusTracker {
    logs: Arc<dyn EmailLogRepository>,
    unsubscribes: Arc<dyn UnsubscribeRepository>,
    analytics: Arc<dyn AnalyticsRepository>,
    gateway: Arc<ProviderGateway>,
}

impl StatusTracker {
    pub fn new(
        logs: Arc<dyn EmailLogRepository>,
        unsubscribes: Arc<dyn UnsubscribeRepository>,
        analytics: Arc<dyn AnalyticsRepository>,
        gateway: Arc<ProviderGateway>,
    ) -> Self {
        Self {
            logs,
            unsubscribes,
            analytics,
            gateway,
        }
    }

    /// Handle a raw webhook payload from the named provider.
    pub async fn handle_webhook(
        &self,
        provider_name: &str,
        payload: &serde_json::Value,
    ) -> EmailResult<WebhookOutcome> {
        let provider = self.gateway.provider_named(provider_name).await?;
        let events = provider.parse_webhook(payload)?;

        let mut outcome = WebhookOutcome {
            received: events.len(),
            ..Default::default()
        };

        for event in events {
            match self.process_event(&event).await {
                Ok(true) => outcome.processed += 1,
                Ok(false) => outcome.dropped += 1,
                // One bad event must not abort the rest of the batch.
                Err(e) => {
                    warn!(
                        provider = %event.provider,
                        message_id = %event.message_id,
                        event = %event.event_type,
                        error = %e,
                        "Dropping event that failed to apply"
                    );
                    outcome.dropped += 1;
                }
            }
        }

        info!(
            provider = %provider_name,
            received = outcome.received,
            processed = outcome.processed,
            dropped = outcome.dropped,
            "Webhook handled"
        );
        Ok(outcome)
    }

    /// Apply one canonical event. Returns false when no log record matches
    /// the event's provider message id.
    pub async fn process_event(&self, event: &CanonicalEvent) -> EmailResult<bool> {
        let Some(mut message) = self
            .logs
            .find_by_provider_message_id(&event.message_id)
            .await?
        else {
            warn!(
                provider = %event.provider,
                message_id = %event.message_id,
                event = %event.event_type,
                "Dropping event with no matching email log"
            );
            return Ok(false);
        };

        debug!(
            email_id = %message.id,
            event = %event.event_type,
            recipient = %event.recipient,
            "Applying delivery event"
        );

        match event.event_type {
            EventType::Delivered => {
                message.delivered_at.get_or_insert(event.timestamp);
            }
            EventType::Open => {
                message.opened_at.get_or_insert(event.timestamp);
            }
            EventType::Click => {
                message.clicked_at.get_or_insert(event.timestamp);
            }
            EventType::Bounce => {
                if !message.status.is_webhook_terminal() {
                    message.status = EmailStatus::Bounced;
                }
                message.bounced_at.get_or_insert(event.timestamp);
                self.suppress(&event.recipient, UnsubscribeReason::Bounce)
                    .await?;
            }
            EventType::Complaint => {
                if !message.status.is_webhook_terminal() {
                    message.status = EmailStatus::Complained;
                }
                message.complained_at.get_or_insert(event.timestamp);
                self.suppress(&event.recipient, UnsubscribeReason::Complaint)
                    .await?;
            }
            EventType::Unsubscribe => {
                if !message.status.is_webhook_terminal() {
                    message.status = EmailStatus::Unsubscribed;
                }
                message.unsubscribed_at.get_or_insert(event.timestamp);
                self.suppress(&event.recipient, UnsubscribeReason::Unsubscribe)
                    .await?;
            }
        }

        let key = AnalyticsKey {
            date: event.timestamp.date_naive(),
            provider: event.provider.clone(),
            template_type: message.template_id.clone(),
        };
        self.analytics.increment(key, event.event_type.into()).await?;

        self.logs.update(message).await?;
        Ok(true)
    }

    async fn suppress(&self, email: &str, reason: UnsubscribeReason) -> EmailResult<()> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(UNSUBSCRIBE_TOKEN_LEN)
            .map(char::from)
            .collect();

        let record = UnsubscribeRecord::new(email.to_string(), token, reason);
        self.unsubscribes.upsert(record).await?;
        info!(email = %email, reason = ?reason, "Recipient suppressed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        EmailMessage, Metadata, ProviderConfig, ProviderKind, SendRequest, DEFAULT_MAX_ATTEMPTS,
    };
    use crate::repository::{
        InMemoryAnalyticsRepository, InMemoryEmailLogRepository, InMemoryProviderRepository,
        InMemoryUnsubscribeRepository, ProviderRepository,
    };
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        tracker: StatusTracker,
        logs: Arc<InMemoryEmailLogRepository>,
        unsubscribes: Arc<InMemoryUnsubscribeRepository>,
        analytics: Arc<InMemoryAnalyticsRepository>,
    }

    async fn fixture() -> Fixture {
        let logs = Arc::new(InMemoryEmailLogRepository::new());
        let unsubscribes = Arc::new(InMemoryUnsubscribeRepository::new());
        let analytics = Arc::new(InMemoryAnalyticsRepository::new());

        let providers = Arc::new(InMemoryProviderRepository::new());
        providers
            .upsert(ProviderConfig {
                name: "mock".to_string(),
                kind: ProviderKind::Mock,
                credentials: json!({}),
                priority: 1,
                is_active: true,
            })
            .await
            .unwrap();
        let gateway = Arc::new(ProviderGateway::new(providers));

        Fixture {
            tracker: StatusTracker::new(
                logs.clone(),
                unsubscribes.clone(),
                analytics.clone(),
                gateway,
            ),
            logs,
            unsubscribes,
            analytics,
        }
    }

    async fn sent_message(fx: &Fixture, provider_message_id: &str) -> EmailMessage {
        let request = SendRequest {
            to: vec!["user@example.com".to_string()],
            template_id: "welcome".to_string(),
            variables: json!({}),
            language: None,
            from: None,
            scheduled_at: None,
            priority: None,
            user_id: None,
            metadata: Metadata::default(),
        };
        let mut message = EmailMessage::new_queued(
            &request,
            "noreply@example.com".to_string(),
            "Welcome".to_string(),
            "<p>hi</p>".to_string(),
            "hi".to_string(),
            DEFAULT_MAX_ATTEMPTS,
        );
        message.status = EmailStatus::Sent;
        message.sent_at = Some(Utc::now() - chrono::Duration::minutes(5));
        message.provider = Some("mock".to_string());
        message.provider_message_id = Some(provider_message_id.to_string());
        fx.logs.create(message).await.unwrap()
    }

    fn event(message_id: &str, event_type: EventType) -> serde_json::Value {
        serde_json::to_value(CanonicalEvent {
            message_id: message_id.to_string(),
            recipient: "user@example.com".to_string(),
            event_type,
            timestamp: Utc::now(),
            provider: "mock".to_string(),
            raw_metadata: json!({}),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_delivered_stamps_timestamp_without_status_change() {
        let fx = fixture().await;
        let message = sent_message(&fx, "m-1").await;

        let outcome = fx
            .tracker
            .handle_webhook("mock", &event("m-1", EventType::Delivered))
            .await
            .unwrap();
        assert_eq!(outcome.processed, 1);

        let updated = fx.logs.get(message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, EmailStatus::Sent);
        assert!(updated.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_bounce_overwrites_status_and_suppresses() {
        let fx = fixture().await;
        let message = sent_message(&fx, "m-2").await;

        fx.tracker
            .handle_webhook("mock", &event("m-2", EventType::Bounce))
            .await
            .unwrap();

        let updated = fx.logs.get(message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, EmailStatus::Bounced);
        assert!(updated.bounced_at.is_some());
        assert_eq!(updated.sent_at, message.sent_at, "sent_at must survive a bounce");

        let suppressed = fx
            .unsubscribes
            .find_by_email("user@example.com")
            .await
            .unwrap();
        assert!(suppressed.is_some());
        assert_eq!(suppressed.unwrap().reason, UnsubscribeReason::Bounce);
    }

    #[tokio::test]
    async fn test_first_terminal_status_wins() {
        let fx = fixture().await;
        let message = sent_message(&fx, "m-5").await;

        fx.tracker
            .handle_webhook("mock", &event("m-5", EventType::Bounce))
            .await
            .unwrap();
        fx.tracker
            .handle_webhook("mock", &event("m-5", EventType::Unsubscribe))
            .await
            .unwrap();

        // Bounced sticks; the later unsubscribe still stamps its timestamp
        // and keeps the recipient suppressed.
        let updated = fx.logs.get(message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, EmailStatus::Bounced);
        assert!(updated.unsubscribed_at.is_some());
        assert!(fx
            .unsubscribes
            .find_by_email("user@example.com")
            .await
            .unwrap()
            .is_some());
    }

    /// Log repository whose writes always fail, for batch isolation tests.
    struct BrokenWriteLogRepository {
        inner: InMemoryEmailLogRepository,
    }

    #[async_trait::async_trait]
    impl crate::repository::EmailLogRepository for BrokenWriteLogRepository {
        async fn create(&self, message: EmailMessage) -> crate::error::EmailResult<EmailMessage> {
            self.inner.create(message).await
        }

        async fn get(&self, id: uuid::Uuid) -> crate::error::EmailResult<Option<EmailMessage>> {
            self.inner.get(id).await
        }

        async fn find_by_provider_message_id(
            &self,
            provider_message_id: &str,
        ) -> crate::error::EmailResult<Option<EmailMessage>> {
            self.inner.find_by_provider_message_id(provider_message_id).await
        }

        async fn update(&self, _message: EmailMessage) -> crate::error::EmailResult<EmailMessage> {
            Err(crate::error::EmailError::Database(
                "write path down".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_abort_rest_of_batch() {
        let logs = Arc::new(BrokenWriteLogRepository {
            inner: InMemoryEmailLogRepository::new(),
        });
        let unsubscribes = Arc::new(InMemoryUnsubscribeRepository::new());
        let analytics = Arc::new(InMemoryAnalyticsRepository::new());

        let providers = Arc::new(InMemoryProviderRepository::new());
        providers
            .upsert(ProviderConfig {
                name: "mock".to_string(),
                kind: ProviderKind::Mock,
                credentials: json!({}),
                priority: 1,
                is_active: true,
            })
            .await
            .unwrap();
        let tracker = StatusTracker::new(
            logs.clone(),
            unsubscribes,
            analytics,
            Arc::new(ProviderGateway::new(providers)),
        );

        let request = SendRequest {
            to: vec!["user@example.com".to_string()],
            template_id: "welcome".to_string(),
            variables: json!({}),
            language: None,
            from: None,
            scheduled_at: None,
            priority: None,
            user_id: None,
            metadata: Metadata::default(),
        };
        let mut message = EmailMessage::new_queued(
            &request,
            "noreply@example.com".to_string(),
            "Welcome".to_string(),
            "<p>hi</p>".to_string(),
            "hi".to_string(),
            DEFAULT_MAX_ATTEMPTS,
        );
        message.status = EmailStatus::Sent;
        message.provider = Some("mock".to_string());
        message.provider_message_id = Some("m-6".to_string());
        logs.create(message).await.unwrap();

        // First event hits the broken write path, second has no matching
        // record. Both are reported dropped instead of failing the webhook.
        let batch = json!([
            event("m-6", EventType::Delivered),
            event("no-such-id", EventType::Delivered),
        ]);
        let outcome = tracker.handle_webhook("mock", &batch).await.unwrap();
        assert_eq!(outcome.received, 2);
        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.dropped, 2);
    }

    #[tokio::test]
    async fn test_unmatched_event_is_dropped() {
        let fx = fixture().await;
        sent_message(&fx, "m-3").await;

        let outcome = fx
            .tracker
            .handle_webhook("mock", &event("no-such-id", EventType::Delivered))
            .await
            .unwrap();
        assert_eq!(outcome.received, 1);
        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.dropped, 1);
    }

    #[tokio::test]
    async fn test_analytics_counter_incremented() {
        let fx = fixture().await;
        sent_message(&fx, "m-4").await;

        let now = Utc::now();
        fx.tracker
            .handle_webhook("mock", &event("m-4", EventType::Open))
            .await
            .unwrap();

        let key = AnalyticsKey {
            date: now.date_naive(),
            provider: "mock".to_string(),
            template_type: "welcome".to_string(),
        };
        let bucket = fx.analytics.get(&key).await.unwrap().unwrap();
        assert_eq!(bucket.opened, 1);
    }
}
