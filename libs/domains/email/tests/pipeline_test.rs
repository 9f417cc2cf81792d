//! End-to-end tests for the email delivery pipeline.
//!
//! Drives the full flow over the in-memory backends: intake, queue
//! processing with failover and retry, and webhook-driven status tracking.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use domain_email::gateway::ProviderGateway;
use domain_email::lane::InMemoryLane;
use domain_email::models::{
    CanonicalEvent, EmailStatus, EventType, Metadata, ProviderConfig, ProviderKind, SendRequest,
};
use domain_email::repository::{
    AnalyticsRepository, EmailLogRepository, InMemoryAnalyticsRepository,
    InMemoryEmailLogRepository, InMemoryProviderRepository, InMemoryQueueRepository,
    InMemoryUnsubscribeRepository, ProviderRepository, QueueRepository, UnsubscribeRepository,
};
use domain_email::service::EmailServiceConfig;
use domain_email::templates::TemplateRenderer;
use domain_email::{
    EmailError, EmailService, QueueProcessor, QueueProcessorConfig, StatusTracker,
};

struct Pipeline {
    service: EmailService,
    processor: Arc<QueueProcessor>,
    tracker: StatusTracker,
    logs: Arc<InMemoryEmailLogRepository>,
    queue: Arc<InMemoryQueueRepository>,
    providers: Arc<InMemoryProviderRepository>,
    analytics: Arc<InMemoryAnalyticsRepository>,
    unsubscribes: Arc<InMemoryUnsubscribeRepository>,
}

async fn pipeline(provider_configs: Vec<ProviderConfig>) -> Pipeline {
    let logs = Arc::new(InMemoryEmailLogRepository::new());
    let queue = Arc::new(InMemoryQueueRepository::new());
    let lane = Arc::new(InMemoryLane::new());
    let analytics = Arc::new(InMemoryAnalyticsRepository::new());
    let unsubscribes = Arc::new(InMemoryUnsubscribeRepository::new());
    let providers = Arc::new(InMemoryProviderRepository::new());
    for config in provider_configs {
        providers.upsert(config).await.unwrap();
    }

    let gateway = Arc::new(ProviderGateway::new(providers.clone()));
    let renderer = Arc::new(TemplateRenderer::new().unwrap());

    let service = EmailService::new(
        logs.clone(),
        queue.clone(),
        lane.clone(),
        unsubscribes.clone(),
        analytics.clone(),
        gateway.clone(),
        renderer,
        EmailServiceConfig {
            default_from: "noreply@example.com".to_string(),
            max_attempts: 3,
        },
    );

    let processor = Arc::new(QueueProcessor::new(
        logs.clone(),
        queue.clone(),
        lane,
        gateway.clone(),
        analytics.clone(),
        QueueProcessorConfig {
            tick_interval: Duration::from_millis(10),
            batch_size: 10,
            backoff_base: Duration::from_secs(60),
        },
    ));

    let tracker = StatusTracker::new(
        logs.clone(),
        unsubscribes.clone(),
        analytics.clone(),
        gateway,
    );

    Pipeline {
        service,
        processor,
        tracker,
        logs,
        queue,
        providers,
        analytics,
        unsubscribes,
    }
}

fn mock_provider(name: &str, priority: i32, should_fail: bool) -> ProviderConfig {
    mock_provider_with(name, priority, json!({"should_fail": should_fail}))
}

fn mock_provider_with(name: &str, priority: i32, credentials: serde_json::Value) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        kind: ProviderKind::Mock,
        credentials,
        priority,
        is_active: true,
    }
}

fn welcome_request(to: &str) -> SendRequest {
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
async fn queued_email_is_delivered_on_next_tick() {
    let p = pipeline(vec![mock_provider("mock", 1, false)]).await;

    let message = p.service.send(welcome_request("user@example.com")).await.unwrap();
    assert_eq!(message.status, EmailStatus::Pending);

    p.processor.tick().await.unwrap();

    let delivered = p.service.status(message.id).await.unwrap();
    assert_eq!(delivered.status, EmailStatus::Sent);
    assert_eq!(delivered.provider.as_deref(), Some("mock"));
    assert!(delivered.provider_message_id.is_some());

    // Send analytics recorded under today's bucket.
    let key = domain_email::models::AnalyticsKey {
        date: Utc::now().date_naive(),
        provider: "mock".to_string(),
        template_type: "welcome".to_string(),
    };
    assert_eq!(p.analytics.get(&key).await.unwrap().unwrap().sent, 1);
}

#[tokio::test]
async fn failover_uses_lower_priority_provider() {
    let p = pipeline(vec![
        mock_provider_with("primary", 1, json!({"invalid_config": true})),
        mock_provider("secondary", 2, false),
    ])
    .await;

    let message = p.service.send(welcome_request("user@example.com")).await.unwrap();
    p.processor.tick().await.unwrap();

    let delivered = p.service.status(message.id).await.unwrap();
    assert_eq!(delivered.status, EmailStatus::Sent);
    assert_eq!(delivered.provider.as_deref(), Some("secondary"));
}

#[tokio::test]
async fn exhausted_retries_fail_and_manual_retry_rearms() {
    let p = pipeline(vec![mock_provider("flaky", 1, true)]).await;

    let message = p.service.send(welcome_request("user@example.com")).await.unwrap();

    // Burn through the attempt budget, pulling each scheduled retry forward.
    for _ in 0..3 {
        p.processor.tick().await.unwrap();
        let row = p.queue.get_by_message(message.id).await.unwrap().unwrap();
        if row.status == EmailStatus::Pending {
            p.queue
                .mark_retry(message.id, row.attempts, Utc::now())
                .await
                .unwrap();
        }
    }

    let failed = p.service.status(message.id).await.unwrap();
    assert_eq!(failed.status, EmailStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.error_message.is_some());

    // Fix the provider and retry manually.
    p.providers
        .upsert(mock_provider("flaky", 1, false))
        .await
        .unwrap();
    let gateway_refresh = p.service.retry(message.id).await.unwrap();
    assert_eq!(gateway_refresh.status, EmailStatus::Pending);
    assert_eq!(gateway_refresh.attempts, 0);
}

#[tokio::test]
async fn webhook_bounce_suppresses_future_sends() {
    let p = pipeline(vec![mock_provider("mock", 1, false)]).await;

    let message = p.service.send(welcome_request("victim@example.com")).await.unwrap();
    p.processor.tick().await.unwrap();

    let sent = p.logs.get(message.id).await.unwrap().unwrap();
    let provider_message_id = sent.provider_message_id.unwrap();

    let payload = serde_json::to_value(CanonicalEvent {
        message_id: provider_message_id,
        recipient: "victim@example.com".to_string(),
        event_type: EventType::Bounce,
        timestamp: Utc::now(),
        provider: "mock".to_string(),
        raw_metadata: json!({}),
    })
    .unwrap();

    let outcome = p.tracker.handle_webhook("mock", &payload).await.unwrap();
    assert_eq!(outcome.processed, 1);

    let bounced = p.service.status(message.id).await.unwrap();
    assert_eq!(bounced.status, EmailStatus::Bounced);
    assert!(p
        .unsubscribes
        .find_by_email("victim@example.com")
        .await
        .unwrap()
        .is_some());

    // The suppressed address is rejected at intake from now on.
    let result = p.service.send(welcome_request("victim@example.com")).await;
    assert!(matches!(result, Err(EmailError::Suppressed(_))));
}

#[tokio::test]
async fn scheduled_email_waits_for_due_time() {
    let p = pipeline(vec![mock_provider("mock", 1, false)]).await;

    let mut request = welcome_request("user@example.com");
    request.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
    let message = p.service.send(request).await.unwrap();

    p.processor.tick().await.unwrap();

    // Not due yet, so the tick leaves it alone.
    let still_pending = p.service.status(message.id).await.unwrap();
    assert_eq!(still_pending.status, EmailStatus::Pending);

    // Pull it forward and it goes out.
    p.queue.mark_retry(message.id, 0, Utc::now()).await.unwrap();
    p.processor.tick().await.unwrap();
    let delivered = p.service.status(message.id).await.unwrap();
    assert_eq!(delivered.status, EmailStatus::Sent);
}

#[tokio::test]
async fn cancel_wins_over_pending_delivery() {
    let p = pipeline(vec![mock_provider("mock", 1, false)]).await;

    let mut request = welcome_request("user@example.com");
    request.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
    let message = p.service.send(request).await.unwrap();

    let cancelled = p.service.cancel(message.id).await.unwrap();
    assert_eq!(cancelled.status, EmailStatus::Cancelled);

    // The tick never picks up the cancelled row.
    p.processor.tick().await.unwrap();
    let after = p.service.status(message.id).await.unwrap();
    assert_eq!(after.status, EmailStatus::Cancelled);
}
