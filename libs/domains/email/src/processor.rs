//! Queue processor: the delivery loop behind asynchronous sends.
//!
//! Each tick drains the ephemeral lane (re-arming any orphaned ids into the
//! durable queue), claims a batch of due rows, and attempts delivery through
//! the provider gateway. Failed attempts are re-armed with exponential
//! backoff until the attempt budget is exhausted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::EmailResult;
use crate::gateway::ProviderGateway;
use crate::lane::EphemeralLane;
use crate::models::{AnalyticsCounter, AnalyticsKey, EmailStatus, QueueItem};
use crate::repository::{AnalyticsRepository, EmailLogRepository, QueueRepository};

/// Queue processor configuration.
#[derive(Debug, Clone)]
pub struct QueueProcessorConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// Maximum rows claimed per tick.
    pub batch_size: usize,
    /// Base delay for exponential retry backoff.
    pub backoff_base: Duration,
}

impl Default for QueueProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(
                std::env::var("EMAIL_TICK_INTERVAL_SECS")
                    .unwrap_or_default()
                    .parse()
                    .unwrap_or(5),
            ),
            batch_size: std::env::var("EMAIL_BATCH_SIZE")
                .unwrap_or_default()
                .parse()
                .unwrap_or(10),
            backoff_base: Duration::from_secs(
                std::env::var("EMAIL_BACKOFF_BASE_SECS")
                    .unwrap_or_default()
                    .parse()
                    .unwrap_or(60),
            ),
        }
    }
}

pub struct QueueProcessor {
    logs: Arc<dyn EmailLogRepository>,
    queue: Arc<dyn QueueRepository>,
    lane: Arc<dyn EphemeralLane>,
    gateway: Arc<ProviderGateway>,
    analytics: Arc<dyn AnalyticsRepository>,
    config: QueueProcessorConfig,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl QueueProcessor {
    pub fn new(
        logs: Arc<dyn EmailLogRepository>,
        queue: Arc<dyn QueueRepository>,
        lane: Arc<dyn EphemeralLane>,
        gateway: Arc<ProviderGateway>,
        analytics: Arc<dyn AnalyticsRepository>,
        config: QueueProcessorConfig,
    ) -> Self {
        Self {
            logs,
            queue,
            lane,
            gateway,
            analytics,
            config,
            running: Mutex::new(None),
        }
    }

    /// Start the background loop. Idempotent; a second call while running is
    /// a no-op. The first tick runs immediately.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Queue processor already running");
            return;
        }

        let (tx, rx) = watch::channel(false);
        let processor = self.clone();
        let handle = tokio::spawn(async move {
            processor.run(rx).await;
        });
        *running = Some((tx, handle));
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Queue processor started"
        );
    }

    /// Stop the background loop and wait for the in-flight tick to finish.
    /// Idempotent; stopping a stopped processor is a no-op.
    pub async fn stop(&self) {
        let Some((tx, handle)) = self.running.lock().await.take() else {
            debug!("Queue processor not running");
            return;
        };
        let _ = tx.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "Queue processor task panicked");
        }
        info!("Queue processor stopped");
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        // tokio intervals fire immediately on the first tick.
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Queue processor tick failed");
                    }
                }
            }
        }
    }

    /// One processing pass: re-arm lane orphans, then claim and deliver a
    /// batch of due rows.
    pub async fn tick(&self) -> EmailResult<usize> {
        self.rearm_lane_orphans().await;

        let now = Utc::now();
        let claimed = self.queue.claim_due(now, self.config.batch_size).await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(count = claimed.len(), "Claimed queue batch");
        let mut delivered = 0;
        for item in claimed {
            match self.deliver(&item).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    error!(
                        message_id = %item.message_id,
                        error = %e,
                        "Delivery attempt errored outside the retry path"
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Drain the lane and re-create durable rows for any id that lost its
    /// queue row. Ids whose rows are intact need nothing: their rows are
    /// already due and the claim pass picks them up.
    async fn rearm_lane_orphans(&self) {
        let ids = match self.lane.drain(self.config.batch_size).await {
            Ok(ids) => ids,
            Err(e) => {
                // The lane is lossy by contract; the durable queue still
                // drives delivery, so a lane outage only costs latency.
                warn!(error = %e, "Failed to drain ephemeral lane");
                return;
            }
        };

        for message_id in ids {
            match self.queue.get_by_message(message_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = self.rearm_orphan(message_id).await {
                        warn!(message_id = %message_id, error = %e, "Failed to re-arm lane orphan");
                    }
                }
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Failed to check lane entry");
                }
            }
        }
    }

    async fn rearm_orphan(&self, message_id: uuid::Uuid) -> EmailResult<()> {
        let Some(message) = self.logs.get(message_id).await? else {
            warn!(message_id = %message_id, "Lane entry has no log record, dropping");
            return Ok(());
        };
        if message.status.is_terminal() {
            return Ok(());
        }
        info!(message_id = %message_id, "Re-arming lane orphan into durable queue");
        self.queue
            .enqueue(QueueItem::pending(&message, Utc::now()))
            .await?;
        Ok(())
    }

    /// Deliver one claimed row, updating both the queue row and the log
    /// record with the outcome.
    async fn deliver(&self, item: &QueueItem) -> EmailResult<()> {
        let Some(mut message) = self.logs.get(item.message_id).await? else {
            error!(message_id = %item.message_id, "Claimed row has no log record, failing it");
            self.queue.mark_failed(item.message_id, item.attempts).await?;
            return Ok(());
        };

        if message.status.is_terminal() {
            debug!(
                message_id = %item.message_id,
                status = %message.status,
                "Skipping claimed row whose message is already settled"
            );
            self.queue.mark_sent(item.message_id).await?;
            return Ok(());
        }

        message.status = EmailStatus::Processing;
        message = self.logs.update(message).await?;

        match self.gateway.send(&message).await {
            Ok(sent) => {
                let now = Utc::now();
                message.status = EmailStatus::Sent;
                message.sent_at = Some(now);
                message.provider = Some(sent.provider.clone());
                message.provider_message_id = sent.receipt.message_id;
                message.error_message = None;
                self.logs.update(message.clone()).await?;
                self.queue.mark_sent(item.message_id).await?;

                let key = AnalyticsKey {
                    date: now.date_naive(),
                    provider: sent.provider,
                    template_type: message.template_id.clone(),
                };
                if let Err(e) = self.analytics.increment(key, AnalyticsCounter::Sent).await {
                    warn!(message_id = %message.id, error = %e, "Failed to record send analytics");
                }

                info!(
                    message_id = %message.id,
                    attempts = item.attempts + 1,
                    "Email delivered"
                );
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                let attempts = item.attempts + 1;
                message.attempts = attempts;
                message.error_message = Some(e.to_string());

                if attempts >= item.max_attempts {
                    message.status = EmailStatus::Failed;
                    self.logs.update(message).await?;
                    self.queue.mark_failed(item.message_id, attempts).await?;
                    warn!(
                        message_id = %item.message_id,
                        attempts,
                        error = %e,
                        "Attempt budget exhausted, message failed"
                    );
                } else {
                    let delay = self.backoff_delay(attempts);
                    let next_retry_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    message.status = EmailStatus::Pending;
                    self.logs.update(message).await?;
                    self.queue
                        .mark_retry(item.message_id, attempts, next_retry_at)
                        .await?;
                    info!(
                        message_id = %item.message_id,
                        attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Send failed, retry scheduled"
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Exponential backoff: `base * 2^attempts`, capped at one day.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        const MAX_BACKOFF: Duration = Duration::from_secs(24 * 3600);
        self.config
            .backoff_base
            .checked_mul(2u32.saturating_pow(attempts))
            .map(|d| d.min(MAX_BACKOFF))
            .unwrap_or(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::InMemoryLane;
    use crate::models::{
        EmailMessage, Metadata, ProviderConfig, ProviderKind, SendRequest, DEFAULT_MAX_ATTEMPTS,
    };
    use crate::repository::{
        InMemoryAnalyticsRepository, InMemoryEmailLogRepository, InMemoryProviderRepository,
        InMemoryQueueRepository, ProviderRepository,
    };
    use serde_json::json;

    struct Fixture {
        processor: Arc<QueueProcessor>,
        logs: Arc<InMemoryEmailLogRepository>,
        queue: Arc<InMemoryQueueRepository>,
        lane: Arc<InMemoryLane>,
        providers: Arc<InMemoryProviderRepository>,
    }

    async fn fixture(provider_fails: bool) -> Fixture {
        let logs = Arc::new(InMemoryEmailLogRepository::new());
        let queue = Arc::new(InMemoryQueueRepository::new());
        let lane = Arc::new(InMemoryLane::new());
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
        let gateway = Arc::new(ProviderGateway::new(providers.clone()));

        let processor = Arc::new(QueueProcessor::new(
            logs.clone(),
            queue.clone(),
            lane.clone(),
            gateway,
            analytics,
            QueueProcessorConfig {
                tick_interval: Duration::from_millis(10),
                batch_size: 10,
                backoff_base: Duration::from_secs(60),
            },
        ));

        Fixture {
            processor,
            logs,
            queue,
            lane,
            providers,
        }
    }

    async fn queued_message(fx: &Fixture) -> EmailMessage {
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
        let message = EmailMessage::new_queued(
            &request,
            "noreply@example.com".to_string(),
            "Welcome".to_string(),
            "<p>hi</p>".to_string(),
            "hi".to_string(),
            DEFAULT_MAX_ATTEMPTS,
        );
        let message = fx.logs.create(message).await.unwrap();
        fx.queue
            .enqueue(QueueItem::pending(&message, Utc::now()))
            .await
            .unwrap();
        message
    }

    #[tokio::test]
    async fn test_tick_delivers_due_message() {
        let fx = fixture(false).await;
        let message = queued_message(&fx).await;

        let delivered = fx.processor.tick().await.unwrap();
        assert_eq!(delivered, 1);

        let updated = fx.logs.get(message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, EmailStatus::Sent);
        assert!(updated.sent_at.is_some());
        assert_eq!(updated.provider.as_deref(), Some("mock"));
        assert!(updated.provider_message_id.is_some());

        let row = fx.queue.get_by_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Sent);
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let fx = fixture(true).await;
        let message = queued_message(&fx).await;

        fx.processor.tick().await.unwrap();

        let row = fx.queue.get_by_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Pending);
        assert_eq!(row.attempts, 1);
        // base * 2^1 = 120s out.
        let delta = row.next_retry_at - Utc::now();
        assert!(delta > chrono::Duration::seconds(100));
        assert!(delta < chrono::Duration::seconds(140));

        let updated = fx.logs.get(message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, EmailStatus::Pending);
        assert!(updated.error_message.is_some());
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion_fails_message() {
        let fx = fixture(true).await;
        let message = queued_message(&fx).await;

        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            fx.processor.tick().await.unwrap();
            // Pull the retry forward so the next tick claims it again.
            let row = fx.queue.get_by_message(message.id).await.unwrap().unwrap();
            if row.status == EmailStatus::Pending {
                fx.queue
                    .mark_retry(message.id, row.attempts, Utc::now())
                    .await
                    .unwrap();
            }
        }

        let row = fx.queue.get_by_message(message.id).await.unwrap().unwrap();
        assert_eq!(row.status, EmailStatus::Failed);
        assert_eq!(row.attempts, DEFAULT_MAX_ATTEMPTS);

        let updated = fx.logs.get(message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, EmailStatus::Failed);
    }

    #[tokio::test]
    async fn test_lane_orphan_is_rearmed() {
        let fx = fixture(false).await;

        // Log record exists but its queue row was lost.
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
        let message = EmailMessage::new_queued(
            &request,
            "noreply@example.com".to_string(),
            "Welcome".to_string(),
            "<p>hi</p>".to_string(),
            "hi".to_string(),
            DEFAULT_MAX_ATTEMPTS,
        );
        let message = fx.logs.create(message).await.unwrap();
        fx.lane.push(message.id).await.unwrap();

        let delivered = fx.processor.tick().await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(fx.lane.len().await.unwrap(), 0);

        let updated = fx.logs.get(message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, EmailStatus::Sent);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let fx = fixture(false).await;
        fx.processor.start().await;
        fx.processor.start().await;
        fx.processor.stop().await;
        fx.processor.stop().await;
        // Providers are untouched by lifecycle churn.
        assert_eq!(fx.providers.list_active().await.unwrap().len(), 1);
    }
}
