//! Repository traits for email persistence, with in-memory implementations
//! used for development and testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EmailError, EmailResult};
use crate::models::{
    AnalyticsBucket, AnalyticsCounter, AnalyticsKey, EmailMessage, EmailStatus, ProviderConfig,
    QueueItem, UnsubscribeRecord,
};

/// Repository for the durable `email_logs` record of every send.
#[async_trait]
pub trait EmailLogRepository: Send + Sync {
    /// Persist a new log record.
    async fn create(&self, message: EmailMessage) -> EmailResult<EmailMessage>;

    /// Get a message by id.
    async fn get(&self, id: Uuid) -> EmailResult<Option<EmailMessage>>;

    /// Look up the message a provider webhook refers to.
    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> EmailResult<Option<EmailMessage>>;

    /// Replace the stored record. The caller is whichever actor currently
    /// holds the claim on the message.
    async fn update(&self, message: EmailMessage) -> EmailResult<EmailMessage>;
}

/// How long a `processing` claim is honored before the row becomes
/// claimable again. Covers workers that crash mid-batch and store errors
/// that strand a claimed row before any `mark_*` call lands.
pub const STALE_CLAIM_LEASE_SECS: i64 = 600;

/// Repository for the durable queue lane (`email_queue` rows).
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn enqueue(&self, item: QueueItem) -> EmailResult<QueueItem>;

    async fn get_by_message(&self, message_id: Uuid) -> EmailResult<Option<QueueItem>>;

    /// Atomically claim up to `limit` due rows, flipping them to
    /// `processing` and stamping `last_attempt_at`. Ordered by
    /// `(priority ASC, created_at ASC)`. Rows already claimed by a
    /// concurrent worker are skipped, never double-claimed; `processing`
    /// rows whose claim is older than [`STALE_CLAIM_LEASE_SECS`] are
    /// treated as abandoned and re-claimed without consuming an attempt.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> EmailResult<Vec<QueueItem>>;

    async fn mark_sent(&self, message_id: Uuid) -> EmailResult<()>;

    /// Return a claimed row to `pending` with a new attempt count and
    /// retry time.
    async fn mark_retry(
        &self,
        message_id: Uuid,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    ) -> EmailResult<()>;

    async fn mark_failed(&self, message_id: Uuid, attempts: u32) -> EmailResult<()>;

    /// Cancel a pending row so it is excluded from future claims. Returns
    /// false when no pending row exists (already claimed or absent) -
    /// cancellation is cooperative and never aborts an in-flight send.
    async fn cancel(&self, message_id: Uuid) -> EmailResult<bool>;

    /// Re-arm a failed row as pending and immediately due. Returns false
    /// when no failed row exists for the message.
    async fn requeue(&self, message_id: Uuid, now: DateTime<Utc>) -> EmailResult<bool>;

    /// Row counts per status, for the stats endpoint.
    async fn counts(&self) -> EmailResult<BTreeMap<String, u64>>;
}

/// Repository for provider configuration (`email_providers`).
#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// Active provider configs ordered by ascending priority.
    async fn list_active(&self) -> EmailResult<Vec<ProviderConfig>>;

    async fn get(&self, name: &str) -> EmailResult<Option<ProviderConfig>>;

    async fn upsert(&self, config: ProviderConfig) -> EmailResult<()>;
}

/// Repository for delivery analytics (`email_analytics`).
#[async_trait]
pub trait AnalyticsRepository: Send + Sync {
    /// Upsert the bucket for `key`, incrementing exactly one counter.
    async fn increment(&self, key: AnalyticsKey, counter: AnalyticsCounter) -> EmailResult<()>;

    async fn get(&self, key: &AnalyticsKey) -> EmailResult<Option<AnalyticsBucket>>;
}

/// Repository for the unsubscribe list (`email_unsubscribes`).
#[async_trait]
pub trait UnsubscribeRepository: Send + Sync {
    async fn find_by_email(&self, email: &str) -> EmailResult<Option<UnsubscribeRecord>>;

    /// Insert or refresh the record for the address. Idempotent per email:
    /// a second upsert updates the reason and timestamp, never duplicates.
    async fn upsert(&self, record: UnsubscribeRecord) -> EmailResult<UnsubscribeRecord>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// In-memory implementation of EmailLogRepository (for development/testing).
#[derive(Debug, Default, Clone)]
pub struct InMemoryEmailLogRepository {
    messages: Arc<RwLock<HashMap<Uuid, EmailMessage>>>,
}

impl InMemoryEmailLogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmailLogRepository for InMemoryEmailLogRepository {
    async fn create(&self, message: EmailMessage) -> EmailResult<EmailMessage> {
        let mut messages = self.messages.write().await;
        messages.insert(message.id, message.clone());
        tracing::debug!(message_id = %message.id, template = %message.template_id, "Created email log");
        Ok(message)
    }

    async fn get(&self, id: Uuid) -> EmailResult<Option<EmailMessage>> {
        let messages = self.messages.read().await;
        Ok(messages.get(&id).cloned())
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> EmailResult<Option<EmailMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .find(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn update(&self, message: EmailMessage) -> EmailResult<EmailMessage> {
        let mut messages = self.messages.write().await;
        if !messages.contains_key(&message.id) {
            return Err(EmailError::NotFound(message.id));
        }
        messages.insert(message.id, message.clone());
        Ok(message)
    }
}

/// In-memory implementation of QueueRepository.
///
/// Claiming takes the single write lock, which gives the same exclusivity
/// the Postgres implementation gets from `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryQueueRepository {
    items: Arc<RwLock<HashMap<Uuid, QueueItem>>>,
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn enqueue(&self, item: QueueItem) -> EmailResult<QueueItem> {
        let mut items = self.items.write().await;
        items.insert(item.message_id, item.clone());
        tracing::debug!(
            message_id = %item.message_id,
            next_retry_at = %item.next_retry_at,
            priority = item.priority,
            "Enqueued durable queue item"
        );
        Ok(item)
    }

    async fn get_by_message(&self, message_id: Uuid) -> EmailResult<Option<QueueItem>> {
        let items = self.items.read().await;
        Ok(items.get(&message_id).cloned())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> EmailResult<Vec<QueueItem>> {
        let mut items = self.items.write().await;
        let lease_cutoff = now - chrono::Duration::seconds(STALE_CLAIM_LEASE_SECS);

        let mut due: Vec<Uuid> = items
            .values()
            .filter(|i| {
                (i.status == EmailStatus::Pending && i.next_retry_at <= now)
                    || (i.status == EmailStatus::Processing
                        && i.last_attempt_at.is_some_and(|t| t <= lease_cutoff))
            })
            .map(|i| i.message_id)
            .collect();

        due.sort_by_key(|id| {
            let item = &items[id];
            (item.priority, item.created_at)
        });
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(item) = items.get_mut(&id) {
                item.status = EmailStatus::Processing;
                item.last_attempt_at = Some(now);
                claimed.push(item.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_sent(&self, message_id: Uuid) -> EmailResult<()> {
        let mut items = self.items.write().await;
        if let Some(item) = items.get_mut(&message_id) {
            item.status = EmailStatus::Sent;
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        message_id: Uuid,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    ) -> EmailResult<()> {
        let mut items = self.items.write().await;
        if let Some(item) = items.get_mut(&message_id) {
            item.status = EmailStatus::Pending;
            item.attempts = attempts;
            item.next_retry_at = next_retry_at;
        }
        Ok(())
    }

    async fn mark_failed(&self, message_id: Uuid, attempts: u32) -> EmailResult<()> {
        let mut items = self.items.write().await;
        if let Some(item) = items.get_mut(&message_id) {
            item.status = EmailStatus::Failed;
            item.attempts = attempts;
        }
        Ok(())
    }

    async fn cancel(&self, message_id: Uuid) -> EmailResult<bool> {
        let mut items = self.items.write().await;
        match items.get_mut(&message_id) {
            Some(item) if item.status == EmailStatus::Pending => {
                item.status = EmailStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue(&self, message_id: Uuid, now: DateTime<Utc>) -> EmailResult<bool> {
        let mut items = self.items.write().await;
        match items.get_mut(&message_id) {
            Some(item) if item.status == EmailStatus::Failed => {
                item.status = EmailStatus::Pending;
                item.attempts = 0;
                item.next_retry_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn counts(&self) -> EmailResult<BTreeMap<String, u64>> {
        let items = self.items.read().await;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for item in items.values() {
            *counts.entry(item.status.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// In-memory implementation of ProviderRepository.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProviderRepository {
    providers: Arc<RwLock<HashMap<String, ProviderConfig>>>,
}

impl InMemoryProviderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderRepository for InMemoryProviderRepository {
    async fn list_active(&self) -> EmailResult<Vec<ProviderConfig>> {
        let providers = self.providers.read().await;
        let mut active: Vec<ProviderConfig> = providers
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|p| p.priority);
        Ok(active)
    }

    async fn get(&self, name: &str) -> EmailResult<Option<ProviderConfig>> {
        let providers = self.providers.read().await;
        Ok(providers.get(name).cloned())
    }

    async fn upsert(&self, config: ProviderConfig) -> EmailResult<()> {
        let mut providers = self.providers.write().await;
        providers.insert(config.name.clone(), config);
        Ok(())
    }
}

/// In-memory implementation of AnalyticsRepository.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAnalyticsRepository {
    buckets: Arc<RwLock<HashMap<AnalyticsKey, AnalyticsBucket>>>,
}

impl InMemoryAnalyticsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalyticsRepository for InMemoryAnalyticsRepository {
    async fn increment(&self, key: AnalyticsKey, counter: AnalyticsCounter) -> EmailResult<()> {
        let mut buckets = self.buckets.write().await;
        buckets.entry(key).or_default().increment(counter);
        Ok(())
    }

    async fn get(&self, key: &AnalyticsKey) -> EmailResult<Option<AnalyticsBucket>> {
        let buckets = self.buckets.read().await;
        Ok(buckets.get(key).cloned())
    }
}

/// In-memory implementation of UnsubscribeRepository.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUnsubscribeRepository {
    records: Arc<RwLock<HashMap<String, UnsubscribeRecord>>>,
}

impl InMemoryUnsubscribeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnsubscribeRepository for InMemoryUnsubscribeRepository {
    async fn find_by_email(&self, email: &str) -> EmailResult<Option<UnsubscribeRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&email.to_lowercase()).cloned())
    }

    async fn upsert(&self, record: UnsubscribeRecord) -> EmailResult<UnsubscribeRecord> {
        let mut records = self.records.write().await;
        let key = record.email.to_lowercase();

        let stored = match records.get_mut(&key) {
            Some(existing) => {
                existing.reason = record.reason;
                existing.updated_at = Utc::now();
                existing.clone()
            }
            None => {
                tracing::info!(email = %record.email, reason = %record.reason, "Added unsubscribe record");
                records.insert(key, record.clone());
                record
            }
        };

        Ok(stored)
    }
}
