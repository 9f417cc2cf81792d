//! PostgreSQL implementations of the email repositories using SeaORM.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DbBackend, FromQueryResult, Statement};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EmailError, EmailResult};
use crate::models::{
    AnalyticsBucket, AnalyticsCounter, AnalyticsKey, EmailMessage, EmailStatus, Metadata,
    ProviderConfig, ProviderKind, QueueItem, UnsubscribeRecord, UnsubscribeReason,
};
use crate::repository::{
    AnalyticsRepository, EmailLogRepository, ProviderRepository, QueueRepository,
    UnsubscribeRepository, STALE_CLAIM_LEASE_SECS,
};

/// Helper struct for deserializing email log rows from the database
#[derive(Debug, FromQueryResult)]
struct EmailLogRow {
    id: Uuid,
    user_id: Option<Uuid>,
    template_id: String,
    recipients: Vec<String>, // PostgreSQL text array
    from_address: String,
    subject: String,
    html_body: String,
    text_body: String,
    status: String,
    provider: Option<String>,
    provider_message_id: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    clicked_at: Option<DateTime<Utc>>,
    bounced_at: Option<DateTime<Utc>>,
    complained_at: Option<DateTime<Utc>>,
    unsubscribed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EmailLogRow> for EmailMessage {
    type Error = EmailError;

    fn try_from(row: EmailLogRow) -> Result<Self, Self::Error> {
        Ok(EmailMessage {
            id: row.id,
            user_id: row.user_id,
            template_id: row.template_id,
            recipients: row.recipients,
            from_address: row.from_address,
            subject: row.subject,
            html_body: row.html_body,
            text_body: row.text_body,
            status: row.status.parse()?,
            provider: row.provider,
            provider_message_id: row.provider_message_id,
            scheduled_at: row.scheduled_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            opened_at: row.opened_at,
            clicked_at: row.clicked_at,
            bounced_at: row.bounced_at,
            complained_at: row.complained_at,
            unsubscribed_at: row.unsubscribed_at,
            error_message: row.error_message,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            priority: row.priority,
            metadata: serde_json::from_value::<Metadata>(row.metadata).unwrap_or_default(),
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL implementation of EmailLogRepository
#[derive(Clone)]
pub struct PostgresEmailLogRepository {
    db: sea_orm::DatabaseConnection,
}

impl PostgresEmailLogRepository {
    pub fn new(db: sea_orm::DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EmailLogRepository for PostgresEmailLogRepository {
    async fn create(&self, message: EmailMessage) -> EmailResult<EmailMessage> {
        let sql = r#"
            INSERT INTO email_logs (
                id, user_id, template_id, recipients, from_address, subject,
                html_body, text_body, status, priority, attempts, max_attempts,
                scheduled_at, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
        "#;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                message.id.into(),
                message.user_id.into(),
                message.template_id.clone().into(),
                message.recipients.clone().into(),
                message.from_address.clone().into(),
                message.subject.clone().into(),
                message.html_body.clone().into(),
                message.text_body.clone().into(),
                message.status.as_str().into(),
                message.priority.into(),
                (message.attempts as i32).into(),
                (message.max_attempts as i32).into(),
                message.scheduled_at.into(),
                serde_json::to_value(&message.metadata)?.into(),
                message.created_at.into(),
            ],
        );

        let row = EmailLogRow::find_by_statement(stmt)
            .one(&self.db)
            .await?
            .ok_or_else(|| EmailError::Database("Failed to create email log".to_string()))?;

        row.try_into()
    }

    async fn get(&self, id: Uuid) -> EmailResult<Option<EmailMessage>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM email_logs WHERE id = $1",
            [id.into()],
        );

        let row = EmailLogRow::find_by_statement(stmt).one(&self.db).await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> EmailResult<Option<EmailMessage>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM email_logs WHERE provider_message_id = $1",
            [provider_message_id.into()],
        );

        let row = EmailLogRow::find_by_statement(stmt).one(&self.db).await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, message: EmailMessage) -> EmailResult<EmailMessage> {
        let sql = r#"
            UPDATE email_logs SET
                status = $2,
                provider = $3,
                provider_message_id = $4,
                sent_at = $5,
                delivered_at = $6,
                opened_at = $7,
                clicked_at = $8,
                bounced_at = $9,
                complained_at = $10,
                unsubscribed_at = $11,
                error_message = $12,
                attempts = $13
            WHERE id = $1
            RETURNING *
        "#;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                message.id.into(),
                message.status.as_str().into(),
                message.provider.clone().into(),
                message.provider_message_id.clone().into(),
                message.sent_at.into(),
                message.delivered_at.into(),
                message.opened_at.into(),
                message.clicked_at.into(),
                message.bounced_at.into(),
                message.complained_at.into(),
                message.unsubscribed_at.into(),
                message.error_message.clone().into(),
                (message.attempts as i32).into(),
            ],
        );

        let row = EmailLogRow::find_by_statement(stmt)
            .one(&self.db)
            .await?
            .ok_or(EmailError::NotFound(message.id))?;

        row.try_into()
    }
}

/// Helper struct for deserializing queue rows
#[derive(Debug, FromQueryResult)]
struct QueueRow {
    id: Uuid,
    message_id: Uuid,
    status: String,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = EmailError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(QueueItem {
            id: row.id,
            message_id: row.message_id,
            status: row.status.parse()?,
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            next_retry_at: row.next_retry_at,
            last_attempt_at: row.last_attempt_at,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL implementation of QueueRepository.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED` so concurrently running processor
/// instances never claim the same row.
#[derive(Clone)]
pub struct PostgresQueueRepository {
    db: sea_orm::DatabaseConnection,
}

impl PostgresQueueRepository {
    pub fn new(db: sea_orm::DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QueueRepository for PostgresQueueRepository {
    async fn enqueue(&self, item: QueueItem) -> EmailResult<QueueItem> {
        let sql = r#"
            INSERT INTO email_queue (
                id, message_id, status, priority, attempts, max_attempts,
                next_retry_at, last_attempt_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (message_id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                next_retry_at = EXCLUDED.next_retry_at
            RETURNING *
        "#;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                item.id.into(),
                item.message_id.into(),
                item.status.as_str().into(),
                item.priority.into(),
                (item.attempts as i32).into(),
                (item.max_attempts as i32).into(),
                item.next_retry_at.into(),
                item.last_attempt_at.into(),
                item.created_at.into(),
            ],
        );

        let row = QueueRow::find_by_statement(stmt)
            .one(&self.db)
            .await?
            .ok_or_else(|| EmailError::Database("Failed to enqueue message".to_string()))?;

        row.try_into()
    }

    async fn get_by_message(&self, message_id: Uuid) -> EmailResult<Option<QueueItem>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM email_queue WHERE message_id = $1",
            [message_id.into()],
        );

        let row = QueueRow::find_by_statement(stmt).one(&self.db).await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> EmailResult<Vec<QueueItem>> {
        // Single statement, so the claim is atomic without an explicit
        // transaction. SKIP LOCKED leaves rows held by other workers alone.
        // Processing rows past the stale-claim lease were abandoned by a
        // crashed worker and are claimed again without touching attempts.
        let sql = r#"
            WITH due AS (
                SELECT id FROM email_queue
                WHERE (status = 'pending' AND next_retry_at <= $1)
                   OR (status = 'processing' AND last_attempt_at <= $3)
                ORDER BY priority ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE email_queue q
            SET status = 'processing', last_attempt_at = $1
            FROM due
            WHERE q.id = due.id
            RETURNING q.*
        "#;

        let lease_cutoff = now - chrono::Duration::seconds(STALE_CLAIM_LEASE_SECS);
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [now.into(), (limit as i64).into(), lease_cutoff.into()],
        );

        let rows = QueueRow::find_by_statement(stmt).all(&self.db).await?;

        let mut items: Vec<QueueItem> = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<EmailResult<_>>()?;

        // RETURNING does not preserve the CTE ordering.
        items.sort_by_key(|i| (i.priority, i.created_at));
        Ok(items)
    }

    async fn mark_sent(&self, message_id: Uuid) -> EmailResult<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE email_queue SET status = 'sent' WHERE message_id = $1",
            [message_id.into()],
        );
        self.db.execute_raw(stmt).await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        message_id: Uuid,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    ) -> EmailResult<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE email_queue SET status = 'pending', attempts = $2, next_retry_at = $3 WHERE message_id = $1",
            [message_id.into(), (attempts as i32).into(), next_retry_at.into()],
        );
        self.db.execute_raw(stmt).await?;
        Ok(())
    }

    async fn mark_failed(&self, message_id: Uuid, attempts: u32) -> EmailResult<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE email_queue SET status = 'failed', attempts = $2 WHERE message_id = $1",
            [message_id.into(), (attempts as i32).into()],
        );
        self.db.execute_raw(stmt).await?;
        Ok(())
    }

    async fn cancel(&self, message_id: Uuid) -> EmailResult<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE email_queue SET status = 'cancelled' WHERE message_id = $1 AND status = 'pending'",
            [message_id.into()],
        );
        let result = self.db.execute_raw(stmt).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue(&self, message_id: Uuid, now: DateTime<Utc>) -> EmailResult<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE email_queue SET status = 'pending', attempts = 0, next_retry_at = $2 WHERE message_id = $1 AND status = 'failed'",
            [message_id.into(), now.into()],
        );
        let result = self.db.execute_raw(stmt).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> EmailResult<BTreeMap<String, u64>> {
        #[derive(FromQueryResult)]
        struct CountRow {
            status: String,
            count: i64,
        }

        let stmt = Statement::from_string(
            DbBackend::Postgres,
            "SELECT status, COUNT(*) AS count FROM email_queue GROUP BY status",
        );

        let rows = CountRow::find_by_statement(stmt).all(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.status, r.count.max(0) as u64))
            .collect())
    }
}

/// Helper struct for deserializing provider rows
#[derive(Debug, FromQueryResult)]
struct ProviderRow {
    name: String,
    kind: String,
    credentials: serde_json::Value,
    priority: i32,
    is_active: bool,
}

impl TryFrom<ProviderRow> for ProviderConfig {
    type Error = EmailError;

    fn try_from(row: ProviderRow) -> Result<Self, Self::Error> {
        let kind: ProviderKind = row.kind.parse()?;
        Ok(ProviderConfig {
            name: row.name,
            kind,
            credentials: row.credentials,
            priority: row.priority,
            is_active: row.is_active,
        })
    }
}

/// PostgreSQL implementation of ProviderRepository
#[derive(Clone)]
pub struct PostgresProviderRepository {
    db: sea_orm::DatabaseConnection,
}

impl PostgresProviderRepository {
    pub fn new(db: sea_orm::DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProviderRepository for PostgresProviderRepository {
    async fn list_active(&self) -> EmailResult<Vec<ProviderConfig>> {
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            "SELECT * FROM email_providers WHERE is_active = TRUE ORDER BY priority ASC",
        );

        let rows = ProviderRow::find_by_statement(stmt).all(&self.db).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get(&self, name: &str) -> EmailResult<Option<ProviderConfig>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM email_providers WHERE name = $1",
            [name.into()],
        );

        let row = ProviderRow::find_by_statement(stmt).one(&self.db).await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn upsert(&self, config: ProviderConfig) -> EmailResult<()> {
        let sql = r#"
            INSERT INTO email_providers (name, kind, credentials, priority, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                kind = EXCLUDED.kind,
                credentials = EXCLUDED.credentials,
                priority = EXCLUDED.priority,
                is_active = EXCLUDED.is_active
        "#;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                config.name.clone().into(),
                config.kind.to_string().into(),
                config.credentials.clone().into(),
                config.priority.into(),
                config.is_active.into(),
            ],
        );
        self.db.execute_raw(stmt).await?;
        Ok(())
    }
}

/// PostgreSQL implementation of AnalyticsRepository
#[derive(Clone)]
pub struct PostgresAnalyticsRepository {
    db: sea_orm::DatabaseConnection,
}

impl PostgresAnalyticsRepository {
    pub fn new(db: sea_orm::DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AnalyticsRepository for PostgresAnalyticsRepository {
    async fn increment(&self, key: AnalyticsKey, counter: AnalyticsCounter) -> EmailResult<()> {
        // Column names come from a closed enum, never from input.
        let column = counter.column();
        let sql = format!(
            r#"
            INSERT INTO email_analytics (date, provider, template_type, {column})
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (date, provider, template_type)
            DO UPDATE SET {column} = email_analytics.{column} + 1
            "#
        );

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                key.date.into(),
                key.provider.into(),
                key.template_type.into(),
            ],
        );
        self.db.execute_raw(stmt).await?;
        Ok(())
    }

    async fn get(&self, key: &AnalyticsKey) -> EmailResult<Option<AnalyticsBucket>> {
        #[derive(FromQueryResult)]
        struct BucketRow {
            sent: i64,
            delivered: i64,
            opened: i64,
            clicked: i64,
            bounced: i64,
            complained: i64,
            unsubscribed: i64,
        }

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM email_analytics WHERE date = $1 AND provider = $2 AND template_type = $3",
            [
                key.date.into(),
                key.provider.clone().into(),
                key.template_type.clone().into(),
            ],
        );

        let row = BucketRow::find_by_statement(stmt).one(&self.db).await?;
        Ok(row.map(|r| AnalyticsBucket {
            sent: r.sent.max(0) as u64,
            delivered: r.delivered.max(0) as u64,
            opened: r.opened.max(0) as u64,
            clicked: r.clicked.max(0) as u64,
            bounced: r.bounced.max(0) as u64,
            complained: r.complained.max(0) as u64,
            unsubscribed: r.unsubscribed.max(0) as u64,
        }))
    }
}

/// Helper struct for deserializing unsubscribe rows
#[derive(Debug, FromQueryResult)]
struct UnsubscribeRow {
    id: Uuid,
    email: String,
    token: String,
    reason: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UnsubscribeRow> for UnsubscribeRecord {
    type Error = EmailError;

    fn try_from(row: UnsubscribeRow) -> Result<Self, Self::Error> {
        let reason = match row.reason.as_str() {
            "bounce" => UnsubscribeReason::Bounce,
            "complaint" => UnsubscribeReason::Complaint,
            "unsubscribe" => UnsubscribeReason::Unsubscribe,
            "manual" => UnsubscribeReason::Manual,
            other => {
                return Err(EmailError::Internal(format!(
                    "unknown unsubscribe reason '{}'",
                    other
                )))
            }
        };
        Ok(UnsubscribeRecord {
            id: row.id,
            email: row.email,
            token: row.token,
            reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL implementation of UnsubscribeRepository
#[derive(Clone)]
pub struct PostgresUnsubscribeRepository {
    db: sea_orm::DatabaseConnection,
}

impl PostgresUnsubscribeRepository {
    pub fn new(db: sea_orm::DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UnsubscribeRepository for PostgresUnsubscribeRepository {
    async fn find_by_email(&self, email: &str) -> EmailResult<Option<UnsubscribeRecord>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM email_unsubscribes WHERE email = LOWER($1)",
            [email.into()],
        );

        let row = UnsubscribeRow::find_by_statement(stmt).one(&self.db).await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn upsert(&self, record: UnsubscribeRecord) -> EmailResult<UnsubscribeRecord> {
        let sql = r#"
            INSERT INTO email_unsubscribes (id, email, token, reason, created_at, updated_at)
            VALUES ($1, LOWER($2), $3, $4, $5, $5)
            ON CONFLICT (email) DO UPDATE SET
                reason = EXCLUDED.reason,
                updated_at = EXCLUDED.updated_at
            RETURNING *
        "#;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                record.id.into(),
                record.email.clone().into(),
                record.token.clone().into(),
                record.reason.to_string().into(),
                record.created_at.into(),
            ],
        );

        let row = UnsubscribeRow::find_by_statement(stmt)
            .one(&self.db)
            .await?
            .ok_or_else(|| EmailError::Database("Failed to upsert unsubscribe".to_string()))?;

        row.try_into()
    }
}
