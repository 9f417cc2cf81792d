//! Data models for the email delivery pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EmailError, EmailResult};

/// Default number of delivery attempts before a message fails terminally.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for new messages. Lower values are claimed first.
pub const DEFAULT_PRIORITY: i32 = 100;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of an email message.
///
/// `Queued → Pending → Processing → {Sent, Failed, Cancelled}`; a retryable
/// failure moves `Processing` back to `Pending`. Webhooks can move `Sent`
/// (or any earlier state, since callbacks can race local progress) to
/// `Bounced`/`Complained`/`Unsubscribed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Queued,
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
    Bounced,
    Complained,
    Unsubscribed,
}

impl EmailStatus {
    /// A terminal status permits no further retry-driven transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmailStatus::Sent
                | EmailStatus::Failed
                | EmailStatus::Cancelled
                | EmailStatus::Bounced
                | EmailStatus::Complained
                | EmailStatus::Unsubscribed
        )
    }

    /// Statuses set by delivery webhooks. These are never overwritten back
    /// by informational events.
    pub fn is_webhook_terminal(&self) -> bool {
        matches!(
            self,
            EmailStatus::Bounced | EmailStatus::Complained | EmailStatus::Unsubscribed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Queued => "queued",
            EmailStatus::Pending => "pending",
            EmailStatus::Processing => "processing",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
            EmailStatus::Cancelled => "cancelled",
            EmailStatus::Bounced => "bounced",
            EmailStatus::Complained => "complained",
            EmailStatus::Unsubscribed => "unsubscribed",
        }
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EmailStatus {
    type Err = EmailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(EmailStatus::Queued),
            "pending" => Ok(EmailStatus::Pending),
            "processing" => Ok(EmailStatus::Processing),
            "sent" => Ok(EmailStatus::Sent),
            "failed" => Ok(EmailStatus::Failed),
            "cancelled" => Ok(EmailStatus::Cancelled),
            "bounced" => Ok(EmailStatus::Bounced),
            "complained" => Ok(EmailStatus::Complained),
            "unsubscribed" => Ok(EmailStatus::Unsubscribed),
            other => Err(EmailError::Internal(format!("unknown status '{}'", other))),
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Maximum number of metadata entries per message.
pub const METADATA_MAX_ENTRIES: usize = 10;
/// Maximum metadata key length.
pub const METADATA_MAX_KEY_LEN: usize = 64;
/// Maximum metadata value length.
pub const METADATA_MAX_VALUE_LEN: usize = 256;

/// Bounded key-value map attached to a message.
///
/// Inserts beyond the documented bounds are rejected so the map stays
/// checkable instead of degenerating into arbitrary JSON. Deserialization
/// goes through [`Metadata::try_from_map`], so request bodies cannot bypass
/// the bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "BTreeMap<String, String>")]
pub struct Metadata(BTreeMap<String, String>);

impl TryFrom<BTreeMap<String, String>> for Metadata {
    type Error = EmailError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::try_from_map(map)
    }
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate an externally supplied map against the bounds.
    pub fn try_from_map(map: BTreeMap<String, String>) -> EmailResult<Self> {
        let mut metadata = Self::new();
        for (key, value) in map {
            metadata.insert(key, value)?;
        }
        Ok(metadata)
    }

    pub fn insert(&mut self, key: String, value: String) -> EmailResult<()> {
        if self.0.len() >= METADATA_MAX_ENTRIES && !self.0.contains_key(&key) {
            return Err(EmailError::Validation(format!(
                "metadata is limited to {} entries",
                METADATA_MAX_ENTRIES
            )));
        }
        if key.len() > METADATA_MAX_KEY_LEN {
            return Err(EmailError::Validation(format!(
                "metadata key '{}' exceeds {} characters",
                key, METADATA_MAX_KEY_LEN
            )));
        }
        if value.len() > METADATA_MAX_VALUE_LEN {
            return Err(EmailError::Validation(format!(
                "metadata value for '{}' exceeds {} characters",
                key, METADATA_MAX_VALUE_LEN
            )));
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Messages
// ============================================================================

/// An email send request as accepted by the intake service.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    /// Recipient email addresses.
    pub to: Vec<String>,
    /// Template identifier to render.
    pub template_id: String,
    /// Variables passed to the template renderer.
    #[serde(default)]
    pub variables: serde_json::Value,
    /// Requested language; falls back to the renderer default when absent.
    #[serde(default)]
    pub language: Option<String>,
    /// Sender override; the service default is used when absent.
    #[serde(default)]
    pub from: Option<String>,
    /// Deliver at or after this time via the durable lane.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Claim priority, ascending. Defaults to [`DEFAULT_PRIORITY`].
    #[serde(default)]
    pub priority: Option<i32>,
    /// Originating user, if any.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// The durable log record of a message: rendered content, delivery state,
/// and the webhook-driven delivery timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub template_id: String,
    pub recipients: Vec<String>,
    pub from_address: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub status: EmailStatus,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub complained_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl EmailMessage {
    /// Create a new log record in `Queued` status from a validated request
    /// and its rendered content.
    pub fn new_queued(
        request: &SendRequest,
        from_address: String,
        subject: String,
        html_body: String,
        text_body: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            template_id: request.template_id.clone(),
            recipients: request.to.clone(),
            from_address,
            subject,
            html_body,
            text_body,
            status: EmailStatus::Queued,
            provider: None,
            provider_message_id: None,
            scheduled_at: request.scheduled_at,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            complained_at: None,
            unsubscribed_at: None,
            error_message: None,
            attempts: 0,
            max_attempts,
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Durable-lane projection of a message awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub message_id: Uuid,
    pub status: EmailStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a pending queue row for a message, due at `next_retry_at`.
    pub fn pending(message: &EmailMessage, next_retry_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message.id,
            status: EmailStatus::Pending,
            priority: message.priority,
            attempts: message.attempts,
            max_attempts: message.max_attempts,
            next_retry_at,
            last_attempt_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Result of a synchronous immediate send.
#[derive(Debug, Clone, Serialize)]
pub struct ImmediateSendResult {
    pub success: bool,
    pub email_log_id: Uuid,
    pub message_id: Option<String>,
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Queue depth and per-status counts exposed by the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub by_status: BTreeMap<String, u64>,
    pub ephemeral_depth: u64,
}

// ============================================================================
// Providers
// ============================================================================

/// The closed set of supported provider implementations. Adding a provider
/// means adding one variant here and one arm in the gateway constructor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Sendgrid,
    Mailgun,
    Smtp,
    Mock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Sendgrid => write!(f, "sendgrid"),
            ProviderKind::Mailgun => write!(f, "mailgun"),
            ProviderKind::Smtp => write!(f, "smtp"),
            ProviderKind::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = EmailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sendgrid" => Ok(ProviderKind::Sendgrid),
            "mailgun" => Ok(ProviderKind::Mailgun),
            "smtp" => Ok(ProviderKind::Smtp),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(EmailError::Configuration(format!(
                "unsupported provider kind '{}'",
                other
            ))),
        }
    }
}

/// Stored configuration for one provider. The credential bundle is opaque
/// JSON; at-rest encryption is handled by the secrets layer, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub credentials: serde_json::Value,
    /// Ascending priority; lower values are preferred at failover selection.
    pub priority: i32,
    pub is_active: bool,
}

// ============================================================================
// Webhook events
// ============================================================================

/// Delivery event types normalized from provider webhooks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Delivered,
    Open,
    Click,
    Bounce,
    Complaint,
    Unsubscribe,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Delivered => write!(f, "delivered"),
            EventType::Open => write!(f, "open"),
            EventType::Click => write!(f, "click"),
            EventType::Bounce => write!(f, "bounce"),
            EventType::Complaint => write!(f, "complaint"),
            EventType::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// A provider webhook notification normalized to the canonical shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Provider-assigned message id, matched against
    /// `EmailMessage::provider_message_id`.
    pub message_id: String,
    pub recipient: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub raw_metadata: serde_json::Value,
}

// ============================================================================
// Analytics
// ============================================================================

/// Aggregation key for delivery analytics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AnalyticsKey {
    pub date: NaiveDate,
    pub provider: String,
    pub template_type: String,
}

/// The counter an analytics upsert increments. Counters only go up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsCounter {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
}

impl AnalyticsCounter {
    pub fn column(&self) -> &'static str {
        match self {
            AnalyticsCounter::Sent => "sent",
            AnalyticsCounter::Delivered => "delivered",
            AnalyticsCounter::Opened => "opened",
            AnalyticsCounter::Clicked => "clicked",
            AnalyticsCounter::Bounced => "bounced",
            AnalyticsCounter::Complained => "complained",
            AnalyticsCounter::Unsubscribed => "unsubscribed",
        }
    }
}

impl From<EventType> for AnalyticsCounter {
    fn from(event: EventType) -> Self {
        match event {
            EventType::Delivered => AnalyticsCounter::Delivered,
            EventType::Open => AnalyticsCounter::Opened,
            EventType::Click => AnalyticsCounter::Clicked,
            EventType::Bounce => AnalyticsCounter::Bounced,
            EventType::Complaint => AnalyticsCounter::Complained,
            EventType::Unsubscribe => AnalyticsCounter::Unsubscribed,
        }
    }
}

/// One analytics bucket: monotonically increasing counters per
/// (date, provider, template type).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsBucket {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub bounced: u64,
    pub complained: u64,
    pub unsubscribed: u64,
}

impl AnalyticsBucket {
    pub fn increment(&mut self, counter: AnalyticsCounter) {
        match counter {
            AnalyticsCounter::Sent => self.sent += 1,
            AnalyticsCounter::Delivered => self.delivered += 1,
            AnalyticsCounter::Opened => self.opened += 1,
            AnalyticsCounter::Clicked => self.clicked += 1,
            AnalyticsCounter::Bounced => self.bounced += 1,
            AnalyticsCounter::Complained => self.complained += 1,
            AnalyticsCounter::Unsubscribed => self.unsubscribed += 1,
        }
    }
}

// ============================================================================
// Unsubscribes
// ============================================================================

/// Why an address was added to the unsubscribe list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeReason {
    Bounce,
    Complaint,
    Unsubscribe,
    Manual,
}

impl std::fmt::Display for UnsubscribeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsubscribeReason::Bounce => write!(f, "bounce"),
            UnsubscribeReason::Complaint => write!(f, "complaint"),
            UnsubscribeReason::Unsubscribe => write!(f, "unsubscribe"),
            UnsubscribeReason::Manual => write!(f, "manual"),
        }
    }
}

/// Suppression entry: mail is never queued for an address with an active
/// record. Unique per email address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRecord {
    pub id: Uuid,
    pub email: String,
    pub token: String,
    pub reason: UnsubscribeReason,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnsubscribeRecord {
    pub fn new(email: String, token: String, reason: UnsubscribeReason) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email,
            token,
            reason,
            created_at: now,
            updated_at: now,
        }
    }
}
