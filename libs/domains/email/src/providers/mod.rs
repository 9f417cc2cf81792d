//! Email provider implementations.
//!
//! This module contains the `EmailProvider` trait and implementations
//! for different email sending services.

mod mailgun;
mod mock;
mod sendgrid;
mod smtp;

pub use mailgun::MailgunProvider;
pub use mock::MockProvider;
pub use sendgrid::SendgridProvider;
pub use smtp::SmtpProvider;

use async_trait::async_trait;

use crate::error::EmailResult;
use crate::models::{CanonicalEvent, EmailMessage};

/// Receipt returned by a provider after it accepts a message.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Provider-assigned message ID, used to correlate later webhook events.
    pub message_id: Option<String>,
}

/// Trait for email sending providers.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Send a rendered email message.
    async fn send_email(&self, message: &EmailMessage) -> EmailResult<SendReceipt>;

    /// Cheap structural check of the provider's credentials. Providers that
    /// fail validation are skipped during failover.
    fn validate_config(&self) -> EmailResult<()>;

    /// Translate a provider-specific webhook payload into canonical events.
    /// Events the provider reports but the pipeline does not track are
    /// silently dropped.
    fn parse_webhook(&self, payload: &serde_json::Value) -> EmailResult<Vec<CanonicalEvent>>;

    /// Provider name for logging and status records.
    fn name(&self) -> &str;
}
