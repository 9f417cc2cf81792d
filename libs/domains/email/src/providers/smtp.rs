//! SMTP email provider implementation using lettre.
//!
//! Primarily intended for local development with MailHog/Mailpit or similar
//! SMTP testing tools, but also usable against an authenticated relay.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Deserialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{EmailProvider, SendReceipt};
use crate::error::{EmailError, EmailResult};
use crate::models::{CanonicalEvent, EmailMessage};

/// SMTP credentials, deserialized from the provider record.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpCredentials {
    /// SMTP server host.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// SMTP username (optional for dev servers like Mailpit).
    #[serde(default)]
    pub username: Option<String>,
    /// SMTP password (optional for dev servers like Mailpit).
    #[serde(default)]
    pub password: Option<String>,
    /// Whether to use TLS (false for local dev servers).
    #[serde(default)]
    pub use_tls: bool,
}

fn default_port() -> u16 {
    1025
}

/// SMTP email provider.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    credentials: SmtpCredentials,
}

impl SmtpProvider {
    pub fn new(credentials: SmtpCredentials) -> EmailResult<Self> {
        let transport = Self::build_transport(&credentials)?;
        Ok(Self {
            transport,
            credentials,
        })
    }

    pub fn from_credentials(credentials: &serde_json::Value) -> EmailResult<Self> {
        let credentials: SmtpCredentials = serde_json::from_value(credentials.clone())
            .map_err(|e| EmailError::Configuration(format!("Invalid SMTP credentials: {}", e)))?;
        Self::new(credentials)
    }

    fn build_transport(
        credentials: &SmtpCredentials,
    ) -> EmailResult<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = if credentials.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&credentials.host)
                .map_err(|e| {
                    EmailError::Configuration(format!("Failed to create SMTP relay: {}", e))
                })?
                .port(credentials.port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&credentials.host)
                .port(credentials.port)
        };

        if let (Some(username), Some(password)) = (&credentials.username, &credentials.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    fn build_message(&self, email: &EmailMessage) -> EmailResult<(Message, String)> {
        let from: Mailbox = email
            .from_address
            .parse()
            .map_err(|e| EmailError::Provider(format!("Invalid from address: {}", e)))?;

        let mut builder = Message::builder().from(from).subject(&email.subject);

        for recipient in &email.recipients {
            let to: Mailbox = recipient.parse().map_err(|e| {
                EmailError::Provider(format!("Invalid recipient '{}': {}", recipient, e))
            })?;
            builder = builder.to(to);
        }

        // SMTP has no provider-assigned id, so stamp our own into the
        // Message-ID header to keep status lookups uniform.
        let message_id = format!("{}@relay", Uuid::new_v4());
        builder = builder.message_id(Some(format!("<{}>", message_id)));

        let message = builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text_body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html_body.clone()),
                    ),
            )
            .map_err(|e| EmailError::Provider(format!("Failed to build email message: {}", e)))?;

        Ok((message, message_id))
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send_email(&self, email: &EmailMessage) -> EmailResult<SendReceipt> {
        debug!(
            email_id = %email.id,
            subject = %email.subject,
            host = %self.credentials.host,
            port = %self.credentials.port,
            "Sending email via SMTP"
        );

        let (message, message_id) = self.build_message(email)?;

        self.transport.send(message).await.map_err(|e| {
            error!(
                email_id = %email.id,
                error = %e,
                "Failed to send email via SMTP"
            );
            EmailError::Provider(format!("SMTP send failed: {}", e))
        })?;

        info!(
            email_id = %email.id,
            message_id = %message_id,
            "Email sent successfully via SMTP"
        );

        Ok(SendReceipt {
            message_id: Some(message_id),
        })
    }

    fn validate_config(&self) -> EmailResult<()> {
        if self.credentials.host.is_empty() {
            return Err(EmailError::Configuration("SMTP host is empty".to_string()));
        }
        if self.credentials.port == 0 {
            return Err(EmailError::Configuration("SMTP port is zero".to_string()));
        }
        Ok(())
    }

    fn parse_webhook(&self, _payload: &serde_json::Value) -> EmailResult<Vec<CanonicalEvent>> {
        Err(EmailError::WebhookParse(
            "SMTP provider does not emit webhooks".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "smtp"
    }
}
