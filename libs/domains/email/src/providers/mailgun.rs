//! Mailgun email provider implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info};

use super::{EmailProvider, SendReceipt};
use crate::error::{EmailError, EmailResult};
use crate::models::{CanonicalEvent, EmailMessage, EventType};

/// Mailgun API credentials, deserialized from the provider record.
#[derive(Debug, Clone, Deserialize)]
pub struct MailgunCredentials {
    /// Mailgun private API key.
    pub api_key: String,
    /// Sending domain registered with Mailgun.
    pub domain: String,
    /// Mailgun API base URL (defaults to the US region).
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "https://api.mailgun.net/v3".to_string()
}

/// Mailgun email provider.
pub struct MailgunProvider {
    credentials: MailgunCredentials,
    client: Client,
}

impl MailgunProvider {
    pub fn new(credentials: MailgunCredentials) -> Self {
        Self {
            credentials,
            client: Client::new(),
        }
    }

    pub fn from_credentials(credentials: &serde_json::Value) -> EmailResult<Self> {
        let credentials: MailgunCredentials = serde_json::from_value(credentials.clone())
            .map_err(|e| EmailError::Configuration(format!("Invalid Mailgun credentials: {}", e)))?;
        Ok(Self::new(credentials))
    }
}

#[derive(Debug, Deserialize)]
struct MailgunSendResponse {
    id: String,
}

/// Outer envelope of a Mailgun event webhook.
#[derive(Debug, Deserialize)]
struct MailgunWebhook {
    #[serde(rename = "event-data")]
    event_data: MailgunEventData,
}

#[derive(Debug, Deserialize)]
struct MailgunEventData {
    event: String,
    recipient: String,
    #[serde(default)]
    timestamp: Option<f64>,
    message: MailgunMessageRef,
}

#[derive(Debug, Deserialize)]
struct MailgunMessageRef {
    headers: MailgunMessageHeaders,
}

#[derive(Debug, Deserialize)]
struct MailgunMessageHeaders {
    #[serde(rename = "message-id")]
    message_id: String,
}

#[async_trait]
impl EmailProvider for MailgunProvider {
    async fn send_email(&self, message: &EmailMessage) -> EmailResult<SendReceipt> {
        debug!(
            email_id = %message.id,
            recipient_count = message.recipients.len(),
            subject = %message.subject,
            "Sending email via Mailgun"
        );

        let form = [
            ("from", message.from_address.clone()),
            ("to", message.recipients.join(",")),
            ("subject", message.subject.clone()),
            ("text", message.text_body.clone()),
            ("html", message.html_body.clone()),
        ];

        let response = self
            .client
            .post(format!(
                "{}/{}/messages",
                self.credentials.base_url, self.credentials.domain
            ))
            .basic_auth("api", Some(&self.credentials.api_key))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: MailgunSendResponse = response.json().await?;
            // Mailgun wraps the id in angle brackets.
            let message_id = body.id.trim_matches(['<', '>']).to_string();
            info!(
                email_id = %message.id,
                message_id = %message_id,
                "Email sent successfully via Mailgun"
            );
            Ok(SendReceipt {
                message_id: Some(message_id),
            })
        } else {
            let error_body = response.text().await.unwrap_or_default();
            error!(
                email_id = %message.id,
                status = %status,
                error = %error_body,
                "Failed to send email via Mailgun"
            );
            Err(EmailError::Provider(format!(
                "Mailgun error ({}): {}",
                status, error_body
            )))
        }
    }

    fn validate_config(&self) -> EmailResult<()> {
        if self.credentials.api_key.is_empty() {
            return Err(EmailError::Configuration(
                "Mailgun API key is empty".to_string(),
            ));
        }
        if self.credentials.domain.is_empty() {
            return Err(EmailError::Configuration(
                "Mailgun sending domain is empty".to_string(),
            ));
        }
        Ok(())
    }

    fn parse_webhook(&self, payload: &serde_json::Value) -> EmailResult<Vec<CanonicalEvent>> {
        let webhook: MailgunWebhook = serde_json::from_value(payload.clone())
            .map_err(|e| EmailError::WebhookParse(format!("Mailgun payload: {}", e)))?;

        let data = webhook.event_data;
        let event_type = match data.event.as_str() {
            "delivered" => EventType::Delivered,
            "opened" => EventType::Open,
            "clicked" => EventType::Click,
            "failed" => EventType::Bounce,
            "complained" => EventType::Complaint,
            "unsubscribed" => EventType::Unsubscribe,
            other => {
                debug!(event = %other, "Ignoring untracked Mailgun event");
                return Ok(Vec::new());
            }
        };

        let timestamp = data
            .timestamp
            .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
            .unwrap_or_else(Utc::now);

        Ok(vec![CanonicalEvent {
            message_id: data.message.headers.message_id,
            recipient: data.recipient,
            event_type,
            timestamp,
            provider: self.name().to_string(),
            raw_metadata: payload.clone(),
        }])
    }

    fn name(&self) -> &str {
        "mailgun"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> MailgunProvider {
        MailgunProvider::new(MailgunCredentials {
            api_key: "key-test".to_string(),
            domain: "mail.example.com".to_string(),
            base_url: default_base_url(),
        })
    }

    #[test]
    fn test_validate_config() {
        assert!(provider().validate_config().is_ok());

        let bad = MailgunProvider::new(MailgunCredentials {
            api_key: "key-test".to_string(),
            domain: String::new(),
            base_url: default_base_url(),
        });
        assert!(bad.validate_config().is_err());
    }

    #[test]
    fn test_parse_webhook_delivered() {
        let payload = json!({
            "event-data": {
                "event": "delivered",
                "recipient": "user@example.com",
                "timestamp": 1700000000.5,
                "message": { "headers": { "message-id": "20240101.abc@mail.example.com" } }
            }
        });

        let events = provider().parse_webhook(&payload).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Delivered);
        assert_eq!(events[0].message_id, "20240101.abc@mail.example.com");
        assert_eq!(events[0].recipient, "user@example.com");
    }

    #[test]
    fn test_parse_webhook_untracked_event_is_dropped() {
        let payload = json!({
            "event-data": {
                "event": "accepted",
                "recipient": "user@example.com",
                "message": { "headers": { "message-id": "x@mail.example.com" } }
            }
        });

        assert!(provider().parse_webhook(&payload).unwrap().is_empty());
    }
}
