//! SendGrid email provider implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{EmailProvider, SendReceipt};
use crate::error::{EmailError, EmailResult};
use crate::models::{CanonicalEvent, EmailMessage, EventType};

/// SendGrid API credentials, deserialized from the provider record.
#[derive(Debug, Clone, Deserialize)]
pub struct SendgridCredentials {
    /// SendGrid API key.
    pub api_key: String,
    /// SendGrid API base URL (defaults to production).
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String {
    "https://api.sendgrid.com/v3".to_string()
}

/// SendGrid email provider.
pub struct SendgridProvider {
    credentials: SendgridCredentials,
    client: Client,
}

impl SendgridProvider {
    pub fn new(credentials: SendgridCredentials) -> Self {
        Self {
            credentials,
            client: Client::new(),
        }
    }

    /// Build a provider from the opaque credential bundle stored on the
    /// provider record.
    pub fn from_credentials(credentials: &serde_json::Value) -> EmailResult<Self> {
        let credentials: SendgridCredentials = serde_json::from_value(credentials.clone())
            .map_err(|e| {
                EmailError::Configuration(format!("Invalid SendGrid credentials: {}", e))
            })?;
        Ok(Self::new(credentials))
    }
}

// SendGrid API request/response structures

#[derive(Debug, Serialize)]
struct SendGridRequest {
    personalizations: Vec<Personalization>,
    from: EmailAddress,
    subject: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Personalization {
    to: Vec<EmailAddress>,
}

#[derive(Debug, Serialize)]
struct EmailAddress {
    email: String,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(rename = "type")]
    content_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SendGridError {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
}

/// One entry of the SendGrid event webhook payload (an array of events).
#[derive(Debug, Deserialize)]
struct SendGridEvent {
    event: String,
    email: String,
    #[serde(default)]
    sg_message_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[async_trait]
impl EmailProvider for SendgridProvider {
    async fn send_email(&self, message: &EmailMessage) -> EmailResult<SendReceipt> {
        let request = SendGridRequest {
            personalizations: vec![Personalization {
                to: message
                    .recipients
                    .iter()
                    .map(|addr| EmailAddress {
                        email: addr.clone(),
                    })
                    .collect(),
            }],
            from: EmailAddress {
                email: message.from_address.clone(),
            },
            subject: message.subject.clone(),
            content: vec![
                Content {
                    content_type: "text/plain".to_string(),
                    value: message.text_body.clone(),
                },
                Content {
                    content_type: "text/html".to_string(),
                    value: message.html_body.clone(),
                },
            ],
        };

        debug!(
            email_id = %message.id,
            recipient_count = message.recipients.len(),
            subject = %message.subject,
            "Sending email via SendGrid"
        );

        let response = self
            .client
            .post(format!("{}/mail/send", self.credentials.api_url))
            .header("Authorization", format!("Bearer {}", self.credentials.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            info!(
                email_id = %message.id,
                message_id = ?message_id,
                "Email sent successfully via SendGrid"
            );
            Ok(SendReceipt { message_id })
        } else {
            let error_body = response.text().await.unwrap_or_default();
            error!(
                email_id = %message.id,
                status = %status,
                error = %error_body,
                "Failed to send email via SendGrid"
            );

            let error_message =
                if let Ok(sg_error) = serde_json::from_str::<SendGridError>(&error_body) {
                    sg_error
                        .errors
                        .into_iter()
                        .map(|e| e.message)
                        .collect::<Vec<_>>()
                        .join(", ")
                } else {
                    error_body
                };

            Err(EmailError::Provider(format!(
                "SendGrid error ({}): {}",
                status, error_message
            )))
        }
    }

    fn validate_config(&self) -> EmailResult<()> {
        if self.credentials.api_key.is_empty() {
            return Err(EmailError::Configuration(
                "SendGrid API key is empty".to_string(),
            ));
        }
        if !self.credentials.api_key.starts_with("SG.") {
            return Err(EmailError::Configuration(
                "Invalid SendGrid API key format".to_string(),
            ));
        }
        Ok(())
    }

    fn parse_webhook(&self, payload: &serde_json::Value) -> EmailResult<Vec<CanonicalEvent>> {
        let entries: Vec<serde_json::Value> = serde_json::from_value(payload.clone())
            .map_err(|e| EmailError::WebhookParse(format!("SendGrid payload: {}", e)))?;

        let mut events = Vec::new();
        for raw in entries {
            let parsed: SendGridEvent = match serde_json::from_value(raw.clone()) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed SendGrid event");
                    continue;
                }
            };

            let event_type = match parsed.event.as_str() {
                "delivered" => EventType::Delivered,
                "open" => EventType::Open,
                "click" => EventType::Click,
                "bounce" | "dropped" => EventType::Bounce,
                "spamreport" => EventType::Complaint,
                "unsubscribe" | "group_unsubscribe" => EventType::Unsubscribe,
                other => {
                    debug!(event = %other, "Ignoring untracked SendGrid event");
                    continue;
                }
            };

            let Some(message_id) = parsed.sg_message_id else {
                warn!(event = %parsed.event, "SendGrid event without message id");
                continue;
            };
            // SendGrid appends routing suffixes after the first dot.
            let message_id = message_id
                .split('.')
                .next()
                .unwrap_or(message_id.as_str())
                .to_string();

            let timestamp = parsed
                .timestamp
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
                .unwrap_or_else(Utc::now);

            events.push(CanonicalEvent {
                message_id,
                recipient: parsed.email,
                event_type,
                timestamp,
                provider: self.name().to_string(),
                raw_metadata: raw,
            });
        }

        Ok(events)
    }

    fn name(&self) -> &str {
        "sendgrid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> SendgridProvider {
        SendgridProvider::new(SendgridCredentials {
            api_key: "SG.test_key".to_string(),
            api_url: default_api_url(),
        })
    }

    #[test]
    fn test_validate_config() {
        assert!(provider().validate_config().is_ok());

        let bad = SendgridProvider::new(SendgridCredentials {
            api_key: "not-a-sendgrid-key".to_string(),
            api_url: default_api_url(),
        });
        assert!(bad.validate_config().is_err());
    }

    #[test]
    fn test_from_credentials_rejects_missing_key() {
        let result = SendgridProvider::from_credentials(&json!({"api_url": "http://x"}));
        assert!(matches!(result, Err(EmailError::Configuration(_))));
    }

    #[test]
    fn test_parse_webhook_maps_events() {
        let payload = json!([
            {
                "event": "delivered",
                "email": "user@example.com",
                "sg_message_id": "abc123.filter001",
                "timestamp": 1700000000
            },
            {
                "event": "spamreport",
                "email": "user@example.com",
                "sg_message_id": "abc123",
                "timestamp": 1700000100
            },
            {
                "event": "processed",
                "email": "user@example.com",
                "sg_message_id": "abc123"
            }
        ]);

        let events = provider().parse_webhook(&payload).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Delivered);
        assert_eq!(events[0].message_id, "abc123");
        assert_eq!(events[1].event_type, EventType::Complaint);
    }

    #[test]
    fn test_parse_webhook_rejects_non_array() {
        let result = provider().parse_webhook(&json!({"event": "delivered"}));
        assert!(matches!(result, Err(EmailError::WebhookParse(_))));
    }
}
