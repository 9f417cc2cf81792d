//! Mock email provider for testing

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{EmailProvider, SendReceipt};
use crate::error::{EmailError, EmailResult};
use crate::models::{CanonicalEvent, EmailMessage};

/// Mock email provider that captures sent emails.
///
/// Webhook payloads are expected in canonical event form, which lets tests
/// drive the full status pipeline without a real provider format.
pub struct MockProvider {
    sent_emails: Arc<Mutex<Vec<EmailMessage>>>,
    should_fail: bool,
    invalid_config: bool,
    failure_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MockCredentials {
    #[serde(default)]
    should_fail: bool,
    #[serde(default)]
    invalid_config: bool,
    #[serde(default)]
    failure_message: Option<String>,
}

impl MockProvider {
    /// Create a new mock provider
    pub fn new() -> Self {
        Self {
            sent_emails: Arc::new(Mutex::new(Vec::new())),
            should_fail: false,
            invalid_config: false,
            failure_message: None,
        }
    }

    /// Create a mock provider that always fails
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            sent_emails: Arc::new(Mutex::new(Vec::new())),
            should_fail: true,
            invalid_config: false,
            failure_message: Some(message.into()),
        }
    }

    pub fn from_credentials(credentials: &serde_json::Value) -> EmailResult<Self> {
        let creds: MockCredentials =
            serde_json::from_value(credentials.clone()).unwrap_or_default();
        Ok(Self {
            sent_emails: Arc::new(Mutex::new(Vec::new())),
            should_fail: creds.should_fail,
            invalid_config: creds.invalid_config,
            failure_message: creds.failure_message,
        })
    }

    /// Get all sent emails
    pub async fn sent_emails(&self) -> Vec<EmailMessage> {
        self.sent_emails.lock().await.clone()
    }

    /// Get the count of sent emails
    pub async fn sent_count(&self) -> usize {
        self.sent_emails.lock().await.len()
    }

    /// Check if an email was sent to a specific address
    pub async fn was_sent_to(&self, email: &str) -> bool {
        self.sent_emails
            .lock()
            .await
            .iter()
            .any(|e| e.recipients.iter().any(|r| r == email))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailProvider for MockProvider {
    async fn send_email(&self, message: &EmailMessage) -> EmailResult<SendReceipt> {
        if self.should_fail {
            let reason = self
                .failure_message
                .clone()
                .unwrap_or_else(|| "Mock failure".to_string());
            return Err(EmailError::Provider(reason));
        }

        self.sent_emails.lock().await.push(message.clone());

        Ok(SendReceipt {
            message_id: Some(format!("mock-{}", message.id)),
        })
    }

    fn validate_config(&self) -> EmailResult<()> {
        if self.invalid_config {
            return Err(EmailError::Configuration(
                "Mock credentials marked invalid".to_string(),
            ));
        }
        Ok(())
    }

    fn parse_webhook(&self, payload: &serde_json::Value) -> EmailResult<Vec<CanonicalEvent>> {
        // A single canonical event, or an array of them for batch payloads.
        if payload.is_array() {
            serde_json::from_value(payload.clone())
                .map_err(|e| EmailError::WebhookParse(format!("Mock payload: {}", e)))
        } else {
            let event: CanonicalEvent = serde_json::from_value(payload.clone())
                .map_err(|e| EmailError::WebhookParse(format!("Mock payload: {}", e)))?;
            Ok(vec![event])
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailMessage, Metadata, SendRequest, DEFAULT_MAX_ATTEMPTS};

    fn message(to: &str) -> EmailMessage {
        let request = SendRequest {
            to: vec![to.to_string()],
            template_id: "welcome".to_string(),
            variables: serde_json::json!({}),
            language: None,
            from: None,
            scheduled_at: None,
            priority: None,
            user_id: None,
            metadata: Metadata::default(),
        };
        EmailMessage::new_queued(
            &request,
            "noreply@example.com".to_string(),
            "Welcome".to_string(),
            "<p>hi</p>".to_string(),
            "hi".to_string(),
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    #[tokio::test]
    async fn test_mock_provider_sends_email() {
        let provider = MockProvider::new();
        let result = provider.send_email(&message("test@example.com")).await;
        assert!(result.is_ok());

        let sent = provider.sent_emails().await;
        assert_eq!(sent.len(), 1);
        assert!(provider.was_sent_to("test@example.com").await);
        assert!(!provider.was_sent_to("other@example.com").await);
    }

    #[tokio::test]
    async fn test_mock_provider_fails() {
        let provider = MockProvider::failing("Simulated failure");
        let result = provider.send_email(&message("test@example.com")).await;
        assert!(matches!(result, Err(EmailError::Provider(msg)) if msg.contains("Simulated")));
        assert_eq!(provider.sent_count().await, 0);
    }
}
