//! Provider gateway: builds provider instances from stored configuration and
//! routes sends through them with priority-ordered failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{EmailError, EmailResult};
use crate::models::{EmailMessage, ProviderConfig, ProviderKind};
use crate::providers::{
    EmailProvider, MailgunProvider, MockProvider, SendReceipt, SendgridProvider, SmtpProvider,
};
use crate::repository::ProviderRepository;

/// How long cached provider instances and the active-provider list stay
/// fresh before the next use re-reads the store.
pub const PROVIDER_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default per-attempt send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a gateway send: the receipt plus the provider that took it.
#[derive(Debug, Clone)]
pub struct GatewaySend {
    pub receipt: SendReceipt,
    pub provider: String,
}

struct CachedInstance {
    provider: Arc<dyn EmailProvider>,
    cached_at: Instant,
}

struct CachedList {
    configs: Vec<ProviderConfig>,
    cached_at: Instant,
}

/// Routes sends through configured providers in ascending priority order.
///
/// Provider instances and the active-provider list are cached with a TTL so
/// the hot path does not hit the store; `invalidate_cache` forces a reload
/// after configuration changes.
pub struct ProviderGateway {
    repository: Arc<dyn ProviderRepository>,
    send_timeout: Duration,
    cache_ttl: Duration,
    instances: RwLock<HashMap<String, CachedInstance>>,
    active: RwLock<Option<CachedList>>,
}

impl ProviderGateway {
    pub fn new(repository: Arc<dyn ProviderRepository>) -> Self {
        Self::with_timeouts(repository, DEFAULT_SEND_TIMEOUT, PROVIDER_CACHE_TTL)
    }

    pub fn with_timeouts(
        repository: Arc<dyn ProviderRepository>,
        send_timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            repository,
            send_timeout,
            cache_ttl,
            instances: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        }
    }

    /// Build a provider instance from its stored configuration.
    fn build_provider(config: &ProviderConfig) -> EmailResult<Arc<dyn EmailProvider>> {
        let provider: Arc<dyn EmailProvider> = match config.kind {
            ProviderKind::Sendgrid => {
                Arc::new(SendgridProvider::from_credentials(&config.credentials)?)
            }
            ProviderKind::Mailgun => {
                Arc::new(MailgunProvider::from_credentials(&config.credentials)?)
            }
            ProviderKind::Smtp => Arc::new(SmtpProvider::from_credentials(&config.credentials)?),
            ProviderKind::Mock => Arc::new(MockProvider::from_credentials(&config.credentials)?),
        };
        Ok(provider)
    }

    /// Get or build the cached instance for a provider config.
    async fn instance(&self, config: &ProviderConfig) -> EmailResult<Arc<dyn EmailProvider>> {
        {
            let instances = self.instances.read().await;
            if let Some(cached) = instances.get(&config.name) {
                if cached.cached_at.elapsed() < self.cache_ttl {
                    return Ok(cached.provider.clone());
                }
            }
        }

        let provider = Self::build_provider(config)?;
        self.instances.write().await.insert(
            config.name.clone(),
            CachedInstance {
                provider: provider.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(provider)
    }

    /// Active provider configs in ascending priority order. Falls back to a
    /// local SMTP provider when nothing is configured, so development
    /// environments work out of the box.
    pub async fn active_providers(&self) -> EmailResult<Vec<ProviderConfig>> {
        {
            let active = self.active.read().await;
            if let Some(cached) = active.as_ref() {
                if cached.cached_at.elapsed() < self.cache_ttl {
                    return Ok(cached.configs.clone());
                }
            }
        }

        // Store outages degrade to the default provider instead of failing
        // the send path outright.
        let mut configs = match self.repository.list_active().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "Provider store unavailable, falling back to local SMTP");
                return Ok(vec![default_smtp_config()]);
            }
        };
        if configs.is_empty() {
            warn!("No active email providers configured, falling back to local SMTP");
            configs.push(default_smtp_config());
        }

        *self.active.write().await = Some(CachedList {
            configs: configs.clone(),
            cached_at: Instant::now(),
        });
        Ok(configs)
    }

    /// Look up a provider instance by name, for webhook parsing.
    pub async fn provider_named(&self, name: &str) -> EmailResult<Arc<dyn EmailProvider>> {
        for config in self.active_providers().await? {
            if config.name == name {
                return self.instance(&config).await;
            }
        }
        // Not in the active set; check the store directly so webhooks from a
        // recently deactivated provider still parse.
        match self.repository.get(name).await? {
            Some(config) => self.instance(&config).await,
            None => Err(EmailError::Configuration(format!(
                "Unknown provider '{}'",
                name
            ))),
        }
    }

    /// Select the highest-priority active provider whose configuration
    /// validates. Candidates that fail to build or validate are skipped.
    async fn select_provider(&self) -> EmailResult<(Arc<dyn EmailProvider>, String)> {
        for config in self.active_providers().await? {
            let provider = match self.instance(&config).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(provider = %config.name, error = %e, "Skipping provider that failed to build");
                    continue;
                }
            };

            if let Err(e) = provider.validate_config() {
                warn!(provider = %config.name, error = %e, "Skipping provider with invalid config");
                continue;
            }

            debug!(provider = %config.name, priority = config.priority, "Provider selected");
            return Ok((provider, config.name));
        }

        Err(EmailError::NoProviderAvailable)
    }

    /// Send through the selected provider.
    ///
    /// Failover happens at selection time only: invalid candidates are
    /// skipped, then the chosen provider gets exactly one timed attempt. A
    /// send error or timeout is returned to the caller; the queue processor's
    /// retry re-runs selection, which may land on a different provider.
    pub async fn send(&self, message: &EmailMessage) -> EmailResult<GatewaySend> {
        let (provider, name) = self.select_provider().await?;

        match tokio::time::timeout(self.send_timeout, provider.send_email(message)).await {
            Ok(Ok(receipt)) => {
                info!(
                    email_id = %message.id,
                    provider = %name,
                    message_id = ?receipt.message_id,
                    "Provider accepted message"
                );
                Ok(GatewaySend {
                    receipt,
                    provider: name,
                })
            }
            Ok(Err(e)) => {
                warn!(email_id = %message.id, provider = %name, error = %e, "Provider send failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    email_id = %message.id,
                    provider = %name,
                    timeout_secs = self.send_timeout.as_secs(),
                    "Provider send timed out"
                );
                Err(EmailError::Provider(format!(
                    "Send via '{}' timed out after {}s",
                    name,
                    self.send_timeout.as_secs()
                )))
            }
        }
    }

    /// Drop all cached instances and the active list. The next send rebuilds
    /// them from the store.
    pub async fn invalidate_cache(&self) {
        self.instances.write().await.clear();
        *self.active.write().await = None;
        debug!("Provider caches invalidated");
    }
}

fn default_smtp_config() -> ProviderConfig {
    ProviderConfig {
        name: "smtp-local".to_string(),
        kind: ProviderKind::Smtp,
        credentials: serde_json::json!({
            "host": "localhost",
            "port": 1025,
            "use_tls": false
        }),
        priority: i32::MAX,
        is_active: true,
    }
}
