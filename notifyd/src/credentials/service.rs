//! Channel config management.

use std::sync::Arc;

use tracing::info;

use super::TokenCache;
use crate::database::models::{Attribution, ConfigContent, ConfigDbModel, SYSTEM_DOMAIN_ID};
use crate::database::repositories::ConfigRepository;
use crate::database::time::now_ms;
use crate::notification::channels::{CONFIG_CHANNELS, DriverRegistry};
use crate::{Error, Result};

/// Outcome of a config validation, suitable for showing to an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidation {
    pub valid: bool,
    pub message: String,
}

pub struct ConfigService {
    repo: Arc<dyn ConfigRepository>,
    drivers: Arc<DriverRegistry>,
    cache: Arc<TokenCache>,
}

impl ConfigService {
    pub fn new(
        repo: Arc<dyn ConfigRepository>,
        drivers: Arc<DriverRegistry>,
        cache: Arc<TokenCache>,
    ) -> Self {
        Self {
            repo,
            drivers,
            cache,
        }
    }

    fn check_channel(&self, channel: &str) -> Result<()> {
        if !CONFIG_CHANNELS.contains(&channel) {
            return Err(Error::input_invalid(format!(
                "channel '{}' does not take a config",
                channel
            )));
        }
        self.drivers.get(channel).map(|_| ())
    }

    /// Store credentials for `(channel, domain_id)`. System-attributed
    /// configs are stored under the system domain regardless of
    /// `domain_id`.
    pub async fn create_config(
        &self,
        channel: &str,
        domain_id: &str,
        attribution: Attribution,
        content: &ConfigContent,
    ) -> Result<ConfigDbModel> {
        self.check_channel(channel)?;
        let domain_id = match attribution {
            Attribution::System => SYSTEM_DOMAIN_ID,
            Attribution::Domain if domain_id.is_empty() => {
                return Err(Error::input_invalid("domain id is required"));
            }
            Attribution::Domain => domain_id,
        };
        if self.repo.find_config(channel, domain_id).await?.is_some() {
            return Err(Error::Duplicate(format!(
                "config for {} in domain {} already exists",
                channel, domain_id
            )));
        }

        let config = ConfigDbModel::new(channel, domain_id, attribution, content)?;
        self.repo.create_config(&config).await?;
        self.invalidate(&config);
        info!(channel, domain_id, config_id = %config.id, "Channel config created");
        Ok(config)
    }

    pub async fn update_config(&self, id: &str, content: &ConfigContent) -> Result<ConfigDbModel> {
        let mut config = self.repo.get_config(id).await?;
        config.content = serde_json::to_string(&content.0)?;
        config.updated_at = now_ms();
        self.repo.update_config(&config).await?;
        self.invalidate(&config);
        info!(channel = %config.channel, domain_id = %config.domain_id, "Channel config updated");
        Ok(config)
    }

    pub async fn delete_config(&self, id: &str) -> Result<()> {
        let config = self.repo.get_config(id).await?;
        self.repo.delete_config(id).await?;
        self.invalidate(&config);
        info!(channel = %config.channel, domain_id = %config.domain_id, "Channel config deleted");
        Ok(())
    }

    pub async fn get_config(&self, id: &str) -> Result<ConfigDbModel> {
        self.repo.get_config(id).await
    }

    /// Ask the channel driver whether `content` would work.
    pub async fn validate_config(
        &self,
        channel: &str,
        content: &ConfigContent,
    ) -> Result<ConfigValidation> {
        self.check_channel(channel)?;
        let driver = self.drivers.get(channel)?;
        Ok(match driver.validate_config(content).await {
            Ok(()) => ConfigValidation {
                valid: true,
                message: String::new(),
            },
            Err(rejection) => {
                info!(channel, error = %rejection.error, "Config rejected by driver");
                ConfigValidation {
                    valid: false,
                    message: rejection.message,
                }
            }
        })
    }

    pub async fn configured_channels(&self, domain_id: &str) -> Result<Vec<String>> {
        self.repo.list_configured_channels(domain_id).await
    }

    /// System rows back every domain without its own config, so their
    /// tokens are dropped channel-wide.
    fn invalidate(&self, config: &ConfigDbModel) {
        if config.attribution == Attribution::System.as_str() {
            self.cache.invalidate_channel(&config.channel);
        } else {
            self.cache.invalidate(&config.channel, &config.domain_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::database::repositories::SqlxConfigRepository;
    use crate::database::test_pool;
    use crate::notification::channels::{EMAIL, EmailDriver, WEBHOOK, WebhookDriver};
    use crate::utils::http_client::build_client;

    async fn setup() -> (ConfigService, Arc<TokenCache>) {
        let pool = test_pool().await;
        let repo: Arc<dyn ConfigRepository> = Arc::new(SqlxConfigRepository::new(pool));
        let cache = Arc::new(TokenCache::new(repo.clone()));
        let client = build_client(Duration::from_secs(5));
        let mut drivers = DriverRegistry::new();
        drivers
            .register(Arc::new(EmailDriver::new(cache.clone(), false, Duration::from_secs(5))))
            .register(Arc::new(WebhookDriver::new(client)));
        (ConfigService::new(repo, Arc::new(drivers), cache.clone()), cache)
    }

    fn smtp() -> ConfigContent {
        ConfigContent::from_pairs([
            ("hostname", "smtp.example.com"),
            ("hostport", "25"),
            ("username", "notify"),
            ("password", "secret"),
            ("sender_address", "notify@example.com"),
        ])
    }

    #[tokio::test]
    async fn test_duplicate_config_rejected() {
        let (service, _) = setup().await;
        service
            .create_config(EMAIL, "D1", Attribution::Domain, &smtp())
            .await
            .unwrap();
        let err = service
            .create_config(EMAIL, "D1", Attribution::Domain, &smtp())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        // A different domain is a different key.
        service
            .create_config(EMAIL, "D2", Attribution::Domain, &smtp())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_config_channel_rejected() {
        let (service, _) = setup().await;
        let err = service
            .create_config(WEBHOOK, "D1", Attribution::Domain, &smtp())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));
    }

    #[tokio::test]
    async fn test_system_config_listed_for_every_domain() {
        let (service, _) = setup().await;
        let config = service
            .create_config(EMAIL, "ignored", Attribution::System, &smtp())
            .await
            .unwrap();
        assert_eq!(config.domain_id, SYSTEM_DOMAIN_ID);
        assert!(service.configured_channels("D9").await.unwrap().contains(&EMAIL.to_string()));
    }

    #[tokio::test]
    async fn test_update_invalidates_cached_credentials() {
        let (service, cache) = setup().await;
        let config = service
            .create_config(EMAIL, "D1", Attribution::Domain, &smtp())
            .await
            .unwrap();
        let cached = cache.credentials(EMAIL, "D1").await.unwrap();
        assert_eq!(cached.get("hostname").as_deref(), Some("smtp.example.com"));

        let mut content = smtp();
        content.insert("hostname", "smtp2.example.com");
        service.update_config(&config.id, &content).await.unwrap();
        let cached = cache.credentials(EMAIL, "D1").await.unwrap();
        assert_eq!(cached.get("hostname").as_deref(), Some("smtp2.example.com"));

        service.delete_config(&config.id).await.unwrap();
        assert!(service.get_config(&config.id).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_missing_fields() {
        let (service, _) = setup().await;
        let result = service
            .validate_config(EMAIL, &ConfigContent::default())
            .await
            .unwrap();
        assert!(!result.valid);
        assert!(!result.message.is_empty());
    }
}
