//! Credential and access-token cache keyed by `(channel, domain_id)`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::database::models::ConfigContent;
use crate::database::repositories::ConfigRepository;
use crate::database::time::now_ms;
use crate::notification::channels::CONFIG_CHANNELS;
use crate::{Error, Result};

/// A vendor access token.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub value: String,
    pub expires_in: Duration,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            value: value.into(),
            expires_in,
        }
    }
}

/// Exchanges channel credentials for an access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn channel(&self) -> &'static str;

    /// Fetch a token from the vendor. `force` bypasses any secondary cache
    /// the source keeps of its own.
    async fn fetch_token(
        &self,
        domain_id: &str,
        config: &ConfigContent,
        force: bool,
    ) -> Result<AccessToken>;
}

type Key = (String, String);

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: i64,
}

pub struct TokenCache {
    repo: Arc<dyn ConfigRepository>,
    configs: RwLock<HashMap<Key, ConfigContent>>,
    tokens: RwLock<HashMap<Key, CachedToken>>,
    /// Per-key locks so only one refresh hits the vendor at a time.
    refresh_locks: DashMap<Key, Arc<Mutex<()>>>,
}

fn key(channel: &str, domain_id: &str) -> Key {
    (channel.to_string(), domain_id.to_string())
}

impl TokenCache {
    pub fn new(repo: Arc<dyn ConfigRepository>) -> Self {
        Self {
            repo,
            configs: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            refresh_locks: DashMap::new(),
        }
    }

    /// Credentials for `channel` in `domain_id`.
    ///
    /// The domain's own row wins; a system-attribution row is the only
    /// fallback. Another domain's row is never used.
    pub async fn credentials(&self, channel: &str, domain_id: &str) -> Result<ConfigContent> {
        if !CONFIG_CHANNELS.contains(&channel) {
            return Err(Error::NotSupported(format!(
                "channel '{}' has no credentials",
                channel
            )));
        }
        let k = key(channel, domain_id);
        let cached = self.configs.read().get(&k).cloned();
        if let Some(content) = cached {
            return Ok(content);
        }

        let row = match self.repo.find_config(channel, domain_id).await? {
            Some(row) => row,
            None => self.repo.find_system_config(channel).await?.ok_or_else(|| {
                Error::incomplete_config(
                    channel,
                    format!("no config for domain '{}'", domain_id),
                )
            })?,
        };
        let content = row.content()?;
        self.configs.write().insert(k, content.clone());
        Ok(content)
    }

    /// The cached token for the source's channel, fetching one if missing
    /// or expired.
    pub async fn access_token(&self, source: &dyn TokenSource, domain_id: &str) -> Result<String> {
        let k = key(source.channel(), domain_id);
        if let Some(token) = self.valid_token(&k) {
            return Ok(token);
        }

        let lock = self.refresh_lock(&k);
        let _guard = lock.lock().await;

        // Another task may have fetched while we waited.
        if let Some(token) = self.valid_token(&k) {
            return Ok(token);
        }
        self.fetch_and_store(source, domain_id, k, false).await
    }

    /// Replace `stale` with a fresh token.
    ///
    /// When a concurrent caller already replaced it, that token is returned
    /// without another vendor round trip.
    pub async fn refresh_token(
        &self,
        source: &dyn TokenSource,
        domain_id: &str,
        stale: &str,
    ) -> Result<String> {
        let k = key(source.channel(), domain_id);
        let lock = self.refresh_lock(&k);
        let _guard = lock.lock().await;

        if let Some(token) = self.valid_token(&k)
            && token != stale
        {
            return Ok(token);
        }
        self.fetch_and_store(source, domain_id, k, true).await
    }

    /// Run `call` with the current token; on [`Error::TokenExpired`] refresh
    /// once and retry. A second failure is returned as is.
    pub async fn call_with_token<T, F, Fut>(
        &self,
        source: &dyn TokenSource,
        domain_id: &str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.access_token(source, domain_id).await?;
        match call(token.clone()).await {
            Err(Error::TokenExpired) => {
                debug!(channel = source.channel(), domain_id, "Access token rejected, refreshing");
                let fresh = self.refresh_token(source, domain_id, &token).await?;
                call(fresh).await
            }
            other => other,
        }
    }

    /// Seed a token directly.
    pub fn put_token(&self, channel: &str, domain_id: &str, value: &str, expires_in: Duration) {
        self.tokens.write().insert(
            key(channel, domain_id),
            CachedToken {
                value: value.to_string(),
                expires_at: now_ms().saturating_add(expires_in.as_millis() as i64),
            },
        );
    }

    /// Drop cached credentials and token for the key.
    pub fn invalidate(&self, channel: &str, domain_id: &str) {
        let k = key(channel, domain_id);
        self.configs.write().remove(&k);
        self.tokens.write().remove(&k);
        debug!(channel, domain_id, "Invalidated credential cache");
    }

    /// Drop every cached entry of `channel`.
    ///
    /// Used when a system-attribution row changes, since any domain may be
    /// falling back to it.
    pub fn invalidate_channel(&self, channel: &str) {
        self.configs.write().retain(|(c, _), _| c != channel);
        self.tokens.write().retain(|(c, _), _| c != channel);
    }

    fn valid_token(&self, k: &Key) -> Option<String> {
        let tokens = self.tokens.read();
        tokens
            .get(k)
            .filter(|t| t.expires_at > now_ms())
            .map(|t| t.value.clone())
    }

    fn refresh_lock(&self, k: &Key) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(k.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn fetch_and_store(
        &self,
        source: &dyn TokenSource,
        domain_id: &str,
        k: Key,
        force: bool,
    ) -> Result<String> {
        let config = self.credentials(source.channel(), domain_id).await?;
        let token = source.fetch_token(domain_id, &config, force).await?;
        info!(
            channel = source.channel(),
            domain_id,
            expires_in_secs = token.expires_in.as_secs(),
            "Fetched access token"
        );
        self.tokens.write().insert(
            k,
            CachedToken {
                value: token.value.clone(),
                expires_at: now_ms().saturating_add(token.expires_in.as_millis() as i64),
            },
        );
        Ok(token.value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::database::models::{Attribution, ConfigDbModel, SYSTEM_DOMAIN_ID};
    use crate::database::repositories::SqlxConfigRepository;
    use crate::database::test_pool;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        fn channel(&self) -> &'static str {
            "dingtalk"
        }

        async fn fetch_token(
            &self,
            _domain_id: &str,
            config: &ConfigContent,
            _force: bool,
        ) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let key = config.require("dingtalk", "app_key")?;
            Ok(AccessToken::new(format!("{}-{}", key, n), Duration::from_secs(7200)))
        }
    }

    async fn cache_with(rows: &[(&str, Attribution, &str)]) -> TokenCache {
        let repo = Arc::new(SqlxConfigRepository::new(test_pool().await));
        for (domain, attribution, app_key) in rows {
            let content = ConfigContent::from_pairs([("app_key", *app_key), ("app_secret", "s")]);
            let row = ConfigDbModel::new("dingtalk", *domain, *attribution, &content).unwrap();
            repo.create_config(&row).await.unwrap();
        }
        TokenCache::new(repo)
    }

    #[tokio::test]
    async fn test_credentials_fallback_rules() {
        let cache = cache_with(&[("D1", Attribution::Domain, "d1")]).await;
        assert_eq!(
            cache.credentials("dingtalk", "D1").await.unwrap().get("app_key").as_deref(),
            Some("d1")
        );
        // Never borrow another domain's credentials.
        assert!(matches!(
            cache.credentials("dingtalk", "D2").await,
            Err(Error::IncompleteConfig { .. })
        ));
        assert!(matches!(
            cache.credentials("webhook", "D1").await,
            Err(Error::NotSupported(_))
        ));

        let cache = cache_with(&[
            ("D1", Attribution::Domain, "d1"),
            (SYSTEM_DOMAIN_ID, Attribution::System, "sys"),
        ])
        .await;
        assert_eq!(
            cache.credentials("dingtalk", "D2").await.unwrap().get("app_key").as_deref(),
            Some("sys")
        );
    }

    #[tokio::test]
    async fn test_access_token_is_cached() {
        let cache = cache_with(&[("D1", Attribution::Domain, "k")]).await;
        let source = CountingSource {
            calls: AtomicUsize::new(0),
        };
        assert_eq!(cache.access_token(&source, "D1").await.unwrap(), "k-1");
        assert_eq!(cache.access_token(&source, "D1").await.unwrap(), "k-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_with_token_refreshes_exactly_once() {
        let cache = cache_with(&[("D1", Attribution::Domain, "k")]).await;
        cache.put_token("dingtalk", "D1", "stale", Duration::from_secs(600));
        let source = CountingSource {
            calls: AtomicUsize::new(0),
        };
        let attempts = AtomicUsize::new(0);

        let used = cache
            .call_with_token(&source, "D1", |token| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if token == "stale" {
                        Err(Error::TokenExpired)
                    } else {
                        Ok(token)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(used, "k-1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // A second expiry is surfaced, not retried again.
        let result: Result<()> = cache
            .call_with_token(&source, "D1", |_| async { Err(Error::TokenExpired) })
            .await;
        assert!(matches!(result, Err(Error::TokenExpired)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_skips_when_already_replaced() {
        let cache = cache_with(&[("D1", Attribution::Domain, "k")]).await;
        cache.put_token("dingtalk", "D1", "fresh", Duration::from_secs(600));
        let source = CountingSource {
            calls: AtomicUsize::new(0),
        };
        let token = cache.refresh_token(&source, "D1", "older").await.unwrap();
        assert_eq!(token, "fresh");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalidate_drops_config() {
        let cache = cache_with(&[("D1", Attribution::Domain, "k")]).await;
        cache.credentials("dingtalk", "D1").await.unwrap();
        cache.put_token("dingtalk", "D1", "t", Duration::from_secs(600));
        cache.invalidate("dingtalk", "D1");
        assert!(cache.valid_token(&key("dingtalk", "D1")).is_none());
    }
}
