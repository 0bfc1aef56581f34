//! Feishu (Lark) bot-message channel.
//!
//! Tenant access tokens are also persisted through a [`FileTokenStore`] so
//! restarts do not burn through the vendor's token quota.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{
    Capabilities, ChannelDriver, ConfigRejection, FEISHU, SendParams, code_of, read_json, str_of,
};
use crate::credentials::{AccessToken, FileToken, FileTokenStore, TokenCache, TokenSource};
use crate::database::models::ConfigContent;
use crate::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://open.feishu.cn";

const TOKEN_EXPIRED_CODES: &[i64] = &[99991663, 99991661, 99991668];

pub struct FeishuDriver {
    client: Client,
    cache: Arc<TokenCache>,
    file_store: Arc<FileTokenStore>,
    base_url: String,
}

impl FeishuDriver {
    pub fn new(client: Client, cache: Arc<TokenCache>, file_store: Arc<FileTokenStore>) -> Self {
        Self {
            client,
            cache,
            file_store,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn check(body: &Value) -> Result<()> {
        match code_of(body, "code").unwrap_or(0) {
            0 => Ok(()),
            code if TOKEN_EXPIRED_CODES.contains(&code) => Err(Error::TokenExpired),
            code => Err(Error::vendor_rejected(format!(
                "{} ({})",
                str_of(body, "msg"),
                code
            ))),
        }
    }

    fn file_key(domain_id: &str) -> String {
        format!("{}_{}", FEISHU, domain_id)
    }

    async fn request_token(&self, config: &ConfigContent) -> Result<(String, i64)> {
        let app_id = config.require(FEISHU, "app_id")?;
        let app_secret = config.require(FEISHU, "app_secret")?;
        let body = read_json(
            self.client
                .post(format!(
                    "{}/open-apis/auth/v3/tenant_access_token/internal",
                    self.base_url
                ))
                .json(&json!({ "app_id": app_id, "app_secret": app_secret }))
                .send()
                .await?,
        )
        .await?;
        Self::check(&body).map_err(|e| match e {
            Error::TokenExpired => Error::vendor_rejected("invalid app credentials"),
            other => other,
        })?;
        let token = str_of(&body, "tenant_access_token");
        if token.is_empty() {
            return Err(Error::vendor_rejected("empty tenant_access_token"));
        }
        let expire = body.get("expire").and_then(Value::as_i64).unwrap_or(7200);
        Ok((token.to_string(), expire))
    }

    async fn send_with_token(&self, token: &str, user_id: &str, params: &SendParams) -> Result<()> {
        let text = if params.title.is_empty() {
            params.message.clone()
        } else {
            format!("{}\n{}", params.title, params.message)
        };
        let body = read_json(
            self.client
                .post(format!("{}/open-apis/im/v1/messages", self.base_url))
                .query(&[("receive_id_type", "user_id")])
                .bearer_auth(token)
                .json(&json!({
                    "receive_id": user_id,
                    "msg_type": "text",
                    "content": json!({ "text": text }).to_string(),
                }))
                .send()
                .await?,
        )
        .await?;
        Self::check(&body)
    }
}

#[async_trait]
impl TokenSource for FeishuDriver {
    fn channel(&self) -> &'static str {
        FEISHU
    }

    async fn fetch_token(
        &self,
        domain_id: &str,
        config: &ConfigContent,
        force: bool,
    ) -> Result<AccessToken> {
        let key = Self::file_key(domain_id);
        let now = chrono::Utc::now().timestamp();
        if !force && let Some(cached) = self.file_store.get(&key, now).await {
            debug!(domain_id, "Using file-cached Feishu token");
            return Ok(AccessToken::new(
                cached.value.clone(),
                Duration::from_secs(cached.remaining(now) as u64),
            ));
        }

        let (token, expire) = self.request_token(config).await?;
        let record = FileToken::new(token.clone(), expire, now);
        if let Err(e) = self.file_store.put(&key, &record).await {
            warn!(domain_id, error = %e, "Failed to persist Feishu token");
        }
        Ok(AccessToken::new(
            token,
            Duration::from_secs(record.remaining(now) as u64),
        ))
    }
}

#[async_trait]
impl ChannelDriver for FeishuDriver {
    fn channel_type(&self) -> &'static str {
        FEISHU
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_personal: true,
            is_pull_type: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let recipient = params.single()?;
        self.cache
            .call_with_token(self, &recipient.domain_id, |token| async move {
                self.send_with_token(&token, &recipient.contact, params).await
            })
            .await
    }

    async fn validate_config(&self, config: &ConfigContent) -> std::result::Result<(), ConfigRejection> {
        self.request_token(config).await.map(|_| ()).map_err(|e| match e {
            Error::VendorRejected(_) => ConfigRejection::new("invalid app_id or app_secret", e),
            Error::IncompleteConfig { .. } => {
                ConfigRejection::new("app_id and app_secret are required", e)
            }
            other => ConfigRejection::new("unable to reach Feishu", other),
        })
    }

    async fn contact_by_mobile(&self, mobile: &str, domain_id: &str) -> Result<String> {
        let body = self
            .cache
            .call_with_token(self, domain_id, |token| async move {
                let body = read_json(
                    self.client
                        .post(format!(
                            "{}/open-apis/contact/v3/users/batch_get_id",
                            self.base_url
                        ))
                        .query(&[("user_id_type", "user_id")])
                        .bearer_auth(&token)
                        .json(&json!({ "mobiles": [mobile] }))
                        .send()
                        .await?,
                )
                .await?;
                Self::check(&body)?;
                Ok(body)
            })
            .await?;
        body.pointer("/data/user_list")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|u| u.get("user_id").and_then(Value::as_str))
            .find(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::not_found("Feishu user", mobile))
    }

    async fn get_access_token(&self, domain_id: &str) -> Result<String> {
        self.cache.access_token(self, domain_id).await
    }
}
