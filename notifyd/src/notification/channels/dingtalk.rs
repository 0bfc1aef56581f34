//! DingTalk work-notification channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    Capabilities, ChannelDriver, ConfigRejection, DINGTALK, SendParams, code_of, markdown,
    read_json, str_of,
};
use crate::credentials::{AccessToken, TokenCache, TokenSource};
use crate::database::models::ConfigContent;
use crate::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://oapi.dingtalk.com";

/// Codes meaning the access token is no longer valid.
const TOKEN_EXPIRED_CODES: &[i64] = &[40014, 42001];
/// Generic failure code whose `sub_code` carries the real reason.
const SUB_CODE_CARRIER: i64 = 88;

pub struct DingtalkDriver {
    client: Client,
    cache: Arc<TokenCache>,
    base_url: String,
}

impl DingtalkDriver {
    pub fn new(client: Client, cache: Arc<TokenCache>) -> Self {
        Self {
            client,
            cache,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Map a DingTalk response envelope to a result.
    fn check(body: &Value) -> Result<()> {
        let errcode = code_of(body, "errcode").unwrap_or(0);
        let sub_code = code_of(body, "sub_code");
        if TOKEN_EXPIRED_CODES.contains(&errcode)
            || sub_code.is_some_and(|c| TOKEN_EXPIRED_CODES.contains(&c))
        {
            return Err(Error::TokenExpired);
        }
        if errcode == 0 {
            return Ok(());
        }
        let reason = if errcode == SUB_CODE_CARRIER {
            format!("{} ({})", str_of(body, "sub_msg"), str_of(body, "sub_code"))
        } else {
            format!("{} ({})", str_of(body, "errmsg"), errcode)
        };
        Err(Error::vendor_rejected(reason))
    }

    async fn request_token(&self, config: &ConfigContent) -> Result<AccessToken> {
        let app_key = config.require(DINGTALK, "app_key")?;
        let app_secret = config.require(DINGTALK, "app_secret")?;
        let body = read_json(
            self.client
                .get(format!("{}/gettoken", self.base_url))
                .query(&[("appkey", app_key.as_str()), ("appsecret", app_secret.as_str())])
                .send()
                .await?,
        )
        .await?;
        Self::check(&body).map_err(|e| match e {
            // A token endpoint cannot report an expired token; treat as bad credentials.
            Error::TokenExpired => Error::vendor_rejected("invalid app credentials"),
            other => other,
        })?;
        let token = str_of(&body, "access_token");
        if token.is_empty() {
            return Err(Error::vendor_rejected("empty access_token"));
        }
        let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(7200);
        Ok(AccessToken::new(token, Duration::from_secs(expires_in)))
    }

    async fn send_with_token(&self, token: &str, agent_id: &str, params: &SendParams) -> Result<()> {
        let user_ids: Vec<&str> = params.receivers.iter().map(|r| r.contact.as_str()).collect();
        let payload = json!({
            "agent_id": agent_id,
            "userid_list": user_ids.join(","),
            "msg": {
                "msgtype": "markdown",
                "markdown": {
                    "title": params.title,
                    "text": markdown(&params.title, &params.message),
                }
            }
        });
        let body = read_json(
            self.client
                .post(format!(
                    "{}/topapi/message/corpconversation/asyncsend_v2",
                    self.base_url
                ))
                .query(&[("access_token", token)])
                .json(&payload)
                .send()
                .await?,
        )
        .await?;
        Self::check(&body)
    }
}

#[async_trait]
impl TokenSource for DingtalkDriver {
    fn channel(&self) -> &'static str {
        DINGTALK
    }

    async fn fetch_token(
        &self,
        _domain_id: &str,
        config: &ConfigContent,
        _force: bool,
    ) -> Result<AccessToken> {
        self.request_token(config).await
    }
}

#[async_trait]
impl ChannelDriver for DingtalkDriver {
    fn channel_type(&self) -> &'static str {
        DINGTALK
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_personal: true,
            is_pull_type: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let domain_id = params
            .receivers
            .first()
            .map(|r| r.domain_id.as_str())
            .ok_or_else(|| Error::input_invalid("no receiver"))?;
        let config = self.cache.credentials(DINGTALK, domain_id).await?;
        let agent_id = config.require(DINGTALK, "agent_id")?;

        self.cache
            .call_with_token(self, domain_id, |token| {
                let agent_id = agent_id.clone();
                async move { self.send_with_token(&token, &agent_id, params).await }
            })
            .await?;
        debug!(domain_id, receivers = params.receivers.len(), "DingTalk message sent");
        Ok(())
    }

    async fn validate_config(&self, config: &ConfigContent) -> std::result::Result<(), ConfigRejection> {
        if let Err(e) = config.require(DINGTALK, "agent_id") {
            return Err(ConfigRejection::new("agent_id is required", e));
        }
        self.request_token(config).await.map(|_| ()).map_err(|e| match e {
            Error::VendorRejected(_) => ConfigRejection::new("invalid app_key or app_secret", e),
            Error::IncompleteConfig { .. } => {
                ConfigRejection::new("app_key and app_secret are required", e)
            }
            other => ConfigRejection::new("unable to reach DingTalk", other),
        })
    }

    async fn contact_by_mobile(&self, mobile: &str, domain_id: &str) -> Result<String> {
        let body = self
            .cache
            .call_with_token(self, domain_id, |token| async move {
                let body = read_json(
                    self.client
                        .post(format!("{}/topapi/v2/user/getbymobile", self.base_url))
                        .query(&[("access_token", token.as_str())])
                        .json(&json!({ "mobile": mobile }))
                        .send()
                        .await?,
                )
                .await?;
                Self::check(&body)?;
                Ok(body)
            })
            .await?;
        let user_id = body
            .pointer("/result/userid")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if user_id.is_empty() {
            return Err(Error::not_found("DingTalk user", mobile));
        }
        Ok(user_id.to_string())
    }

    async fn get_access_token(&self, domain_id: &str) -> Result<String> {
        self.cache.access_token(self, domain_id).await
    }
}
