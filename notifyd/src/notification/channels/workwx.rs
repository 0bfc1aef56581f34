//! WeCom (WeChat Work) application-message channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::{
    Capabilities, ChannelDriver, ConfigRejection, ContactFailure, SendParams, WORKWX, code_of,
    markdown, read_json, str_of,
};
use crate::credentials::{AccessToken, TokenCache, TokenSource};
use crate::database::models::ConfigContent;
use crate::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://qyapi.weixin.qq.com";

const TOKEN_EXPIRED_CODES: &[i64] = &[40014, 42001];

pub struct WorkwxDriver {
    client: Client,
    cache: Arc<TokenCache>,
    base_url: String,
}

impl WorkwxDriver {
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

    fn check(body: &Value) -> Result<()> {
        match code_of(body, "errcode").unwrap_or(0) {
            0 => Ok(()),
            code if TOKEN_EXPIRED_CODES.contains(&code) => Err(Error::TokenExpired),
            code => Err(Error::vendor_rejected(format!(
                "{} ({})",
                str_of(body, "errmsg"),
                code
            ))),
        }
    }

    async fn request_token(&self, config: &ConfigContent) -> Result<AccessToken> {
        let corp_id = config.require(WORKWX, "corp_id")?;
        let secret = config.require(WORKWX, "secret")?;
        let body = read_json(
            self.client
                .get(format!("{}/cgi-bin/gettoken", self.base_url))
                .query(&[("corpid", corp_id.as_str()), ("corpsecret", secret.as_str())])
                .send()
                .await?,
        )
        .await?;
        Self::check(&body).map_err(|e| match e {
            Error::TokenExpired => Error::vendor_rejected("invalid corp credentials"),
            other => other,
        })?;
        let token = str_of(&body, "access_token");
        if token.is_empty() {
            return Err(Error::vendor_rejected("empty access_token"));
        }
        let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(7200);
        Ok(AccessToken::new(token, Duration::from_secs(expires_in)))
    }

    /// Send to every receiver in one call; returns the ids WeCom reported invalid.
    async fn deliver(&self, params: &SendParams) -> Result<Vec<String>> {
        let domain_id = params
            .receivers
            .first()
            .map(|r| r.domain_id.as_str())
            .ok_or_else(|| Error::input_invalid("no receiver"))?;
        let config = self.cache.credentials(WORKWX, domain_id).await?;
        let agent_id = config.require(WORKWX, "agent_id")?;
        let to_user = params
            .receivers
            .iter()
            .map(|r| r.contact.as_str())
            .collect::<Vec<_>>()
            .join("|");
        let payload = json!({
            "touser": to_user,
            "msgtype": "markdown",
            "agentid": agent_id.parse::<i64>().unwrap_or_default(),
            "markdown": { "content": markdown(&params.title, &params.message) },
        });

        let body = self
            .cache
            .call_with_token(self, domain_id, |token| {
                let payload = &payload;
                async move {
                    let body = read_json(
                        self.client
                            .post(format!("{}/cgi-bin/message/send", self.base_url))
                            .query(&[("access_token", token.as_str())])
                            .json(payload)
                            .send()
                            .await?,
                    )
                    .await?;
                    Self::check(&body)?;
                    Ok(body)
                }
            })
            .await?;

        Ok(str_of(&body, "invaliduser")
            .split('|')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl TokenSource for WorkwxDriver {
    fn channel(&self) -> &'static str {
        WORKWX
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
impl ChannelDriver for WorkwxDriver {
    fn channel_type(&self) -> &'static str {
        WORKWX
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_personal: true,
            is_pull_type: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let invalid = self.deliver(params).await?;
        if let Some(user) = invalid.first() {
            return Err(Error::vendor_rejected(format!("invalid user {}", user)));
        }
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn send_batch(&self, params: &SendParams) -> Result<Vec<ContactFailure>> {
        let invalid = self.deliver(params).await?;
        Ok(invalid
            .into_iter()
            .map(|contact| ContactFailure {
                error: Error::vendor_rejected(format!("invalid user {}", contact)),
                contact,
            })
            .collect())
    }

    async fn validate_config(&self, config: &ConfigContent) -> std::result::Result<(), ConfigRejection> {
        if let Err(e) = config.require(WORKWX, "agent_id") {
            return Err(ConfigRejection::new("agent_id is required", e));
        }
        self.request_token(config).await.map(|_| ()).map_err(|e| match e {
            Error::VendorRejected(_) => ConfigRejection::new("invalid corp_id or secret", e),
            Error::IncompleteConfig { .. } => {
                ConfigRejection::new("corp_id and secret are required", e)
            }
            other => ConfigRejection::new("unable to reach WeCom", other),
        })
    }

    async fn contact_by_mobile(&self, mobile: &str, domain_id: &str) -> Result<String> {
        let body = self
            .cache
            .call_with_token(self, domain_id, |token| async move {
                let body = read_json(
                    self.client
                        .post(format!("{}/cgi-bin/user/getuserid", self.base_url))
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
        match str_of(&body, "userid") {
            "" => Err(Error::not_found("WeCom user", mobile)),
            id => Ok(id.to_string()),
        }
    }

    async fn get_access_token(&self, domain_id: &str) -> Result<String> {
        self.cache.access_token(self, domain_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_codes() {
        assert!(WorkwxDriver::check(&json!({"errcode": 0, "errmsg": "ok"})).is_ok());
        assert!(matches!(
            WorkwxDriver::check(&json!({"errcode": 42001})),
            Err(Error::TokenExpired)
        ));
        assert!(matches!(
            WorkwxDriver::check(&json!({"errcode": 81013, "errmsg": "user invalid"})),
            Err(Error::VendorRejected(_))
        ));
    }
}
