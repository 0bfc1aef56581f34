//! Websocket service channel: messages are posted to an external push service.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{Capabilities, ChannelDriver, ConfigRejection, SendParams, WEBSOCKET, expect_success};
use crate::credentials::TokenCache;
use crate::database::models::ConfigContent;
use crate::{Error, Result};

pub struct WebsocketDriver {
    client: Client,
    cache: Arc<TokenCache>,
}

impl WebsocketDriver {
    pub fn new(client: Client, cache: Arc<TokenCache>) -> Self {
        Self { client, cache }
    }
}

#[async_trait]
impl ChannelDriver for WebsocketDriver {
    fn channel_type(&self) -> &'static str {
        WEBSOCKET
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_personal: true,
            is_system_config: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let recipient = params.single()?;
        let config = self.cache.credentials(WEBSOCKET, &recipient.domain_id).await?;
        let url = config.require(WEBSOCKET, "url")?;

        expect_success(
            self.client
                .post(&url)
                .json(&json!({
                    "receiver_id": recipient.contact,
                    "title": params.title,
                    "content": params.message,
                    "topic": params.topic,
                    "priority": params.priority,
                }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn validate_config(&self, config: &ConfigContent) -> std::result::Result<(), ConfigRejection> {
        let url = config
            .require(WEBSOCKET, "url")
            .map_err(|e| ConfigRejection::new("url is required", e))?;
        url::Url::parse(&url)
            .map(|_| ())
            .map_err(|e| ConfigRejection::new("invalid url", Error::input_invalid(e.to_string())))
    }
}
