//! Generic webhook channel.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Capabilities, ChannelDriver, SendParams, WEBHOOK, expect_success};
use crate::utils::json::parse_object;
use crate::{Error, Result};

/// Header carrying the upper-cased event name.
pub const EVENT_HEADER: &str = "X-Yunion-Event";

const DEFAULT_MSG_KEY: &str = "Msg";

pub struct WebhookDriver {
    client: Client,
}

impl WebhookDriver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn build_headers(params: &SendParams) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &params.header {
            match (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid webhook header"),
            }
        }
        if let Ok(value) = HeaderValue::from_str(&params.event.to_uppercase()) {
            headers.insert(HeaderName::from_static("x-yunion-event"), value);
        }
        headers
    }

    /// JSON objects go out verbatim; anything else is wrapped under the
    /// message key and merged into the configured body.
    fn build_payload(params: &SendParams) -> Value {
        if let Some(object) = parse_object(&params.message) {
            return Value::Object(object);
        }
        let mut body: Map<String, Value> = params.body.clone();
        let key = if params.msg_key.is_empty() {
            DEFAULT_MSG_KEY
        } else {
            params.msg_key.as_str()
        };
        body.insert(key.to_string(), Value::String(params.message.clone()));
        Value::Object(body)
    }
}

#[async_trait]
impl ChannelDriver for WebhookDriver {
    fn channel_type(&self) -> &'static str {
        WEBHOOK
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_robot: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let url = &params.single()?.contact;
        if url.is_empty() {
            return Err(Error::input_invalid("empty webhook address"));
        }

        let response = self
            .client
            .post(url)
            .headers(Self::build_headers(params))
            .json(&Self::build_payload(params))
            .send()
            .await?;
        expect_success(response).await?;

        debug!(event = %params.event, "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_message_is_verbatim() {
        let params = SendParams {
            message: r#"{"resource_type":"server"}"#.to_string(),
            msg_key: "text".to_string(),
            ..Default::default()
        };
        assert_eq!(
            WebhookDriver::build_payload(&params),
            json!({"resource_type": "server"})
        );
    }

    #[test]
    fn test_plain_message_is_wrapped() {
        let mut params = SendParams {
            message: "disk full".to_string(),
            ..Default::default()
        };
        assert_eq!(WebhookDriver::build_payload(&params), json!({"Msg": "disk full"}));

        params.msg_key = "content".to_string();
        params.body.insert("source".to_string(), json!("cloud"));
        assert_eq!(
            WebhookDriver::build_payload(&params),
            json!({"content": "disk full", "source": "cloud"})
        );
    }

    #[test]
    fn test_event_header_is_upper_case() {
        let mut params = SendParams {
            event: "server/create".to_string(),
            ..Default::default()
        };
        params.header.insert("X-Token".to_string(), "abc".to_string());
        params.header.insert("bad header".to_string(), "x".to_string());
        let headers = WebhookDriver::build_headers(&params);
        assert_eq!(headers.get(EVENT_HEADER).unwrap(), "SERVER/CREATE");
        assert_eq!(headers.get("x-token").unwrap(), "abc");
        assert_eq!(headers.len(), 2);
    }
}
