//! Channel drivers.
//!
//! Every delivery medium implements [`ChannelDriver`]:
//! - Email (SMTP)
//! - Mobile (SMS with vendor-side templates)
//! - DingTalk, Feishu and WeCom work apps (pull-type, access-token based)
//! - DingTalk, Feishu and WeCom group robots
//! - Generic webhooks (HTTP POST)
//! - Websocket service and in-app console
//!
//! Drivers are registered once at startup in a [`DriverRegistry`].

mod dingtalk;
mod email;
mod feishu;
mod mobile;
mod registry;
mod robot;
mod webconsole;
mod webhook;
mod websocket;
mod workwx;

pub use dingtalk::DingtalkDriver;
pub use email::EmailDriver;
pub use feishu::FeishuDriver;
pub use mobile::MobileDriver;
pub use registry::{DriverFilter, DriverRegistry};
pub use robot::{RobotDriver, RobotKind};
pub use webconsole::{InAppMessage, WebconsoleDriver};
pub use webhook::{EVENT_HEADER, WebhookDriver};
pub use websocket::WebsocketDriver;
pub use workwx::WorkwxDriver;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::database::models::{ConfigContent, NotificationPriority};
use crate::{Error, Result};

pub const EMAIL: &str = "email";
pub const MOBILE: &str = "mobile";
pub const DINGTALK: &str = "dingtalk";
pub const FEISHU: &str = "feishu";
pub const WORKWX: &str = "workwx";
pub const DINGTALK_ROBOT: &str = "dingtalk-robot";
pub const FEISHU_ROBOT: &str = "feishu-robot";
pub const WORKWX_ROBOT: &str = "workwx-robot";
pub const WEBHOOK: &str = "webhook";
pub const WEBSOCKET: &str = "websocket";
pub const WEBCONSOLE: &str = "webconsole";

/// Channels whose drivers read a Config row.
pub const CONFIG_CHANNELS: &[&str] = &[EMAIL, MOBILE, DINGTALK, FEISHU, WORKWX, WEBSOCKET];

/// Driver capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Delivers to a robot address rather than a person.
    pub is_robot: bool,
    /// Delivers to a person's contact.
    pub is_personal: bool,
    /// Contacts are resolved from the vendor by mobile number.
    pub is_pull_type: bool,
    /// Contacts come from system config, so no per-user verification.
    pub is_system_config: bool,
}

/// One target of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub contact: String,
    pub domain_id: String,
}

impl Recipient {
    pub fn new(contact: impl Into<String>, domain_id: impl Into<String>) -> Self {
        Self {
            contact: contact.into(),
            domain_id: domain_id.into(),
        }
    }
}

/// Email attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub mime: String,
    /// Base64-encoded content.
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct SendParams {
    pub receivers: Vec<Recipient>,
    pub topic: String,
    pub title: String,
    pub message: String,
    pub remote_template: Option<String>,
    pub remote_template_param: Option<Map<String, Value>>,
    pub priority: NotificationPriority,
    pub event: String,
    pub header: HashMap<String, String>,
    pub body: Map<String, Value>,
    /// Key wrapping non-JSON webhook messages (`Msg` when empty).
    pub msg_key: String,
    pub attachments: Vec<Attachment>,
}

impl SendParams {
    /// Copy of these params addressed to a single recipient.
    pub fn for_recipient(&self, recipient: Recipient) -> Self {
        Self {
            receivers: vec![recipient],
            ..self.clone()
        }
    }

    /// The only recipient, for drivers that deliver one at a time.
    pub fn single(&self) -> Result<&Recipient> {
        match self.receivers.as_slice() {
            [one] => Ok(one),
            [] => Err(Error::input_invalid("no receiver")),
            _ => Err(Error::input_invalid("expected exactly one receiver")),
        }
    }
}

/// Per-contact failure from a batch send.
#[derive(Debug)]
pub struct ContactFailure {
    pub contact: String,
    pub error: Error,
}

/// Config rejected by a driver: a user-facing message plus the cause.
#[derive(Debug)]
pub struct ConfigRejection {
    pub message: String,
    pub error: Error,
}

impl ConfigRejection {
    pub fn new(message: impl Into<String>, error: Error) -> Self {
        Self {
            message: message.into(),
            error,
        }
    }
}

/// Trait for channel drivers.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    fn channel_type(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Per-attempt deadline overriding the dispatcher default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn send(&self, params: &SendParams) -> Result<()>;

    /// Whether [`send_batch`](Self::send_batch) is cheaper than single sends.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Deliver to every receiver, returning the contacts that failed.
    ///
    /// An `Err` means the whole batch failed.
    async fn send_batch(&self, params: &SendParams) -> Result<Vec<ContactFailure>> {
        let mut failures = Vec::new();
        for recipient in &params.receivers {
            if let Err(error) = self.send(&params.for_recipient(recipient.clone())).await {
                failures.push(ContactFailure {
                    contact: recipient.contact.clone(),
                    error,
                });
            }
        }
        Ok(failures)
    }

    async fn validate_config(&self, _config: &ConfigContent) -> std::result::Result<(), ConfigRejection> {
        Ok(())
    }

    /// Resolve the channel-specific contact id from a phone number.
    async fn contact_by_mobile(&self, _mobile: &str, _domain_id: &str) -> Result<String> {
        Err(Error::NotImplemented(format!(
            "{} cannot resolve contacts by mobile",
            self.channel_type()
        )))
    }

    /// Refresh the cached access token for `domain_id`.
    async fn get_access_token(&self, _domain_id: &str) -> Result<String> {
        Err(Error::NotSupported(format!(
            "{} does not use access tokens",
            self.channel_type()
        )))
    }
}

/// Fail on a non-success status and return the body.
///
/// Server errors and throttling are transient; other client errors are
/// vendor rejections.
pub(crate) async fn expect_success(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    let detail = format!("HTTP {}: {}", status, truncate(&body, 256));
    Err(if status.is_server_error() || status.as_u16() == 429 {
        Error::Transient(detail)
    } else {
        Error::vendor_rejected(detail)
    })
}

/// Read a vendor response body as JSON.
pub(crate) async fn read_json(response: reqwest::Response) -> Result<Value> {
    let body = expect_success(response).await?;
    serde_json::from_str(&body)
        .map_err(|e| Error::vendor_rejected(format!("malformed response: {}", e)))
}

/// Numeric vendor code that may arrive as a number or a string.
pub(crate) fn code_of(value: &Value, field: &str) -> Option<i64> {
    match value.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn str_of<'a>(value: &'a Value, field: &str) -> &'a str {
    value.get(field).and_then(Value::as_str).unwrap_or_default()
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Markdown body used by the IM drivers.
pub(crate) fn markdown(title: &str, message: &str) -> String {
    if title.is_empty() {
        message.to_string()
    } else {
        format!("### {}\n\n{}", title, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_code_of_accepts_strings() {
        let v = json!({"errcode": 88, "sub_code": "40014", "bad": "x"});
        assert_eq!(code_of(&v, "errcode"), Some(88));
        assert_eq!(code_of(&v, "sub_code"), Some(40014));
        assert_eq!(code_of(&v, "bad"), None);
        assert_eq!(code_of(&v, "missing"), None);
    }

    #[test]
    fn test_single_recipient() {
        let mut params = SendParams::default();
        assert!(params.single().is_err());
        params.receivers.push(Recipient::new("a@b.c", "D1"));
        assert_eq!(params.single().unwrap().contact, "a@b.c");
        params.receivers.push(Recipient::new("c@d.e", "D1"));
        assert!(params.single().is_err());
        assert_eq!(params.for_recipient(Recipient::new("x", "D1")).receivers.len(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn test_markdown() {
        assert_eq!(markdown("", "body"), "body");
        assert_eq!(markdown("T", "body"), "### T\n\nbody");
    }
}
