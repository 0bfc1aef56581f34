//! Group-robot channels for DingTalk, Feishu and WeCom.
//!
//! The recipient contact is the robot's webhook address. DingTalk robots
//! with signing enabled carry their secret as a `secret` query parameter
//! on the stored address; it is stripped before sending and replaced by
//! `timestamp` and `sign`.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{Value, json};
use sha2::Sha256;
use url::Url;

use super::{
    Capabilities, ChannelDriver, DINGTALK_ROBOT, FEISHU_ROBOT, SendParams, WORKWX_ROBOT, code_of,
    markdown, read_json, str_of,
};
use crate::database::time::now_ms;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotKind {
    Dingtalk,
    Feishu,
    Workwx,
}

pub struct RobotDriver {
    kind: RobotKind,
    client: Client,
}

impl RobotDriver {
    pub fn new(kind: RobotKind, client: Client) -> Self {
        Self { kind, client }
    }

    fn payload(&self, params: &SendParams) -> Value {
        match self.kind {
            RobotKind::Dingtalk => json!({
                "msgtype": "markdown",
                "markdown": {
                    "title": params.title,
                    "text": markdown(&params.title, &params.message),
                }
            }),
            RobotKind::Feishu => json!({
                "msg_type": "text",
                "content": {
                    "text": if params.title.is_empty() {
                        params.message.clone()
                    } else {
                        format!("{}\n{}", params.title, params.message)
                    }
                }
            }),
            RobotKind::Workwx => json!({
                "msgtype": "markdown",
                "markdown": { "content": markdown(&params.title, &params.message) }
            }),
        }
    }

    fn check(&self, body: &Value) -> Result<()> {
        let (code, message) = match self.kind {
            // Older Feishu robot endpoints answer with `StatusCode`.
            RobotKind::Feishu => (
                code_of(body, "code").or_else(|| code_of(body, "StatusCode")),
                str_of(body, "msg"),
            ),
            RobotKind::Dingtalk | RobotKind::Workwx => {
                (code_of(body, "errcode"), str_of(body, "errmsg"))
            }
        };
        match code.unwrap_or(0) {
            0 => Ok(()),
            code => Err(Error::vendor_rejected(format!("{} ({})", message, code))),
        }
    }
}

/// Strip a `secret` parameter from a DingTalk robot address and append the
/// matching `timestamp` and `sign`.
pub(crate) fn sign_dingtalk_address(address: &str, timestamp_ms: i64) -> Result<String> {
    let mut url =
        Url::parse(address).map_err(|e| Error::input_invalid(format!("invalid robot address: {}", e)))?;
    let mut secret = None;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            if k == "secret" {
                secret = Some(v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();
    let Some(secret) = secret else {
        return Ok(address.to_string());
    };

    let string_to_sign = format!("{}\n{}", timestamp_ms, secret);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Other(format!("hmac key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    let sign = STANDARD.encode(mac.finalize().into_bytes());

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("timestamp", &timestamp_ms.to_string())
        .append_pair("sign", &sign);
    Ok(url.into())
}

#[async_trait]
impl ChannelDriver for RobotDriver {
    fn channel_type(&self) -> &'static str {
        match self.kind {
            RobotKind::Dingtalk => DINGTALK_ROBOT,
            RobotKind::Feishu => FEISHU_ROBOT,
            RobotKind::Workwx => WORKWX_ROBOT,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_robot: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let address = &params.single()?.contact;
        if address.is_empty() {
            return Err(Error::input_invalid("empty robot address"));
        }
        let url = match self.kind {
            RobotKind::Dingtalk => sign_dingtalk_address(address, now_ms())?,
            _ => address.clone(),
        };
        let body = read_json(
            self.client
                .post(url)
                .json(&self.payload(params))
                .send()
                .await?,
        )
        .await?;
        self.check(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_address_is_untouched() {
        let address = "https://oapi.dingtalk.com/robot/send?access_token=abc";
        assert_eq!(sign_dingtalk_address(address, 1).unwrap(), address);
    }

    #[test]
    fn test_signed_address() {
        let signed = sign_dingtalk_address(
            "https://oapi.dingtalk.com/robot/send?access_token=abc&secret=SEC123",
            1_700_000_000_000,
        )
        .unwrap();
        let url = Url::parse(&signed).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("access_token".to_string(), "abc".to_string()));
        assert_eq!(pairs[1], ("timestamp".to_string(), "1700000000000".to_string()));
        assert_eq!(pairs[2].0, "sign");
        assert!(!signed.contains("SEC123"));

        // Deterministic for the same inputs.
        let again = sign_dingtalk_address(
            "https://oapi.dingtalk.com/robot/send?access_token=abc&secret=SEC123",
            1_700_000_000_000,
        )
        .unwrap();
        assert_eq!(signed, again);
    }

    #[test]
    fn test_check_per_kind() {
        let client = crate::utils::http_client::build_client(std::time::Duration::ZERO);
        let feishu = RobotDriver::new(RobotKind::Feishu, client.clone());
        assert!(feishu.check(&json!({"StatusCode": 0})).is_ok());
        assert!(feishu.check(&json!({"code": 19021, "msg": "sign match fail"})).is_err());

        let workwx = RobotDriver::new(RobotKind::Workwx, client);
        assert!(workwx.check(&json!({"errcode": 0})).is_ok());
        assert_eq!(workwx.channel_type(), WORKWX_ROBOT);
    }
}
