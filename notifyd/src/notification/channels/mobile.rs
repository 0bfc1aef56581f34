//! SMS channel over an Aliyun-style signed RPC API.
//!
//! SMS vendors only deliver pre-approved templates, so every send needs a
//! remote template code; the message fields become template parameters.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha1::Sha1;

use super::{Capabilities, ChannelDriver, ConfigRejection, MOBILE, SendParams, read_json, str_of};
use crate::credentials::TokenCache;
use crate::database::models::ConfigContent;
use crate::utils::json::parse_object;
use crate::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_BASE_URL: &str = "https://dysmsapi.aliyuncs.com";
const API_VERSION: &str = "2017-05-25";
const REGION: &str = "cn-hangzhou";

pub struct MobileDriver {
    client: Client,
    cache: Arc<TokenCache>,
    base_url: String,
}

/// Strip a `+CC ` prefix; mainland numbers go out bare, others with `00CC`.
pub(crate) fn normalize_mobile(mobile: &str) -> String {
    let mobile = mobile.trim();
    match mobile.strip_prefix('+').and_then(|rest| rest.split_once(' ')) {
        Some(("86", number)) => number.trim().to_string(),
        Some((cc, number)) => format!("00{}{}", cc, number.trim()),
        None => mobile.to_string(),
    }
}

fn percent_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Signature over the sorted query, as the RPC gateway expects.
pub(crate) fn sign(params: &BTreeMap<String, String>, secret: &str) -> Result<String> {
    let canonical = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let string_to_sign = format!("GET&{}&{}", percent_encode("/"), percent_encode(&canonical));

    let mut mac = HmacSha1::new_from_slice(format!("{}&", secret).as_bytes())
        .map_err(|e| Error::Other(format!("hmac key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

impl MobileDriver {
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

    fn template_param(params: &SendParams) -> String {
        match &params.remote_template_param {
            Some(map) => Value::Object(map.clone()).to_string(),
            None => parse_object(&params.message)
                .map(|m| Value::Object(m).to_string())
                .unwrap_or_else(|| "{}".to_string()),
        }
    }

    fn check(body: &Value) -> Result<()> {
        match str_of(body, "Code") {
            "OK" => Ok(()),
            code if code.starts_with("Throttling") => Err(Error::Transient(format!(
                "{} ({})",
                str_of(body, "Message"),
                code
            ))),
            code => Err(Error::vendor_rejected(format!(
                "{} ({})",
                str_of(body, "Message"),
                code
            ))),
        }
    }
}

#[async_trait]
impl ChannelDriver for MobileDriver {
    fn channel_type(&self) -> &'static str {
        MOBILE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_personal: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let recipient = params.single()?;
        let template_code = params
            .remote_template
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::input_invalid("SMS requires a remote template"))?;
        let config = self.cache.credentials(MOBILE, &recipient.domain_id).await?;
        let access_key_id = config.require(MOBILE, "access_key_id")?;
        let access_key_secret = config.require(MOBILE, "access_key_secret")?;
        let sign_name = config.require(MOBILE, "signature")?;

        let mut query: BTreeMap<String, String> = [
            ("AccessKeyId", access_key_id.as_str()),
            ("Action", "SendSms"),
            ("Format", "JSON"),
            ("RegionId", REGION),
            ("SignName", sign_name.as_str()),
            ("SignatureMethod", "HMAC-SHA1"),
            ("SignatureVersion", "1.0"),
            ("TemplateCode", template_code),
            ("Version", API_VERSION),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        query.insert("PhoneNumbers".into(), normalize_mobile(&recipient.contact));
        query.insert("TemplateParam".into(), Self::template_param(params));
        query.insert("SignatureNonce".into(), uuid::Uuid::new_v4().to_string());
        query.insert(
            "Timestamp".into(),
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        let signature = sign(&query, &access_key_secret)?;
        query.insert("Signature".into(), signature);

        let body = read_json(
            self.client
                .get(format!("{}/", self.base_url))
                .query(&query)
                .send()
                .await?,
        )
        .await?;
        Self::check(&body)
    }

    async fn validate_config(&self, config: &ConfigContent) -> std::result::Result<(), ConfigRejection> {
        for key in ["access_key_id", "access_key_secret", "signature"] {
            if let Err(e) = config.require(MOBILE, key) {
                return Err(ConfigRejection::new(format!("{} is required", key), e));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_mobile() {
        assert_eq!(normalize_mobile("+86 13800000000"), "13800000000");
        assert_eq!(normalize_mobile("+852 61234567"), "0085261234567");
        assert_eq!(normalize_mobile("13800000000"), "13800000000");
    }

    #[test]
    fn test_sign_depends_on_every_param() {
        let mut params = BTreeMap::new();
        params.insert("Action".to_string(), "SendSms".to_string());
        params.insert("PhoneNumbers".to_string(), "13800000000".to_string());
        let a = sign(&params, "secret").unwrap();
        assert_eq!(a, sign(&params, "secret").unwrap());
        assert_ne!(a, sign(&params, "other").unwrap());
        params.insert("TemplateCode".to_string(), "SMS_1".to_string());
        assert_ne!(a, sign(&params, "secret").unwrap());
        // HMAC-SHA1 is 20 bytes.
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 20);
    }

    #[test]
    fn test_template_param_prefers_explicit_map() {
        let mut params = SendParams {
            message: r#"{"code":"123456"}"#.to_string(),
            ..Default::default()
        };
        assert_eq!(MobileDriver::template_param(&params), r#"{"code":"123456"}"#);
        params.remote_template_param = json!({"name": "vm1"}).as_object().cloned();
        assert_eq!(MobileDriver::template_param(&params), r#"{"name":"vm1"}"#);
        params.remote_template_param = None;
        params.message = "plain".to_string();
        assert_eq!(MobileDriver::template_param(&params), "{}");
    }

    #[test]
    fn test_check() {
        assert!(MobileDriver::check(&json!({"Code": "OK"})).is_ok());
        assert!(matches!(
            MobileDriver::check(&json!({"Code": "Throttling.User", "Message": "slow down"})),
            Err(Error::Transient(_))
        ));
        assert!(matches!(
            MobileDriver::check(&json!({"Code": "isv.MOBILE_NUMBER_ILLEGAL"})),
            Err(Error::VendorRejected(_))
        ));
    }
}
