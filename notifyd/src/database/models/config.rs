//! Channel configuration database model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// Domain id under which system-attributed configs are stored.
pub const SYSTEM_DOMAIN_ID: &str = "default";

/// Per-(channel, domain) credentials.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ConfigDbModel {
    pub id: String,
    pub channel: String,
    pub domain_id: String,
    pub attribution: String,
    /// JSON object; layout is channel-specific.
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConfigDbModel {
    pub fn new(
        channel: impl Into<String>,
        domain_id: impl Into<String>,
        attribution: Attribution,
        content: &ConfigContent,
    ) -> Result<Self> {
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            domain_id: domain_id.into(),
            attribution: attribution.as_str().to_string(),
            content: serde_json::to_string(&content.0)?,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn content(&self) -> Result<ConfigContent> {
        let map: Map<String, Value> = serde_json::from_str(&self.content)?;
        Ok(ConfigContent(map))
    }
}

/// Config attribution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    System,
    Domain,
}

impl Attribution {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Channel-specific credential map (SMTP creds, app key/secret, access keys, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigContent(pub Map<String, Value>);

impl ConfigContent {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        )
    }

    /// String value for `key`; numbers and booleans are stringified.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Like [`get`](Self::get), but a missing key is an incomplete config.
    pub fn require(&self, channel: &str, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| Error::incomplete_config(channel, format!("missing '{}'", key)))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_accessors() {
        let mut content = ConfigContent::from_pairs([("hostname", "smtp.example.com")]);
        content.insert("hostport", 465);
        content.insert("ssl", true);
        content.insert("empty", "");

        assert_eq!(content.get("hostname").as_deref(), Some("smtp.example.com"));
        assert_eq!(content.get("hostport").as_deref(), Some("465"));
        assert!(content.get_bool("ssl"));
        assert!(content.get("empty").is_none());
        assert!(matches!(
            content.require("email", "password"),
            Err(Error::IncompleteConfig { .. })
        ));
    }

    #[test]
    fn test_model_content_round_trip() {
        let content = ConfigContent::from_pairs([("app_key", "k"), ("app_secret", "s")]);
        let model = ConfigDbModel::new("dingtalk", "d1", Attribution::Domain, &content).unwrap();
        assert_eq!(model.attribution, "domain");
        assert_eq!(model.content().unwrap(), content);
    }
}
