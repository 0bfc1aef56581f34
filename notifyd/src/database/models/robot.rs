//! Robot database model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// A non-human recipient: a vendor chat bot or a generic webhook.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct RobotDbModel {
    pub id: String,
    pub name: String,
    /// One of the robot channel names or `webhook`.
    pub robot_type: String,
    /// Webhook URL or vendor id.
    pub address: String,
    pub lang: String,
    pub enabled: bool,
    pub domain_id: String,
    /// JSON object of extra request headers (webhook only).
    pub header: Option<String>,
    /// JSON object merged into the request body (webhook only).
    pub body: Option<String>,
    pub msg_key: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RobotDbModel {
    pub fn new(
        name: impl Into<String>,
        robot_type: impl Into<String>,
        address: impl Into<String>,
        domain_id: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            robot_type: robot_type.into(),
            address: address.into(),
            lang: String::new(),
            enabled: true,
            domain_id: domain_id.into(),
            header: None,
            body: None,
            msg_key: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Parsed header map; malformed JSON yields an empty map.
    pub fn header_map(&self) -> HashMap<String, String> {
        self.header
            .as_deref()
            .and_then(|h| serde_json::from_str(h).ok())
            .unwrap_or_default()
    }

    /// Parsed body object; malformed JSON yields an empty object.
    pub fn body_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_body_parsing() {
        let mut robot = RobotDbModel::new("ops", "webhook", "http://localhost/hook", "default");
        assert!(robot.header_map().is_empty());
        assert!(robot.body_map().is_empty());

        robot.header = Some(r#"{"X-Token":"abc"}"#.to_string());
        robot.body = Some(r#"{"source":"cloud"}"#.to_string());
        assert_eq!(robot.header_map().get("X-Token").map(String::as_str), Some("abc"));
        assert_eq!(robot.body_map()["source"], "cloud");

        robot.header = Some("not json".to_string());
        assert!(robot.header_map().is_empty());
    }
}
