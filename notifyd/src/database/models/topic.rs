//! Topic database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Named semantic event class.
///
/// `resources` and `actions` are bitmaps against the process-wide
/// registries; stored as `INTEGER` and reinterpreted as `u64`/`u32`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct TopicDbModel {
    pub id: String,
    pub name: String,
    pub topic_type: String,
    pub resources: i64,
    pub actions: i64,
    pub advance_days: i64,
    pub enabled: bool,
    pub webconsole_disable: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TopicDbModel {
    pub fn new(name: impl Into<String>, topic_type: TopicType, resources: u64, actions: u32) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            topic_type: topic_type.as_str().to_string(),
            resources: resources as i64,
            actions: actions as i64,
            advance_days: 0,
            enabled: true,
            webconsole_disable: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn resource_bits(&self) -> u64 {
        self.resources as u64
    }

    pub fn action_bits(&self) -> u32 {
        self.actions as u32
    }
}

/// Topic classes.
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
pub enum TopicType {
    Resource,
    AutomatedProcess,
    Security,
}

impl TopicType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmaps_survive_sign_reinterpretation() {
        let topic = TopicDbModel::new("t", TopicType::Resource, 1u64 << 63, u32::MAX);
        assert!(topic.resources < 0);
        assert_eq!(topic.resource_bits(), 1u64 << 63);
        assert_eq!(topic.action_bits(), u32::MAX);
    }

    #[test]
    fn test_topic_type_strings() {
        assert_eq!(TopicType::AutomatedProcess.as_str(), "automated_process");
        assert_eq!("security".parse::<TopicType>().unwrap(), TopicType::Security);
    }
}
