//! Subscriber database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Binding from a topic to a receiver set, a role or a robot.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct SubscriberDbModel {
    pub id: String,
    pub topic_id: String,
    pub subscriber_type: String,
    /// Role id for `role`, robot id for `robot`, empty for `receiver`.
    pub identification: String,
    /// Scope the role assignment query is constrained to (role subscribers only).
    pub role_scope: String,
    /// Who may administer this subscriber.
    pub scope: String,
    pub domain_id: String,
    /// Which events match: system, domain or project.
    pub resource_scope: String,
    pub resource_attribution_id: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SubscriberDbModel {
    pub fn new(topic_id: impl Into<String>, subscriber_type: SubscriberType) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic_id: topic_id.into(),
            subscriber_type: subscriber_type.as_str().to_string(),
            identification: String::new(),
            role_scope: String::new(),
            scope: ScopeLevel::System.as_str().to_string(),
            domain_id: String::new(),
            resource_scope: ScopeLevel::System.as_str().to_string(),
            resource_attribution_id: String::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> Option<SubscriberType> {
        self.subscriber_type.parse().ok()
    }
}

/// Subscriber kinds.
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
pub enum SubscriberType {
    Receiver,
    Robot,
    Role,
}

impl SubscriberType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Scope levels shared by `scope`, `resource_scope` and `role_scope`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    System,
    Domain,
    Project,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Join row between a receiver-type subscriber and its receivers.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriberReceiverDbModel {
    pub subscriber_id: String,
    pub receiver_id: String,
}
