//! Template database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Channel value that matches every channel.
pub const ALL_CHANNELS: &str = "all";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct TemplateDbModel {
    pub id: String,
    /// Channel name or `all`.
    pub channel: String,
    /// Upper-cased topic name.
    pub topic: String,
    pub kind: String,
    pub lang: String,
    pub content: String,
    pub example: String,
    pub created_at: i64,
}

impl TemplateDbModel {
    pub fn new(
        channel: impl Into<String>,
        topic: impl AsRef<str>,
        kind: TemplateKind,
        lang: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            topic: topic.as_ref().to_uppercase(),
            kind: kind.as_str().to_string(),
            lang: lang.into(),
            content: content.into(),
            example: String::new(),
            created_at: now_ms(),
        }
    }

    pub fn template_kind(&self) -> Option<TemplateKind> {
        self.kind.parse().ok()
    }
}

/// Template kinds. `remote` holds a vendor-side template identifier.
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
pub enum TemplateKind {
    Title,
    Content,
    Remote,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}
