//! Template lookup and rendering.

use std::sync::Arc;

use handlebars::Handlebars;
use serde_json::{Map, Value};
use tracing::trace;

use crate::database::models::{ALL_CHANNELS, TemplateDbModel, TemplateKind};
use crate::database::repositories::TemplateRepository;
use crate::utils::json::parse_object;
use crate::{Error, Result};

/// Rendered output for one `(topic, channel, lang)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedContent {
    pub title: String,
    pub message: String,
    /// Vendor-side template id; `message` then carries the raw payload.
    pub remote_template: Option<String>,
}

#[derive(Debug, Default)]
struct Selection<'a> {
    title: Option<&'a TemplateDbModel>,
    content: Option<&'a TemplateDbModel>,
    remote: Option<&'a TemplateDbModel>,
}

/// Pick at most one row per kind; an exact channel beats `all`.
fn select<'a>(rows: &'a [TemplateDbModel], channel: &str) -> Selection<'a> {
    fn better<'a>(
        current: Option<&'a TemplateDbModel>,
        candidate: &'a TemplateDbModel,
        channel: &str,
    ) -> Option<&'a TemplateDbModel> {
        match current {
            None => Some(candidate),
            Some(cur) if cur.channel != channel && candidate.channel == channel => Some(candidate),
            keep => keep,
        }
    }

    let mut selection = Selection::default();
    for row in rows {
        match row.template_kind() {
            Some(TemplateKind::Title) => selection.title = better(selection.title, row, channel),
            Some(TemplateKind::Content) => {
                selection.content = better(selection.content, row, channel)
            }
            Some(TemplateKind::Remote) => selection.remote = better(selection.remote, row, channel),
            None => {}
        }
    }
    selection
}

pub struct TemplateStore {
    repo: Arc<dyn TemplateRepository>,
    registry: Handlebars<'static>,
    default_lang: String,
}

impl TemplateStore {
    pub fn new(repo: Arc<dyn TemplateRepository>, default_lang: impl Into<String>) -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self {
            repo,
            registry,
            default_lang: default_lang.into(),
        }
    }

    pub fn default_lang(&self) -> &str {
        &self.default_lang
    }

    /// Render `message` for `(topic, channel, lang)`.
    ///
    /// Without any matching rows the topic becomes the title and the
    /// message passes through untouched.
    pub async fn render(
        &self,
        topic: &str,
        channel: &str,
        lang: &str,
        message: &str,
    ) -> Result<RenderedContent> {
        let lang = if lang.is_empty() { &self.default_lang } else { lang };
        let rows = self.repo.find_for(topic, lang, channel).await?;
        trace!(topic, channel, lang, rows = rows.len(), "Template lookup");

        let selection = select(&rows, channel);
        if let Some(remote) = selection.remote
            && remote.channel == channel
        {
            return Ok(RenderedContent {
                title: topic.to_string(),
                message: message.to_string(),
                remote_template: Some(remote.content.clone()),
            });
        }

        let data = parse_object(message).unwrap_or_default();
        let title = match selection.title {
            Some(row) => self.render_row(row, &data)?,
            None => topic.to_string(),
        };
        let body = match selection.content {
            Some(row) => self.render_row(row, &data)?,
            None => message.to_string(),
        };
        Ok(RenderedContent {
            title,
            message: body,
            remote_template: selection
                .remote
                .filter(|r| r.channel == ALL_CHANNELS)
                .map(|r| r.content.clone()),
        })
    }

    fn render_row(&self, row: &TemplateDbModel, data: &Map<String, Value>) -> Result<String> {
        self.registry
            .render_template(&row.content, data)
            .map_err(|e| Error::Template(format!("{} template of {}: {}", row.kind, row.topic, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxTemplateRepository;
    use crate::database::test_pool;

    async fn store_with(rows: &[(&str, TemplateKind, &str)]) -> TemplateStore {
        let repo = Arc::new(SqlxTemplateRepository::new(test_pool().await));
        for (channel, kind, content) in rows {
            repo.create_template(&TemplateDbModel::new(*channel, "disk full", *kind, "en", *content))
                .await
                .unwrap();
        }
        TemplateStore::new(repo, "en")
    }

    #[tokio::test]
    async fn test_identity_path_without_rows() {
        let store = store_with(&[]).await;
        let out = store
            .render("disk full", "email", "en", r#"{"name":"vm1"}"#)
            .await
            .unwrap();
        assert_eq!(out.title, "disk full");
        assert_eq!(out.message, r#"{"name":"vm1"}"#);
        assert_eq!(out.remote_template, None);
    }

    #[tokio::test]
    async fn test_exact_channel_beats_all() {
        let store = store_with(&[
            (ALL_CHANNELS, TemplateKind::Title, "generic {{name}}"),
            ("email", TemplateKind::Title, "Email: {{name}}"),
            (ALL_CHANNELS, TemplateKind::Content, "<b>{{name}}</b> & co"),
        ])
        .await;
        let out = store
            .render("disk full", "email", "en", r#"{"name":"vm1"}"#)
            .await
            .unwrap();
        assert_eq!(out.title, "Email: vm1");
        // No HTML escaping.
        assert_eq!(out.message, "<b>vm1</b> & co");

        let out = store
            .render("disk full", "dingtalk", "", r#"{"name":"vm2"}"#)
            .await
            .unwrap();
        assert_eq!(out.title, "generic vm2");
    }

    #[tokio::test]
    async fn test_exact_remote_short_circuits() {
        let store = store_with(&[
            (ALL_CHANNELS, TemplateKind::Title, "T {{name}}"),
            ("mobile", TemplateKind::Remote, "SMS_123"),
        ])
        .await;
        let out = store
            .render("disk full", "mobile", "en", r#"{"name":"vm1"}"#)
            .await
            .unwrap();
        assert_eq!(out.remote_template.as_deref(), Some("SMS_123"));
        assert_eq!(out.message, r#"{"name":"vm1"}"#);
    }

    #[tokio::test]
    async fn test_render_is_deterministic() {
        let store = store_with(&[(ALL_CHANNELS, TemplateKind::Content, "{{a}}-{{b}}")]).await;
        let msg = r#"{"a":1,"b":"x"}"#;
        let first = store.render("disk full", "email", "en", msg).await.unwrap();
        let second = store.render("disk full", "email", "en", msg).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.message, "1-x");
    }

    #[tokio::test]
    async fn test_broken_template_is_template_error() {
        let store = store_with(&[(ALL_CHANNELS, TemplateKind::Title, "{{#if}")]).await;
        assert!(matches!(
            store.render("disk full", "email", "en", "{}").await,
            Err(Error::Template(_))
        ));
    }
}
