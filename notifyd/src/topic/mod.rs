//! Topics and the resource/action bit registries they are matched against.

pub mod defaults;
pub mod registry;

use std::sync::Arc;

use tracing::{debug, info};

use crate::database::models::{TopicDbModel, TopicType};
use crate::database::repositories::TopicRepository;
use crate::{Error, Result};

pub use defaults::{DEFAULT_TOPICS, DefaultTopic};
pub use registry::{BUILTIN_ACTIONS, BUILTIN_RESOURCES, BitRegistry, TopicRegistry};

/// Request to create a topic from resource and action names.
#[derive(Debug, Clone)]
pub struct TopicCreate {
    pub name: String,
    pub topic_type: TopicType,
    pub resources: Vec<String>,
    pub actions: Vec<String>,
    pub advance_days: i64,
    pub webconsole_disable: bool,
}

/// Topic with its bitmaps decoded back into names.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopicView {
    #[serde(flatten)]
    pub topic: TopicDbModel,
    pub resource_types: Vec<String>,
    pub action_names: Vec<String>,
}

pub struct TopicService {
    repo: Arc<dyn TopicRepository>,
    registry: Arc<TopicRegistry>,
}

impl TopicService {
    pub fn new(repo: Arc<dyn TopicRepository>, registry: Arc<TopicRegistry>) -> Self {
        Self { repo, registry }
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub async fn create_topic(&self, request: TopicCreate) -> Result<TopicDbModel> {
        if request.name.trim().is_empty() {
            return Err(Error::input_invalid("topic name is empty"));
        }
        if request.advance_days < 0 {
            return Err(Error::input_invalid("advance days must not be negative"));
        }
        let resources = self.registry.resource_mask(&request.resources)?;
        let actions = self.registry.action_mask(&request.actions)?;

        let mut topic = TopicDbModel::new(request.name, request.topic_type, resources, actions);
        topic.advance_days = request.advance_days;
        topic.webconsole_disable = request.webconsole_disable;
        self.repo.create_topic(&topic).await?;
        Ok(topic)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<TopicDbModel> {
        let mut topic = self.repo.get_topic(id).await?;
        topic.enabled = enabled;
        self.repo.update_topic(&topic).await?;
        Ok(topic)
    }

    /// Insert every default topic that does not exist yet.
    ///
    /// Existing rows are never touched so operator edits survive restarts.
    pub async fn seed_default_topics(&self) -> Result<usize> {
        let mut created = 0;
        for default in DEFAULT_TOPICS {
            if self.repo.get_topic_by_name(default.name).await?.is_some() {
                continue;
            }
            let mut topic = TopicDbModel::new(
                default.name,
                default.topic_type,
                self.registry.resource_mask(default.resources)?,
                self.registry.action_mask(default.actions)?,
            );
            topic.advance_days = default.advance_days;
            topic.webconsole_disable = default.webconsole_disable;
            match self.repo.create_topic(&topic).await {
                Ok(()) => created += 1,
                // Another instance won the race.
                Err(Error::Duplicate(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if created > 0 {
            info!(created, "Seeded default topics");
        }
        Ok(created)
    }

    /// Enabled topics covering `resource_type` and `action` at `advance_days`.
    pub async fn find_matching(
        &self,
        resource_type: &str,
        action: &str,
        advance_days: i64,
    ) -> Result<Vec<TopicDbModel>> {
        let resource_bit = self
            .registry
            .resources()
            .bit(resource_type)
            .ok_or_else(|| Error::input_invalid(format!("unknown resource type '{}'", resource_type)))?;
        let action_bit = self
            .registry
            .actions()
            .bit(action)
            .ok_or_else(|| Error::input_invalid(format!("unknown action '{}'", action)))?;

        let topics = self
            .repo
            .find_matching(1u64 << resource_bit, 1u32 << action_bit, advance_days)
            .await?;
        debug!(
            resource_type,
            action,
            advance_days,
            matched = topics.len(),
            "Matched topics"
        );
        Ok(topics)
    }

    pub async fn describe(&self, id: &str) -> Result<TopicView> {
        let topic = self.repo.get_topic(id).await?;
        Ok(self.view(topic))
    }

    pub async fn list_topics(&self) -> Result<Vec<TopicView>> {
        Ok(self
            .repo
            .list_topics()
            .await?
            .into_iter()
            .map(|t| self.view(t))
            .collect())
    }

    fn view(&self, topic: TopicDbModel) -> TopicView {
        TopicView {
            resource_types: self.registry.resources_of(topic.resource_bits()),
            action_names: self.registry.actions_of(topic.action_bits()),
            topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxTopicRepository;
    use crate::database::test_pool;

    async fn service() -> TopicService {
        let pool = test_pool().await;
        TopicService::new(
            Arc::new(SqlxTopicRepository::new(pool)),
            Arc::new(TopicRegistry::with_builtins().unwrap()),
        )
    }

    #[test]
    fn test_default_topics_use_known_names() {
        let registry = TopicRegistry::with_builtins().unwrap();
        for topic in DEFAULT_TOPICS {
            registry.resource_mask(topic.resources).unwrap();
            registry.action_mask(topic.actions).unwrap();
        }
    }

    #[tokio::test]
    async fn test_seed_default_topics_is_idempotent() {
        let service = service().await;
        let first = service.seed_default_topics().await.unwrap();
        assert_eq!(first, DEFAULT_TOPICS.len());
        assert_eq!(service.seed_default_topics().await.unwrap(), 0);

        let week = service
            .find_matching("user", "password_expire_soon", 7)
            .await
            .unwrap();
        assert_eq!(week.len(), 1);
        assert_eq!(week[0].name, "password expire due 7 day");
    }

    #[tokio::test]
    async fn test_find_matching_rejects_unknown_names() {
        let service = service().await;
        assert!(matches!(
            service.find_matching("spaceship", "create", 0).await,
            Err(Error::InputInvalid(_))
        ));
        assert!(matches!(
            service.find_matching("server", "launch", 0).await,
            Err(Error::InputInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_describe() {
        let service = service().await;
        let topic = service
            .create_topic(TopicCreate {
                name: "T1".to_string(),
                topic_type: TopicType::Resource,
                resources: vec!["server".to_string()],
                actions: vec!["create".to_string()],
                advance_days: 0,
                webconsole_disable: false,
            })
            .await
            .unwrap();

        let view = service.describe(&topic.id).await.unwrap();
        assert_eq!(view.resource_types, vec!["server"]);
        assert_eq!(view.action_names, vec!["create"]);

        service.set_enabled(&topic.id, false).await.unwrap();
        assert!(service.find_matching("server", "create", 0).await.unwrap().is_empty());
    }
}
