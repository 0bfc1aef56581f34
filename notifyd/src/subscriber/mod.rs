//! Topic subscribers and their expansion into concrete recipients.

mod resolver;

pub use resolver::{Recipients, SubscriberResolver};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::models::{ScopeLevel, SubscriberDbModel, SubscriberType};
use crate::database::repositories::{
    ReceiverRepository, RobotRepository, SubscriberRepository, TopicRepository,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberCreate {
    pub topic_id: String,
    pub subscriber_type: SubscriberType,
    /// Role id or robot id; ignored for receiver subscribers.
    #[serde(default)]
    pub identification: String,
    #[serde(default)]
    pub role_scope: Option<ScopeLevel>,
    pub scope: ScopeLevel,
    #[serde(default)]
    pub domain_id: String,
    pub resource_scope: ScopeLevel,
    #[serde(default)]
    pub resource_attribution_id: String,
    #[serde(default)]
    pub receivers: Vec<String>,
}

pub struct SubscriberService {
    repo: Arc<dyn SubscriberRepository>,
    topics: Arc<dyn TopicRepository>,
    receivers: Arc<dyn ReceiverRepository>,
    robots: Arc<dyn RobotRepository>,
}

impl SubscriberService {
    pub fn new(
        repo: Arc<dyn SubscriberRepository>,
        topics: Arc<dyn TopicRepository>,
        receivers: Arc<dyn ReceiverRepository>,
        robots: Arc<dyn RobotRepository>,
    ) -> Self {
        Self {
            repo,
            topics,
            receivers,
            robots,
        }
    }

    pub async fn create_subscriber(&self, request: SubscriberCreate) -> Result<SubscriberDbModel> {
        self.topics.get_topic(&request.topic_id).await?;
        if request.resource_scope != ScopeLevel::System && request.resource_attribution_id.is_empty() {
            return Err(Error::input_invalid(format!(
                "resource_attribution_id is required for {} resource scope",
                request.resource_scope
            )));
        }
        if request.scope == ScopeLevel::Project {
            return Err(Error::input_invalid("subscriber scope must be system or domain"));
        }

        let mut subscriber = SubscriberDbModel::new(&request.topic_id, request.subscriber_type);
        subscriber.scope = request.scope.as_str().to_string();
        subscriber.domain_id = request.domain_id;
        subscriber.resource_scope = request.resource_scope.as_str().to_string();
        subscriber.resource_attribution_id = request.resource_attribution_id;

        match request.subscriber_type {
            SubscriberType::Receiver => {}
            SubscriberType::Robot => {
                self.robots.get_robot(&request.identification).await?;
                subscriber.identification = request.identification;
            }
            SubscriberType::Role => {
                if request.identification.is_empty() {
                    return Err(Error::input_invalid("role is required"));
                }
                subscriber.identification = request.identification;
                subscriber.role_scope = request
                    .role_scope
                    .unwrap_or(ScopeLevel::System)
                    .as_str()
                    .to_string();
            }
        }

        self.repo.create_subscriber(&subscriber).await?;
        if subscriber.kind() == Some(SubscriberType::Receiver) && !request.receivers.is_empty() {
            self.set_receivers(&subscriber.id, &request.receivers).await?;
        }
        info!(
            subscriber_id = %subscriber.id,
            topic_id = %subscriber.topic_id,
            subscriber_type = %subscriber.subscriber_type,
            "Created subscriber"
        );
        Ok(subscriber)
    }

    /// Replace the receiver set of a receiver subscriber.
    ///
    /// Receivers may be given by id or name; unknown ones are rejected.
    pub async fn set_receivers(&self, subscriber_id: &str, receivers: &[String]) -> Result<()> {
        let subscriber = self.repo.get_subscriber(subscriber_id).await?;
        if subscriber.kind() != Some(SubscriberType::Receiver) {
            return Err(Error::input_invalid(
                "receivers can only be set on receiver subscribers",
            ));
        }
        let mut ids = Vec::with_capacity(receivers.len());
        for ident in receivers {
            let receiver = self
                .receivers
                .find_by_id_or_name(ident)
                .await?
                .ok_or_else(|| Error::not_found("Receiver", ident))?;
            ids.push(receiver.id);
        }
        ids.sort();
        ids.dedup();
        self.repo.set_receivers(subscriber_id, &ids).await
    }

    pub async fn receivers(&self, subscriber_id: &str) -> Result<Vec<String>> {
        self.repo.list_receivers(subscriber_id).await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<SubscriberDbModel> {
        let mut subscriber = self.repo.get_subscriber(id).await?;
        subscriber.enabled = enabled;
        self.repo.update_subscriber(&subscriber).await?;
        Ok(subscriber)
    }

    pub async fn delete_subscriber(&self, id: &str) -> Result<()> {
        self.repo.delete_subscriber(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ReceiverDbModel, TopicDbModel, TopicType};
    use crate::database::repositories::{
        SqlxReceiverRepository, SqlxRobotRepository, SqlxSubscriberRepository,
        SqlxTopicRepository,
    };
    use crate::database::test_pool;

    async fn setup() -> (SubscriberService, String) {
        let pool = test_pool().await;
        let topics = Arc::new(SqlxTopicRepository::new(pool.clone()));
        let topic = TopicDbModel::new("T1", TopicType::Resource, 1, 1);
        topics.create_topic(&topic).await.unwrap();

        let receivers = Arc::new(SqlxReceiverRepository::new(pool.clone()));
        for (id, name) in [("u1", "alice"), ("u2", "bob")] {
            receivers
                .create_receiver(&ReceiverDbModel::new(id, name, "D1"))
                .await
                .unwrap();
        }

        let service = SubscriberService::new(
            Arc::new(SqlxSubscriberRepository::new(pool.clone())),
            topics,
            receivers,
            Arc::new(SqlxRobotRepository::new(pool)),
        );
        (service, topic.id)
    }

    fn request(topic_id: &str, subscriber_type: SubscriberType) -> SubscriberCreate {
        SubscriberCreate {
            topic_id: topic_id.to_string(),
            subscriber_type,
            identification: String::new(),
            role_scope: None,
            scope: ScopeLevel::System,
            domain_id: String::new(),
            resource_scope: ScopeLevel::System,
            resource_attribution_id: String::new(),
            receivers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_set_receivers_by_name_is_idempotent() {
        let (service, topic_id) = setup().await;
        let mut create = request(&topic_id, SubscriberType::Receiver);
        create.receivers = vec!["alice".to_string(), "u2".to_string(), "u1".to_string()];
        let sub = service.create_subscriber(create).await.unwrap();
        assert_eq!(service.receivers(&sub.id).await.unwrap(), vec!["u1", "u2"]);

        service
            .set_receivers(&sub.id, &["u2".to_string()])
            .await
            .unwrap();
        service
            .set_receivers(&sub.id, &["u2".to_string()])
            .await
            .unwrap();
        assert_eq!(service.receivers(&sub.id).await.unwrap(), vec!["u2"]);

        let err = service
            .set_receivers(&sub.id, &["nobody".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (service, topic_id) = setup().await;

        let mut domain_scoped = request(&topic_id, SubscriberType::Receiver);
        domain_scoped.resource_scope = ScopeLevel::Domain;
        assert!(service.create_subscriber(domain_scoped).await.is_err());

        let role = request(&topic_id, SubscriberType::Role);
        assert!(service.create_subscriber(role).await.is_err());

        let mut robot = request(&topic_id, SubscriberType::Robot);
        robot.identification = "missing".to_string();
        assert!(matches!(
            service.create_subscriber(robot).await.unwrap_err(),
            Error::NotFound { .. }
        ));

        let mut role = request(&topic_id, SubscriberType::Role);
        role.identification = "admin".to_string();
        role.role_scope = Some(ScopeLevel::Domain);
        let sub = service.create_subscriber(role).await.unwrap();
        assert_eq!(sub.role_scope, "domain");
    }
}
