//! Topic → subscriber → recipient resolution.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::database::models::{ScopeLevel, SubscriberDbModel, SubscriberType, TopicDbModel};
use crate::database::repositories::{RobotRepository, SubscriberRepository};
use crate::identity::{IdentityClient, RoleAssignmentQuery};
use crate::topic::TopicService;
use crate::Result;

/// Default cap on concurrent identity queries.
const DEFAULT_MAX_PARALLEL_QUERIES: usize = 8;

/// Deduplicated recipients of one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub receiver_ids: Vec<String>,
    pub robot_ids: Vec<String>,
}

impl Recipients {
    pub fn is_empty(&self) -> bool {
        self.receiver_ids.is_empty() && self.robot_ids.is_empty()
    }
}

pub struct SubscriberResolver {
    topics: Arc<TopicService>,
    subscribers: Arc<dyn SubscriberRepository>,
    robots: Arc<dyn RobotRepository>,
    identity: Arc<dyn IdentityClient>,
    max_parallel_queries: usize,
}

impl SubscriberResolver {
    pub fn new(
        topics: Arc<TopicService>,
        subscribers: Arc<dyn SubscriberRepository>,
        robots: Arc<dyn RobotRepository>,
        identity: Arc<dyn IdentityClient>,
    ) -> Self {
        Self {
            topics,
            subscribers,
            robots,
            identity,
            max_parallel_queries: DEFAULT_MAX_PARALLEL_QUERIES,
        }
    }

    pub fn with_max_parallel_queries(mut self, max: usize) -> Self {
        self.max_parallel_queries = max.max(1);
        self
    }

    /// Enabled topics for the event. Unknown resource or action names fail.
    pub async fn matching_topics(
        &self,
        resource_type: &str,
        action: &str,
        advance_days: i64,
    ) -> Result<Vec<TopicDbModel>> {
        self.topics.find_matching(resource_type, action, advance_days).await
    }

    /// Recipients of every topic matching the event.
    pub async fn resolve(
        &self,
        resource_type: &str,
        action: &str,
        advance_days: i64,
        project_domain_id: &str,
        project_id: &str,
    ) -> Result<Recipients> {
        let topics = self.matching_topics(resource_type, action, advance_days).await?;
        let mut receivers = BTreeSet::new();
        let mut robots = BTreeSet::new();
        for topic in &topics {
            let r = self
                .resolve_topic(&topic.id, project_domain_id, project_id)
                .await?;
            receivers.extend(r.receiver_ids);
            robots.extend(r.robot_ids);
        }
        Ok(Recipients {
            receiver_ids: receivers.into_iter().collect(),
            robot_ids: robots.into_iter().collect(),
        })
    }

    /// Recipients of one topic's subscribers matching the event's scope.
    pub async fn resolve_topic(
        &self,
        topic_id: &str,
        project_domain_id: &str,
        project_id: &str,
    ) -> Result<Recipients> {
        let subscribers = self
            .subscribers
            .find_suitable(topic_id, project_domain_id, project_id)
            .await?;

        let mut receivers = BTreeSet::new();
        let mut robot_ids = Vec::new();
        let mut queries = HashSet::new();

        for subscriber in &subscribers {
            match subscriber.kind() {
                Some(SubscriberType::Receiver) => {
                    receivers.extend(self.subscribers.list_receivers(&subscriber.id).await?);
                }
                Some(SubscriberType::Robot) => robot_ids.push(subscriber.identification.clone()),
                Some(SubscriberType::Role) => {
                    if let Some(query) = role_query(subscriber, project_domain_id, project_id) {
                        queries.insert(query);
                    }
                }
                None => warn!(
                    subscriber_id = %subscriber.id,
                    subscriber_type = %subscriber.subscriber_type,
                    "Skipping subscriber of unknown type"
                ),
            }
        }

        receivers.extend(self.expand_roles(queries).await);

        // Disabled robots are skipped.
        let robots: BTreeSet<String> = self
            .robots
            .list_by_ids(&robot_ids)
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .map(|r| r.id)
            .collect();

        debug!(
            topic_id,
            subscribers = subscribers.len(),
            receivers = receivers.len(),
            robots = robots.len(),
            "Resolved topic recipients"
        );
        Ok(Recipients {
            receiver_ids: receivers.into_iter().collect(),
            robot_ids: robots.into_iter().collect(),
        })
    }

    /// Users holding any of `roles` anywhere in the system.
    pub async fn expand_role_members(&self, roles: &[String]) -> Vec<String> {
        let queries = roles
            .iter()
            .map(|role| RoleAssignmentQuery::new(role, ScopeLevel::System))
            .collect();
        self.expand_roles(queries).await
    }

    /// Run role queries in parallel, bounded by the semaphore.
    ///
    /// A failed query is logged and contributes nothing.
    async fn expand_roles(&self, queries: HashSet<RoleAssignmentQuery>) -> Vec<String> {
        if queries.is_empty() {
            return Vec::new();
        }
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_queries));
        let mut tasks = JoinSet::new();
        for query in queries {
            let identity = self.identity.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = identity.list_role_assignments(&query).await;
                (query, result)
            });
        }

        let mut users = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(ids))) => users.extend(ids),
                Ok((query, Err(e))) => warn!(
                    roles = ?query.roles,
                    scope = %query.scope,
                    error = %e,
                    "Role assignment query failed"
                ),
                Err(e) => warn!(error = %e, "Role assignment task panicked"),
            }
        }
        users
    }
}

/// Identity query for a role subscriber, constrained by its role scope.
///
/// Returns `None` when the event lacks the id the scope needs.
fn role_query(
    subscriber: &SubscriberDbModel,
    project_domain_id: &str,
    project_id: &str,
) -> Option<RoleAssignmentQuery> {
    let scope: ScopeLevel = match subscriber.role_scope.parse() {
        Ok(scope) => scope,
        Err(_) => {
            warn!(
                subscriber_id = %subscriber.id,
                role_scope = %subscriber.role_scope,
                "Invalid role scope"
            );
            return None;
        }
    };
    let query = RoleAssignmentQuery::new(&subscriber.identification, scope);
    match scope {
        ScopeLevel::System => Some(query),
        ScopeLevel::Domain if !project_domain_id.is_empty() => {
            Some(query.with_domain(project_domain_id))
        }
        ScopeLevel::Project if !project_id.is_empty() => Some(query.with_project(project_id)),
        _ => {
            warn!(
                subscriber_id = %subscriber.id,
                role_scope = %scope,
                "Event carries no id for the role scope"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{RobotDbModel, TopicDbModel, TopicType};
    use crate::database::repositories::{
        SqlxRobotRepository, SqlxSubscriberRepository, SqlxTopicRepository,
        TopicRepository,
    };
    use crate::database::test_pool;
    use crate::identity::StaticIdentityClient;
    use crate::topic::TopicRegistry;

    struct Fixture {
        resolver: SubscriberResolver,
        subscribers: Arc<SqlxSubscriberRepository>,
        robots: Arc<SqlxRobotRepository>,
        identity: Arc<StaticIdentityClient>,
        topic: TopicDbModel,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let registry = Arc::new(TopicRegistry::with_builtins().unwrap());
        let topic_repo = Arc::new(SqlxTopicRepository::new(pool.clone()));
        let topic = TopicDbModel::new(
            "T1",
            TopicType::Resource,
            registry.resource_mask(&["server"]).unwrap(),
            registry.action_mask(&["create"]).unwrap(),
        );
        topic_repo.create_topic(&topic).await.unwrap();

        let subscribers = Arc::new(SqlxSubscriberRepository::new(pool.clone()));
        let robots = Arc::new(SqlxRobotRepository::new(pool));
        let identity = Arc::new(StaticIdentityClient::new());
        let resolver = SubscriberResolver::new(
            Arc::new(TopicService::new(topic_repo, registry)),
            subscribers.clone(),
            robots.clone(),
            identity.clone(),
        );
        Fixture {
            resolver,
            subscribers,
            robots,
            identity,
            topic,
        }
    }

    fn role_subscriber(topic_id: &str, role: &str, scope: ScopeLevel) -> SubscriberDbModel {
        let mut sub = SubscriberDbModel::new(topic_id, SubscriberType::Role);
        sub.identification = role.to_string();
        sub.role_scope = scope.as_str().to_string();
        sub
    }

    #[tokio::test]
    async fn test_unknown_resource_fails_fast() {
        let f = fixture().await;
        assert!(f.resolver.resolve("spaceship", "create", 0, "", "").await.is_err());
        assert!(f.resolver.resolve("server", "explode", 0, "", "").await.is_err());
    }

    #[tokio::test]
    async fn test_receivers_and_roles_are_deduplicated() {
        let f = fixture().await;
        let receiver_sub = SubscriberDbModel::new(&f.topic.id, SubscriberType::Receiver);
        f.subscribers.create_subscriber(&receiver_sub).await.unwrap();
        f.subscribers
            .set_receivers(&receiver_sub.id, &["u1".to_string()])
            .await
            .unwrap();
        f.subscribers
            .create_subscriber(&role_subscriber(&f.topic.id, "admin", ScopeLevel::Domain))
            .await
            .unwrap();
        f.identity.assign("admin", ScopeLevel::Domain, "D1", &["u1", "u2"]);

        let recipients = f.resolver.resolve("server", "create", 0, "D1", "").await.unwrap();
        assert_eq!(recipients.receiver_ids, vec!["u1", "u2"]);

        // Without a project domain the domain-scoped role contributes nothing.
        let recipients = f.resolver.resolve("server", "create", 0, "", "").await.unwrap();
        assert_eq!(recipients.receiver_ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn test_expand_role_members() {
        let f = fixture().await;
        f.identity.assign("ops", ScopeLevel::System, "", &["u1", "u2"]);
        f.identity.assign("audit", ScopeLevel::System, "", &["u3"]);

        let mut users = f
            .resolver
            .expand_role_members(&["ops".to_string(), "audit".to_string()])
            .await;
        users.sort();
        assert_eq!(users, vec!["u1", "u2", "u3"]);
        assert!(f.resolver.expand_role_members(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_role_branch_does_not_abort_others() {
        let f = fixture().await;
        f.subscribers
            .create_subscriber(&role_subscriber(&f.topic.id, "admin", ScopeLevel::System))
            .await
            .unwrap();
        f.subscribers
            .create_subscriber(&role_subscriber(&f.topic.id, "ops", ScopeLevel::Project))
            .await
            .unwrap();
        f.identity.assign("admin", ScopeLevel::System, "", &["root"]);
        f.identity.assign("ops", ScopeLevel::Project, "P1", &["u3"]);
        f.identity.fail_scope(ScopeLevel::System);

        let recipients = f
            .resolver
            .resolve("server", "create", 0, "D1", "P1")
            .await
            .unwrap();
        assert_eq!(recipients.receiver_ids, vec!["u3"]);
    }

    #[tokio::test]
    async fn test_disabled_robots_are_skipped() {
        let f = fixture().await;
        let active = RobotDbModel::new("a", "webhook", "http://a", "D1");
        let mut disabled = RobotDbModel::new("b", "webhook", "http://b", "D1");
        disabled.enabled = false;
        for robot in [&active, &disabled] {
            f.robots.create_robot(robot).await.unwrap();
            let mut sub = SubscriberDbModel::new(&f.topic.id, SubscriberType::Robot);
            sub.identification = robot.id.clone();
            f.subscribers.create_subscriber(&sub).await.unwrap();
        }

        let recipients = f.resolver.resolve("server", "create", 0, "", "").await.unwrap();
        assert_eq!(recipients.robot_ids, vec![active.id]);
        assert!(recipients.receiver_ids.is_empty());
    }

    #[tokio::test]
    async fn test_resource_scope_filters_subscribers() {
        let f = fixture().await;
        let mut scoped = SubscriberDbModel::new(&f.topic.id, SubscriberType::Receiver);
        scoped.resource_scope = ScopeLevel::Domain.as_str().to_string();
        scoped.resource_attribution_id = "D2".to_string();
        f.subscribers.create_subscriber(&scoped).await.unwrap();
        f.subscribers
            .set_receivers(&scoped.id, &["u5".to_string()])
            .await
            .unwrap();

        let other = f.resolver.resolve("server", "create", 0, "D1", "").await.unwrap();
        assert!(other.is_empty());
        let matched = f.resolver.resolve("server", "create", 0, "D2", "").await.unwrap();
        assert_eq!(matched.receiver_ids, vec!["u5"]);
    }
}
