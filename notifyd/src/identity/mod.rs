//! Identity service client.
//!
//! The dispatcher only needs three things from identity: looking up a user,
//! expanding a role into its members, and a stream of user changes so the
//! receiver directory stays in sync. [`IdentityClient`] is that seam;
//! [`StaticIdentityClient`] is an in-memory implementation used by tests and
//! single-node deployments without an identity backend.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::database::models::ScopeLevel;
use crate::{Error, Result};

/// A user as reported by the identity service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub name: String,
    pub domain_id: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub is_system_account: bool,
}

/// Role-assignment filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleAssignmentQuery {
    pub roles: Vec<String>,
    /// Include assignments inherited through groups.
    pub effective: bool,
    pub scope: ScopeLevel,
    pub project_domain_id: Option<String>,
    pub project_id: Option<String>,
}

impl RoleAssignmentQuery {
    pub fn new(role: impl Into<String>, scope: ScopeLevel) -> Self {
        Self {
            roles: vec![role.into()],
            effective: true,
            scope,
            project_domain_id: None,
            project_id: None,
        }
    }

    pub fn with_domain(mut self, domain_id: impl Into<String>) -> Self {
        self.project_domain_id = Some(domain_id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// The id the query is pinned to at its scope level.
    fn target(&self) -> &str {
        match self.scope {
            ScopeLevel::System => "",
            ScopeLevel::Domain => self.project_domain_id.as_deref().unwrap_or_default(),
            ScopeLevel::Project => self.project_id.as_deref().unwrap_or_default(),
        }
    }
}

/// Change notification from the identity watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Added(IdentityUser),
    Updated(IdentityUser),
    Deleted(String),
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Resolve a user by id, falling back to name.
    async fn get_user(&self, id_or_name: &str) -> Result<IdentityUser>;

    /// User ids holding any of the query's roles at its scope.
    async fn list_role_assignments(&self, query: &RoleAssignmentQuery) -> Result<Vec<String>>;

    /// Subscribe to user change events, when the backend supports watching.
    fn watch(&self) -> Option<broadcast::Receiver<UserEvent>> {
        None
    }
}

type AssignmentKey = (String, ScopeLevel, String);

/// In-memory identity backend.
pub struct StaticIdentityClient {
    users: RwLock<HashMap<String, IdentityUser>>,
    assignments: RwLock<HashMap<AssignmentKey, Vec<String>>>,
    failing_scopes: RwLock<Vec<ScopeLevel>>,
    events: broadcast::Sender<UserEvent>,
}

impl Default for StaticIdentityClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticIdentityClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            users: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            failing_scopes: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn add_user(&self, user: IdentityUser) {
        self.users.write().insert(user.id.clone(), user);
    }

    /// Assign `role` to `user_ids` at `scope`, pinned to `target`
    /// (empty for system, the domain id or the project id otherwise).
    pub fn assign(&self, role: &str, scope: ScopeLevel, target: &str, user_ids: &[&str]) {
        self.assignments.write().insert(
            (role.to_string(), scope, target.to_string()),
            user_ids.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Make every query at `scope` fail.
    pub fn fail_scope(&self, scope: ScopeLevel) {
        self.failing_scopes.write().push(scope);
    }

    /// Apply and broadcast a user change.
    pub fn publish(&self, event: UserEvent) {
        match &event {
            UserEvent::Added(user) | UserEvent::Updated(user) => self.add_user(user.clone()),
            UserEvent::Deleted(id) => {
                self.users.write().remove(id);
            }
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl IdentityClient for StaticIdentityClient {
    async fn get_user(&self, id_or_name: &str) -> Result<IdentityUser> {
        let users = self.users.read();
        users
            .get(id_or_name)
            .or_else(|| users.values().find(|u| u.name == id_or_name))
            .cloned()
            .ok_or_else(|| Error::not_found("User", id_or_name))
    }

    async fn list_role_assignments(&self, query: &RoleAssignmentQuery) -> Result<Vec<String>> {
        if self.failing_scopes.read().contains(&query.scope) {
            return Err(Error::Transient(format!(
                "identity service unavailable for {} scope",
                query.scope
            )));
        }
        let assignments = self.assignments.read();
        let mut users: Vec<String> = query
            .roles
            .iter()
            .filter_map(|role| {
                assignments.get(&(role.clone(), query.scope, query.target().to_string()))
            })
            .flatten()
            .cloned()
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    fn watch(&self) -> Option<broadcast::Receiver<UserEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> IdentityUser {
        IdentityUser {
            id: id.to_string(),
            name: format!("{}-name", id),
            domain_id: "D1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_user_by_id_or_name() {
        let client = StaticIdentityClient::new();
        client.add_user(user("u1"));
        assert_eq!(client.get_user("u1").await.unwrap().id, "u1");
        assert_eq!(client.get_user("u1-name").await.unwrap().id, "u1");
        assert!(matches!(
            client.get_user("nobody").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_role_assignments_are_scoped() {
        let client = StaticIdentityClient::new();
        client.assign("admin", ScopeLevel::Domain, "D1", &["u2", "u1"]);

        let d1 = RoleAssignmentQuery::new("admin", ScopeLevel::Domain).with_domain("D1");
        assert_eq!(client.list_role_assignments(&d1).await.unwrap(), vec!["u1", "u2"]);

        let d2 = RoleAssignmentQuery::new("admin", ScopeLevel::Domain).with_domain("D2");
        assert!(client.list_role_assignments(&d2).await.unwrap().is_empty());

        client.fail_scope(ScopeLevel::Domain);
        assert!(client.list_role_assignments(&d1).await.is_err());
    }

    #[tokio::test]
    async fn test_watch_receives_published_events() {
        let client = StaticIdentityClient::new();
        let mut rx = client.watch().unwrap();
        client.publish(UserEvent::Added(user("u3")));
        assert_eq!(rx.recv().await.unwrap(), UserEvent::Added(user("u3")));
        client.publish(UserEvent::Deleted("u3".to_string()));
        assert!(client.get_user("u3").await.is_err());
    }
}
