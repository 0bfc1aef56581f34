//! Subscriber repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{ScopeLevel, SubscriberDbModel, SubscriberType};
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait SubscriberRepository: Send + Sync {
    async fn get_subscriber(&self, id: &str) -> Result<SubscriberDbModel>;
    async fn list_by_topic(&self, topic_id: &str) -> Result<Vec<SubscriberDbModel>>;
    async fn create_subscriber(&self, subscriber: &SubscriberDbModel) -> Result<()>;
    async fn update_subscriber(&self, subscriber: &SubscriberDbModel) -> Result<()>;
    async fn delete_subscriber(&self, id: &str) -> Result<()>;

    /// Enabled subscribers of `topic_id` whose resource scope matches the event.
    async fn find_suitable(
        &self,
        topic_id: &str,
        project_domain_id: &str,
        project_id: &str,
    ) -> Result<Vec<SubscriberDbModel>>;

    /// Receiver ids joined to a receiver-type subscriber, sorted.
    async fn list_receivers(&self, subscriber_id: &str) -> Result<Vec<String>>;
    /// Replace the join rows of a subscriber with exactly `receiver_ids`.
    async fn set_receivers(&self, subscriber_id: &str, receiver_ids: &[String]) -> Result<()>;
    /// Drop a receiver from every subscriber.
    async fn remove_receiver(&self, receiver_id: &str) -> Result<u64>;
    /// Delete robot subscribers that reference `robot_id`.
    async fn delete_by_robot(&self, robot_id: &str) -> Result<u64>;
}

pub struct SqlxSubscriberRepository {
    pool: SqlitePool,
}

impl SqlxSubscriberRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Sorted-merge diff of two sorted, deduplicated id lists.
///
/// Returns `(to_add, to_remove)`.
pub(crate) fn diff_sorted(current: &[String], wanted: &[String]) -> (Vec<String>, Vec<String>) {
    let (mut add, mut remove) = (Vec::new(), Vec::new());
    let (mut i, mut j) = (0, 0);
    while i < current.len() && j < wanted.len() {
        match current[i].cmp(&wanted[j]) {
            std::cmp::Ordering::Less => {
                remove.push(current[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                add.push(wanted[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    remove.extend(current[i..].iter().cloned());
    add.extend(wanted[j..].iter().cloned());
    (add, remove)
}

#[async_trait]
impl SubscriberRepository for SqlxSubscriberRepository {
    async fn get_subscriber(&self, id: &str) -> Result<SubscriberDbModel> {
        sqlx::query_as::<_, SubscriberDbModel>("SELECT * FROM subscribers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Subscriber", id))
    }

    async fn list_by_topic(&self, topic_id: &str) -> Result<Vec<SubscriberDbModel>> {
        Ok(sqlx::query_as::<_, SubscriberDbModel>(
            "SELECT * FROM subscribers WHERE topic_id = ? ORDER BY created_at",
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_subscriber(&self, subscriber: &SubscriberDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscribers (
                id, topic_id, subscriber_type, identification, role_scope, scope,
                domain_id, resource_scope, resource_attribution_id, enabled,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&subscriber.id)
        .bind(&subscriber.topic_id)
        .bind(&subscriber.subscriber_type)
        .bind(&subscriber.identification)
        .bind(&subscriber.role_scope)
        .bind(&subscriber.scope)
        .bind(&subscriber.domain_id)
        .bind(&subscriber.resource_scope)
        .bind(&subscriber.resource_attribution_id)
        .bind(subscriber.enabled)
        .bind(subscriber.created_at)
        .bind(subscriber.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_subscriber(&self, subscriber: &SubscriberDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscribers SET
                identification = ?,
                role_scope = ?,
                resource_scope = ?,
                resource_attribution_id = ?,
                enabled = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&subscriber.identification)
        .bind(&subscriber.role_scope)
        .bind(&subscriber.resource_scope)
        .bind(&subscriber.resource_attribution_id)
        .bind(subscriber.enabled)
        .bind(now_ms())
        .bind(&subscriber.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Subscriber", &subscriber.id));
        }
        Ok(())
    }

    async fn delete_subscriber(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM subscribers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_suitable(
        &self,
        topic_id: &str,
        project_domain_id: &str,
        project_id: &str,
    ) -> Result<Vec<SubscriberDbModel>> {
        let subscribers = sqlx::query_as::<_, SubscriberDbModel>(
            r#"
            SELECT * FROM subscribers
            WHERE topic_id = ?
              AND enabled = 1
              AND (
                resource_scope = ?
                OR (resource_scope = ? AND ? != '' AND resource_attribution_id = ?)
                OR (resource_scope = ? AND ? != '' AND resource_attribution_id = ?)
              )
            ORDER BY created_at
            "#,
        )
        .bind(topic_id)
        .bind(ScopeLevel::System.as_str())
        .bind(ScopeLevel::Domain.as_str())
        .bind(project_domain_id)
        .bind(project_domain_id)
        .bind(ScopeLevel::Project.as_str())
        .bind(project_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscribers)
    }

    async fn list_receivers(&self, subscriber_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT receiver_id FROM subscriber_receivers WHERE subscriber_id = ? ORDER BY receiver_id",
        )
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn set_receivers(&self, subscriber_id: &str, receiver_ids: &[String]) -> Result<()> {
        let mut wanted: Vec<String> = receiver_ids.to_vec();
        wanted.sort();
        wanted.dedup();

        let mut tx = self.pool.begin().await?;

        let current: Vec<String> = sqlx::query_as::<_, (String,)>(
            "SELECT receiver_id FROM subscriber_receivers WHERE subscriber_id = ? ORDER BY receiver_id",
        )
        .bind(subscriber_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|r| r.0)
        .collect();

        let (add, remove) = diff_sorted(&current, &wanted);

        for receiver_id in &remove {
            sqlx::query(
                "DELETE FROM subscriber_receivers WHERE subscriber_id = ? AND receiver_id = ?",
            )
            .bind(subscriber_id)
            .bind(receiver_id)
            .execute(&mut *tx)
            .await?;
        }
        for receiver_id in &add {
            sqlx::query("INSERT INTO subscriber_receivers (subscriber_id, receiver_id) VALUES (?, ?)")
                .bind(subscriber_id)
                .bind(receiver_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_receiver(&self, receiver_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM subscriber_receivers WHERE receiver_id = ?")
            .bind(receiver_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_robot(&self, robot_id: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM subscribers WHERE subscriber_type = ? AND identification = ?")
                .bind(SubscriberType::Robot.as_str())
                .bind(robot_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{TopicDbModel, TopicType};
    use crate::database::repositories::{SqlxTopicRepository, TopicRepository};
    use crate::database::test_pool;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_sorted() {
        let (add, remove) = diff_sorted(&ids(&["a", "c", "d"]), &ids(&["b", "c", "e"]));
        assert_eq!(add, ids(&["b", "e"]));
        assert_eq!(remove, ids(&["a", "d"]));

        let (add, remove) = diff_sorted(&ids(&["a"]), &ids(&["a"]));
        assert!(add.is_empty() && remove.is_empty());
    }

    async fn setup() -> (SqlxSubscriberRepository, String) {
        let pool = test_pool().await;
        let topic = TopicDbModel::new("T1", TopicType::Resource, 1, 1);
        SqlxTopicRepository::new(pool.clone())
            .create_topic(&topic)
            .await
            .unwrap();
        (SqlxSubscriberRepository::new(pool), topic.id)
    }

    #[tokio::test]
    async fn test_set_receivers_is_idempotent() {
        let (repo, topic_id) = setup().await;
        let sub = SubscriberDbModel::new(&topic_id, SubscriberType::Receiver);
        repo.create_subscriber(&sub).await.unwrap();

        repo.set_receivers(&sub.id, &ids(&["u2", "u1", "u1"])).await.unwrap();
        assert_eq!(repo.list_receivers(&sub.id).await.unwrap(), ids(&["u1", "u2"]));

        repo.set_receivers(&sub.id, &ids(&["u2", "u1"])).await.unwrap();
        assert_eq!(repo.list_receivers(&sub.id).await.unwrap(), ids(&["u1", "u2"]));

        repo.set_receivers(&sub.id, &ids(&["u3"])).await.unwrap();
        assert_eq!(repo.list_receivers(&sub.id).await.unwrap(), ids(&["u3"]));
    }

    #[tokio::test]
    async fn test_find_suitable_scope_filter() {
        let (repo, topic_id) = setup().await;

        let system = SubscriberDbModel::new(&topic_id, SubscriberType::Receiver);
        repo.create_subscriber(&system).await.unwrap();

        let mut domain = SubscriberDbModel::new(&topic_id, SubscriberType::Receiver);
        domain.resource_scope = "domain".to_string();
        domain.resource_attribution_id = "D1".to_string();
        repo.create_subscriber(&domain).await.unwrap();

        let mut project = SubscriberDbModel::new(&topic_id, SubscriberType::Receiver);
        project.resource_scope = "project".to_string();
        project.resource_attribution_id = "P1".to_string();
        repo.create_subscriber(&project).await.unwrap();

        let mut disabled = SubscriberDbModel::new(&topic_id, SubscriberType::Receiver);
        disabled.enabled = false;
        repo.create_subscriber(&disabled).await.unwrap();

        assert_eq!(repo.find_suitable(&topic_id, "", "").await.unwrap().len(), 1);
        assert_eq!(repo.find_suitable(&topic_id, "D1", "").await.unwrap().len(), 2);
        assert_eq!(repo.find_suitable(&topic_id, "D1", "P1").await.unwrap().len(), 3);
        assert_eq!(repo.find_suitable(&topic_id, "D2", "P2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_robot() {
        let (repo, topic_id) = setup().await;
        let mut sub = SubscriberDbModel::new(&topic_id, SubscriberType::Robot);
        sub.identification = "r1".to_string();
        repo.create_subscriber(&sub).await.unwrap();

        assert_eq!(repo.delete_by_robot("r1").await.unwrap(), 1);
        assert!(repo.list_by_topic(&topic_id).await.unwrap().is_empty());
    }
}
