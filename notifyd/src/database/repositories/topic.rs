//! Topic repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::TopicDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait TopicRepository: Send + Sync {
    async fn get_topic(&self, id: &str) -> Result<TopicDbModel>;
    async fn get_topic_by_name(&self, name: &str) -> Result<Option<TopicDbModel>>;
    async fn list_topics(&self) -> Result<Vec<TopicDbModel>>;
    async fn create_topic(&self, topic: &TopicDbModel) -> Result<()>;
    async fn update_topic(&self, topic: &TopicDbModel) -> Result<()>;
    /// Enabled topics whose bitmaps cover both masks at the given advance days.
    async fn find_matching(
        &self,
        resource_mask: u64,
        action_mask: u32,
        advance_days: i64,
    ) -> Result<Vec<TopicDbModel>>;
}

pub struct SqlxTopicRepository {
    pool: SqlitePool,
}

impl SqlxTopicRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TopicRepository for SqlxTopicRepository {
    async fn get_topic(&self, id: &str) -> Result<TopicDbModel> {
        sqlx::query_as::<_, TopicDbModel>("SELECT * FROM topics WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Topic", id))
    }

    async fn get_topic_by_name(&self, name: &str) -> Result<Option<TopicDbModel>> {
        Ok(
            sqlx::query_as::<_, TopicDbModel>("SELECT * FROM topics WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_topics(&self) -> Result<Vec<TopicDbModel>> {
        Ok(
            sqlx::query_as::<_, TopicDbModel>("SELECT * FROM topics ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn create_topic(&self, topic: &TopicDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO topics (
                id, name, topic_type, resources, actions, advance_days,
                enabled, webconsole_disable, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&topic.id)
        .bind(&topic.name)
        .bind(&topic.topic_type)
        .bind(topic.resources)
        .bind(topic.actions)
        .bind(topic.advance_days)
        .bind(topic.enabled)
        .bind(topic.webconsole_disable)
        .bind(topic.created_at)
        .bind(topic.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Duplicate(format!("topic {} already exists", topic.name))
            }
            other => Error::DatabaseSqlx(other),
        })?;
        Ok(())
    }

    async fn update_topic(&self, topic: &TopicDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE topics SET
                name = ?,
                topic_type = ?,
                resources = ?,
                actions = ?,
                advance_days = ?,
                enabled = ?,
                webconsole_disable = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&topic.name)
        .bind(&topic.topic_type)
        .bind(topic.resources)
        .bind(topic.actions)
        .bind(topic.advance_days)
        .bind(topic.enabled)
        .bind(topic.webconsole_disable)
        .bind(now_ms())
        .bind(&topic.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Topic", &topic.id));
        }
        Ok(())
    }

    async fn find_matching(
        &self,
        resource_mask: u64,
        action_mask: u32,
        advance_days: i64,
    ) -> Result<Vec<TopicDbModel>> {
        let topics = sqlx::query_as::<_, TopicDbModel>(
            r#"
            SELECT * FROM topics
            WHERE enabled = 1
              AND advance_days = ?
              AND (resources & ?) != 0
              AND (actions & ?) != 0
            ORDER BY name
            "#,
        )
        .bind(advance_days)
        .bind(resource_mask as i64)
        .bind(action_mask as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(topics)
    }
}
