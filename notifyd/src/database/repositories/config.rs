//! Channel config repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{Attribution, ConfigDbModel};
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn get_config(&self, id: &str) -> Result<ConfigDbModel>;
    /// Config stored for exactly `(channel, domain_id)`.
    async fn find_config(&self, channel: &str, domain_id: &str) -> Result<Option<ConfigDbModel>>;
    /// The system-attributed config of `channel`, if any.
    async fn find_system_config(&self, channel: &str) -> Result<Option<ConfigDbModel>>;
    /// Channels configured for `domain_id` or at system level.
    async fn list_configured_channels(&self, domain_id: &str) -> Result<Vec<String>>;
    async fn create_config(&self, config: &ConfigDbModel) -> Result<()>;
    async fn update_config(&self, config: &ConfigDbModel) -> Result<()>;
    async fn delete_config(&self, id: &str) -> Result<()>;
}

pub struct SqlxConfigRepository {
    pool: SqlitePool,
}

impl SqlxConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepository for SqlxConfigRepository {
    async fn get_config(&self, id: &str) -> Result<ConfigDbModel> {
        sqlx::query_as::<_, ConfigDbModel>("SELECT * FROM configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Config", id))
    }

    async fn find_config(&self, channel: &str, domain_id: &str) -> Result<Option<ConfigDbModel>> {
        Ok(sqlx::query_as::<_, ConfigDbModel>(
            "SELECT * FROM configs WHERE channel = ? AND domain_id = ?",
        )
        .bind(channel)
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_system_config(&self, channel: &str) -> Result<Option<ConfigDbModel>> {
        Ok(sqlx::query_as::<_, ConfigDbModel>(
            "SELECT * FROM configs WHERE channel = ? AND attribution = ? ORDER BY created_at LIMIT 1",
        )
        .bind(channel)
        .bind(Attribution::System.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_configured_channels(&self, domain_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT channel FROM configs
            WHERE domain_id = ? OR attribution = ?
            ORDER BY channel
            "#,
        )
        .bind(domain_id)
        .bind(Attribution::System.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn create_config(&self, config: &ConfigDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO configs (id, channel, domain_id, attribution, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.id)
        .bind(&config.channel)
        .bind(&config.domain_id)
        .bind(&config.attribution)
        .bind(&config.content)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::Duplicate(format!(
                "config for channel {} in domain {} already exists",
                config.channel, config.domain_id
            )),
            other => Error::DatabaseSqlx(other),
        })?;
        Ok(())
    }

    async fn update_config(&self, config: &ConfigDbModel) -> Result<()> {
        let result = sqlx::query("UPDATE configs SET content = ?, updated_at = ? WHERE id = ?")
            .bind(&config.content)
            .bind(now_ms())
            .bind(&config.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Config", &config.id));
        }
        Ok(())
    }

    async fn delete_config(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM configs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ConfigContent, SYSTEM_DOMAIN_ID};
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_unique_channel_domain() {
        let repo = SqlxConfigRepository::new(test_pool().await);
        let content = ConfigContent::from_pairs([("app_key", "k")]);
        let first = ConfigDbModel::new("dingtalk", "d1", Attribution::Domain, &content).unwrap();
        repo.create_config(&first).await.unwrap();

        let second = ConfigDbModel::new("dingtalk", "d1", Attribution::Domain, &content).unwrap();
        assert!(matches!(
            repo.create_config(&second).await,
            Err(Error::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_configured_channels_include_system() {
        let repo = SqlxConfigRepository::new(test_pool().await);
        let content = ConfigContent::default();
        repo.create_config(
            &ConfigDbModel::new("email", SYSTEM_DOMAIN_ID, Attribution::System, &content).unwrap(),
        )
        .await
        .unwrap();
        repo.create_config(
            &ConfigDbModel::new("feishu", "d1", Attribution::Domain, &content).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(
            repo.list_configured_channels("d1").await.unwrap(),
            vec!["email".to_string(), "feishu".to_string()]
        );
        assert_eq!(
            repo.list_configured_channels("d2").await.unwrap(),
            vec!["email".to_string()]
        );
        assert!(repo.find_system_config("email").await.unwrap().is_some());
        assert!(repo.find_config("feishu", "d2").await.unwrap().is_none());
    }
}
