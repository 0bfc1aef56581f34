//! Template repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{ALL_CHANNELS, TemplateDbModel};
use crate::{Error, Result};

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Rows for `(topic, lang)` whose channel is `channel` or `all`.
    async fn find_for(&self, topic: &str, lang: &str, channel: &str)
    -> Result<Vec<TemplateDbModel>>;
    async fn list_by_topic(&self, topic: &str) -> Result<Vec<TemplateDbModel>>;
    async fn exists(&self, channel: &str, topic: &str, kind: &str, lang: &str) -> Result<bool>;
    async fn create_template(&self, template: &TemplateDbModel) -> Result<()>;
    async fn update_template(&self, template: &TemplateDbModel) -> Result<()>;
    async fn delete_by_topic(&self, topic: &str) -> Result<u64>;
    /// Keep the oldest row of every `(channel, topic, kind, lang)` group.
    async fn collapse_duplicates(&self) -> Result<u64>;
    /// Rewrite empty `lang` columns to `lang`.
    async fn fill_empty_lang(&self, lang: &str) -> Result<u64>;
}

pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqlxTemplateRepository {
    async fn find_for(
        &self,
        topic: &str,
        lang: &str,
        channel: &str,
    ) -> Result<Vec<TemplateDbModel>> {
        Ok(sqlx::query_as::<_, TemplateDbModel>(
            r#"
            SELECT * FROM templates
            WHERE topic = ? AND lang = ? AND channel IN (?, ?)
            ORDER BY created_at, rowid
            "#,
        )
        .bind(topic.to_uppercase())
        .bind(lang)
        .bind(ALL_CHANNELS)
        .bind(channel)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_by_topic(&self, topic: &str) -> Result<Vec<TemplateDbModel>> {
        Ok(sqlx::query_as::<_, TemplateDbModel>(
            "SELECT * FROM templates WHERE topic = ? ORDER BY channel, kind, lang",
        )
        .bind(topic.to_uppercase())
        .fetch_all(&self.pool)
        .await?)
    }

    async fn exists(&self, channel: &str, topic: &str, kind: &str, lang: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM templates WHERE channel = ? AND topic = ? AND kind = ? AND lang = ?",
        )
        .bind(channel)
        .bind(topic.to_uppercase())
        .bind(kind)
        .bind(lang)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    async fn create_template(&self, template: &TemplateDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO templates (id, channel, topic, kind, lang, content, example, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&template.id)
        .bind(&template.channel)
        .bind(&template.topic)
        .bind(&template.kind)
        .bind(&template.lang)
        .bind(&template.content)
        .bind(&template.example)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_template(&self, template: &TemplateDbModel) -> Result<()> {
        let result = sqlx::query("UPDATE templates SET content = ?, example = ? WHERE id = ?")
            .bind(&template.content)
            .bind(&template.example)
            .bind(&template.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Template", &template.id));
        }
        Ok(())
    }

    async fn delete_by_topic(&self, topic: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM templates WHERE topic = ?")
            .bind(topic.to_uppercase())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn collapse_duplicates(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM templates
            WHERE rowid NOT IN (
                SELECT MIN(rowid) FROM templates
                GROUP BY channel, topic, kind, lang
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fill_empty_lang(&self, lang: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE templates SET lang = ? WHERE lang = ''")
            .bind(lang)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
