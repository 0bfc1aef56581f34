//! Robot repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::RobotDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait RobotRepository: Send + Sync {
    async fn get_robot(&self, id: &str) -> Result<RobotDbModel>;
    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<RobotDbModel>>;
    async fn create_robot(&self, robot: &RobotDbModel) -> Result<()>;
    async fn update_robot(&self, robot: &RobotDbModel) -> Result<()>;
    async fn delete_robot(&self, id: &str) -> Result<()>;
}

pub struct SqlxRobotRepository {
    pool: SqlitePool,
}

impl SqlxRobotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RobotRepository for SqlxRobotRepository {
    async fn get_robot(&self, id: &str) -> Result<RobotDbModel> {
        sqlx::query_as::<_, RobotDbModel>("SELECT * FROM robots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Robot", id))
    }

    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<RobotDbModel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM robots WHERE id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY id");

        Ok(qb
            .build_query_as::<RobotDbModel>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn create_robot(&self, robot: &RobotDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO robots (
                id, name, robot_type, address, lang, enabled, domain_id,
                header, body, msg_key, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&robot.id)
        .bind(&robot.name)
        .bind(&robot.robot_type)
        .bind(&robot.address)
        .bind(&robot.lang)
        .bind(robot.enabled)
        .bind(&robot.domain_id)
        .bind(&robot.header)
        .bind(&robot.body)
        .bind(&robot.msg_key)
        .bind(robot.created_at)
        .bind(robot.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_robot(&self, robot: &RobotDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE robots SET
                name = ?,
                address = ?,
                lang = ?,
                enabled = ?,
                header = ?,
                body = ?,
                msg_key = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&robot.name)
        .bind(&robot.address)
        .bind(&robot.lang)
        .bind(robot.enabled)
        .bind(&robot.header)
        .bind(&robot.body)
        .bind(&robot.msg_key)
        .bind(now_ms())
        .bind(&robot.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Robot", &robot.id));
        }
        Ok(())
    }

    async fn delete_robot(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM robots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
