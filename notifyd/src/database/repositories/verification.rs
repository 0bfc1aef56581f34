//! Verification repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::VerificationDbModel;

#[async_trait]
pub trait VerificationRepository: Send + Sync {
    async fn get_verification(
        &self,
        receiver_id: &str,
        channel: &str,
    ) -> Result<Option<VerificationDbModel>>;

    /// Insert `row`, or overwrite the existing row for the pair when it was
    /// created at least `throttle_ms` before `row.created_at`.
    ///
    /// Returns `false` when an existing row is still inside the window.
    async fn issue(&self, row: &VerificationDbModel, throttle_ms: i64) -> Result<bool>;

    async fn delete_verification(&self, receiver_id: &str, channel: &str) -> Result<()>;
}

pub struct SqlxVerificationRepository {
    pool: SqlitePool,
}

impl SqlxVerificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VerificationRepository for SqlxVerificationRepository {
    async fn get_verification(
        &self,
        receiver_id: &str,
        channel: &str,
    ) -> Result<Option<VerificationDbModel>> {
        Ok(sqlx::query_as::<_, VerificationDbModel>(
            "SELECT * FROM verifications WHERE receiver_id = ? AND channel = ?",
        )
        .bind(receiver_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn issue(&self, row: &VerificationDbModel, throttle_ms: i64) -> Result<bool> {
        // Single statement: the primary key serializes concurrent issuers.
        let result = sqlx::query(
            r#"
            INSERT INTO verifications (receiver_id, channel, token, contact, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(receiver_id, channel) DO UPDATE SET
                token = excluded.token,
                contact = excluded.contact,
                created_at = excluded.created_at
            WHERE excluded.created_at >= verifications.created_at + ?
            "#,
        )
        .bind(&row.receiver_id)
        .bind(&row.channel)
        .bind(&row.token)
        .bind(&row.contact)
        .bind(row.created_at)
        .bind(throttle_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_verification(&self, receiver_id: &str, channel: &str) -> Result<()> {
        sqlx::query("DELETE FROM verifications WHERE receiver_id = ? AND channel = ?")
            .bind(receiver_id)
            .bind(channel)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
