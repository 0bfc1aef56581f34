//! Receiver repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::{ReceiverDbModel, SubContactDbModel};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Receiver repository trait.
#[async_trait]
pub trait ReceiverRepository: Send + Sync {
    /// Fetch a receiver, including soft-deleted ones.
    async fn get_receiver(&self, id: &str) -> Result<ReceiverDbModel>;
    /// Fetch a live receiver by id or, failing that, by name.
    async fn find_by_id_or_name(&self, ident: &str) -> Result<Option<ReceiverDbModel>>;
    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<ReceiverDbModel>>;
    async fn create_receiver(&self, receiver: &ReceiverDbModel) -> Result<()>;
    async fn update_receiver(&self, receiver: &ReceiverDbModel) -> Result<()>;
    async fn soft_delete_receiver(&self, id: &str) -> Result<()>;

    // Sub-contacts
    async fn list_sub_contacts(&self, receiver_id: &str) -> Result<Vec<SubContactDbModel>>;
    async fn upsert_sub_contact(&self, contact: &SubContactDbModel) -> Result<()>;
    async fn delete_sub_contacts(&self, receiver_id: &str) -> Result<()>;
}

/// SQLx implementation of ReceiverRepository.
pub struct SqlxReceiverRepository {
    pool: SqlitePool,
}

impl SqlxReceiverRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiverRepository for SqlxReceiverRepository {
    async fn get_receiver(&self, id: &str) -> Result<ReceiverDbModel> {
        sqlx::query_as::<_, ReceiverDbModel>("SELECT * FROM receivers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Receiver", id))
    }

    async fn find_by_id_or_name(&self, ident: &str) -> Result<Option<ReceiverDbModel>> {
        let by_id = sqlx::query_as::<_, ReceiverDbModel>(
            "SELECT * FROM receivers WHERE id = ? AND deleted = 0",
        )
        .bind(ident)
        .fetch_optional(&self.pool)
        .await?;
        if by_id.is_some() {
            return Ok(by_id);
        }

        let by_name = sqlx::query_as::<_, ReceiverDbModel>(
            "SELECT * FROM receivers WHERE name = ? AND deleted = 0 ORDER BY created_at LIMIT 1",
        )
        .bind(ident)
        .fetch_optional(&self.pool)
        .await?;
        Ok(by_name)
    }

    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<ReceiverDbModel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM receivers WHERE deleted = 0 AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY id");

        let receivers = qb
            .build_query_as::<ReceiverDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Ok(receivers)
    }

    async fn create_receiver(&self, receiver: &ReceiverDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO receivers (
                id, name, domain_id, lang, email, mobile, enabled,
                enabled_email, verified_email, enabled_mobile, verified_mobile,
                deleted, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&receiver.id)
        .bind(&receiver.name)
        .bind(&receiver.domain_id)
        .bind(&receiver.lang)
        .bind(&receiver.email)
        .bind(&receiver.mobile)
        .bind(receiver.enabled)
        .bind(receiver.enabled_email)
        .bind(receiver.verified_email)
        .bind(receiver.enabled_mobile)
        .bind(receiver.verified_mobile)
        .bind(receiver.deleted)
        .bind(receiver.created_at)
        .bind(receiver.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Duplicate(format!("receiver {} already exists", receiver.id))
            }
            other => Error::DatabaseSqlx(other),
        })?;
        Ok(())
    }

    async fn update_receiver(&self, receiver: &ReceiverDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE receivers SET
                name = ?,
                domain_id = ?,
                lang = ?,
                email = ?,
                mobile = ?,
                enabled = ?,
                enabled_email = ?,
                verified_email = ?,
                enabled_mobile = ?,
                verified_mobile = ?,
                deleted = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&receiver.name)
        .bind(&receiver.domain_id)
        .bind(&receiver.lang)
        .bind(&receiver.email)
        .bind(&receiver.mobile)
        .bind(receiver.enabled)
        .bind(receiver.enabled_email)
        .bind(receiver.verified_email)
        .bind(receiver.enabled_mobile)
        .bind(receiver.verified_mobile)
        .bind(receiver.deleted)
        .bind(now_ms())
        .bind(&receiver.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Receiver", &receiver.id));
        }
        Ok(())
    }

    async fn soft_delete_receiver(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE receivers SET deleted = 1, updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_sub_contacts(&self, receiver_id: &str) -> Result<Vec<SubContactDbModel>> {
        let contacts = sqlx::query_as::<_, SubContactDbModel>(
            "SELECT * FROM subcontacts WHERE receiver_id = ? ORDER BY contact_type",
        )
        .bind(receiver_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(contacts)
    }

    async fn upsert_sub_contact(&self, contact: &SubContactDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subcontacts (
                receiver_id, contact_type, contact, parent_contact_type,
                enabled, verified, verified_note, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(receiver_id, contact_type) DO UPDATE SET
                contact = excluded.contact,
                parent_contact_type = excluded.parent_contact_type,
                enabled = excluded.enabled,
                verified = excluded.verified,
                verified_note = excluded.verified_note,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&contact.receiver_id)
        .bind(&contact.contact_type)
        .bind(&contact.contact)
        .bind(&contact.parent_contact_type)
        .bind(contact.enabled)
        .bind(contact.verified)
        .bind(&contact.verified_note)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_sub_contacts(&self, receiver_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM subcontacts WHERE receiver_id = ?")
            .bind(receiver_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
