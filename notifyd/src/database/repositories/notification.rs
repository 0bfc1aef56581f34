//! Notification log repository.
//!
//! Writes issued by the delivery workers go through
//! [`retry_on_sqlite_busy`] since many recipients update concurrently.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    NotificationDbModel, NotificationStatus, ReceiverNotificationDbModel, RecipientStatus,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::error::ErrorKind;
use crate::{Error, Result};

/// Outcome recorded on a delivery row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub status: RecipientStatus,
    pub failed_reason: String,
    pub failed_kind: Option<ErrorKind>,
}

impl DeliveryOutcome {
    pub fn ok() -> Self {
        Self {
            status: RecipientStatus::Ok,
            failed_reason: String::new(),
            failed_kind: None,
        }
    }

    pub fn failed(error: &Error) -> Self {
        Self {
            status: RecipientStatus::Fail,
            failed_reason: error.to_string(),
            failed_kind: Some(error.kind()),
        }
    }
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a notification and its delivery rows atomically.
    async fn create_notification(
        &self,
        notification: &NotificationDbModel,
        rows: &[ReceiverNotificationDbModel],
    ) -> Result<()>;
    async fn get_notification(&self, id: &str) -> Result<NotificationDbModel>;
    async fn list_receiver_rows(&self, notification_id: &str)
    -> Result<Vec<ReceiverNotificationDbModel>>;
    async fn list_for_receiver(
        &self,
        receiver_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationDbModel>>;

    /// Move to `sending` and bump `send_times`. Returns the new counter.
    async fn begin_attempt(&self, id: &str) -> Result<i64>;
    async fn set_status(&self, id: &str, status: NotificationStatus) -> Result<()>;

    /// Record the pre-send transition `received -> sent` for every
    /// `(row_id, contact)` of one driver call. All rows move or none do.
    async fn mark_sent(&self, rows: &[(String, String)], send_by: &str) -> Result<()>;
    /// Record the terminal outcome of one delivery row.
    async fn record_outcome(&self, row_id: &str, outcome: &DeliveryOutcome) -> Result<()>;

    /// Notifications eligible for another pass.
    async fn find_retry_candidates(
        &self,
        received_after_ms: i64,
        max_send_times: i64,
        terminal_kinds: &[ErrorKind],
    ) -> Result<Vec<String>>;

    /// Delete notifications received before `cutoff_ms`; rows cascade.
    async fn delete_received_before(&self, cutoff_ms: i64) -> Result<u64>;
}

pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn create_notification(
        &self,
        notification: &NotificationDbModel,
        rows: &[ReceiverNotificationDbModel],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, topic, topic_type, channel, priority, message, event, tag,
                status, send_times, received_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.topic)
        .bind(&notification.topic_type)
        .bind(&notification.channel)
        .bind(&notification.priority)
        .bind(&notification.message)
        .bind(&notification.event)
        .bind(&notification.tag)
        .bind(&notification.status)
        .bind(notification.send_times)
        .bind(notification.received_at)
        .bind(notification.updated_at)
        .execute(&mut *tx)
        .await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO receiver_notifications (
                    id, notification_id, receiver_type, receiver_id, contact, send_at,
                    send_by, status, failed_reason, failed_kind, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.notification_id)
            .bind(&row.receiver_type)
            .bind(&row.receiver_id)
            .bind(&row.contact)
            .bind(row.send_at)
            .bind(&row.send_by)
            .bind(&row.status)
            .bind(&row.failed_reason)
            .bind(&row.failed_kind)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_notification(&self, id: &str) -> Result<NotificationDbModel> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn list_receiver_rows(
        &self,
        notification_id: &str,
    ) -> Result<Vec<ReceiverNotificationDbModel>> {
        Ok(sqlx::query_as::<_, ReceiverNotificationDbModel>(
            "SELECT * FROM receiver_notifications WHERE notification_id = ? ORDER BY receiver_id, id",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_for_receiver(
        &self,
        receiver_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationDbModel>> {
        Ok(sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT n.* FROM notifications n
            JOIN receiver_notifications rn ON rn.notification_id = n.id
            WHERE rn.receiver_id = ?
            ORDER BY n.received_at DESC
            LIMIT ?
            "#,
        )
        .bind(receiver_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn begin_attempt(&self, id: &str) -> Result<i64> {
        retry_on_sqlite_busy("begin_attempt", || async {
            let row: Option<(i64,)> = sqlx::query_as(
                r#"
                UPDATE notifications
                SET status = ?, send_times = send_times + 1, updated_at = ?
                WHERE id = ?
                RETURNING send_times
                "#,
            )
            .bind(NotificationStatus::Sending.as_str())
            .bind(now_ms())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|r| r.0)
                .ok_or_else(|| Error::not_found("Notification", id))
        })
        .await
    }

    async fn set_status(&self, id: &str, status: NotificationStatus) -> Result<()> {
        retry_on_sqlite_busy("set_notification_status", || async {
            sqlx::query("UPDATE notifications SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn mark_sent(&self, rows: &[(String, String)], send_by: &str) -> Result<()> {
        retry_on_sqlite_busy("mark_sent", || async {
            let now = now_ms();
            let mut tx = self.pool.begin().await?;
            for (row_id, contact) in rows {
                sqlx::query(
                    r#"
                    UPDATE receiver_notifications
                    SET status = ?, contact = ?, send_by = ?, send_at = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(RecipientStatus::Sent.as_str())
                .bind(contact)
                .bind(send_by)
                .bind(now)
                .bind(now)
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn record_outcome(&self, row_id: &str, outcome: &DeliveryOutcome) -> Result<()> {
        let kind = outcome
            .failed_kind
            .map(|k| k.to_string())
            .unwrap_or_default();
        retry_on_sqlite_busy("record_outcome", || async {
            sqlx::query(
                r#"
                UPDATE receiver_notifications
                SET status = ?, failed_reason = ?, failed_kind = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(outcome.status.as_str())
            .bind(&outcome.failed_reason)
            .bind(&kind)
            .bind(now_ms())
            .bind(row_id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    async fn find_retry_candidates(
        &self,
        received_after_ms: i64,
        max_send_times: i64,
        terminal_kinds: &[ErrorKind],
    ) -> Result<Vec<String>> {
        // A notification qualifies while at least one of its rows is not ok
        // and did not fail with a terminal kind.
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            r#"
            SELECT n.id FROM notifications n
            WHERE n.status != 'ok'
              AND n.received_at > "#,
        );
        qb.push_bind(received_after_ms);
        qb.push(" AND n.send_times < ");
        qb.push_bind(max_send_times);
        qb.push(
            r#"
              AND EXISTS (
                SELECT 1 FROM receiver_notifications rn
                WHERE rn.notification_id = n.id
                  AND rn.status != 'ok'
                  AND (rn.failed_kind = '' OR rn.failed_kind NOT IN ("#,
        );
        let mut separated = qb.separated(", ");
        for kind in terminal_kinds {
            separated.push_bind(kind.to_string());
        }
        separated.push_unseparated("))) ORDER BY n.received_at");

        let rows: Vec<(String,)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn delete_received_before(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notifications WHERE received_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{NotificationPriority, RecipientType};
    use crate::database::test_pool;

    async fn seed(repo: &SqlxNotificationRepository, receivers: &[&str]) -> NotificationDbModel {
        let n = NotificationDbModel::new("T1", "email", NotificationPriority::Normal, "{}");
        let rows: Vec<_> = receivers
            .iter()
            .map(|r| ReceiverNotificationDbModel::new(&n.id, RecipientType::Receiver, *r))
            .collect();
        repo.create_notification(&n, &rows).await.unwrap();
        n
    }

    #[tokio::test]
    async fn test_begin_attempt_increments() {
        let repo = SqlxNotificationRepository::new(test_pool().await);
        let n = seed(&repo, &["u1"]).await;
        assert_eq!(repo.begin_attempt(&n.id).await.unwrap(), 1);
        assert_eq!(repo.begin_attempt(&n.id).await.unwrap(), 2);
        let stored = repo.get_notification(&n.id).await.unwrap();
        assert_eq!(stored.status(), Some(NotificationStatus::Sending));
        assert_eq!(stored.send_times, 2);
    }

    #[tokio::test]
    async fn test_row_transitions() {
        let repo = SqlxNotificationRepository::new(test_pool().await);
        let n = seed(&repo, &["u1"]).await;
        let row = &repo.list_receiver_rows(&n.id).await.unwrap()[0];

        repo.mark_sent(&[(row.id.clone(), "a@b.c".to_string())], "email")
            .await
            .unwrap();
        let sent = &repo.list_receiver_rows(&n.id).await.unwrap()[0];
        assert_eq!(sent.status(), RecipientStatus::Sent);
        assert!(sent.send_at.is_some());

        let err = Error::vendor_rejected("bad mailbox");
        repo.record_outcome(&row.id, &DeliveryOutcome::failed(&err))
            .await
            .unwrap();
        let failed = &repo.list_receiver_rows(&n.id).await.unwrap()[0];
        assert_eq!(failed.status(), RecipientStatus::Fail);
        assert_eq!(failed.failed_reason, "Vendor rejected: bad mailbox");
        assert_eq!(failed.failed_kind, "vendor_rejected");
    }

    #[tokio::test]
    async fn test_mark_sent_is_all_or_nothing() {
        let repo = SqlxNotificationRepository::new(test_pool().await);
        let n = seed(&repo, &["u1", "u2"]).await;
        let rows = repo.list_receiver_rows(&n.id).await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_contact BEFORE UPDATE ON receiver_notifications
            WHEN NEW.contact = 'broken'
            BEGIN SELECT RAISE(ABORT, 'contact rejected'); END
            "#,
        )
        .execute(&repo.pool)
        .await
        .unwrap();

        let batch = vec![
            (rows[0].id.clone(), "a@b.c".to_string()),
            (rows[1].id.clone(), "broken".to_string()),
        ];
        assert!(repo.mark_sent(&batch, "email").await.is_err());
        for row in repo.list_receiver_rows(&n.id).await.unwrap() {
            assert_eq!(row.status(), RecipientStatus::Received);
            assert!(row.send_at.is_none());
        }
    }

    #[tokio::test]
    async fn test_retry_candidates_skip_terminal_and_capped() {
        let repo = SqlxNotificationRepository::new(test_pool().await);
        let terminal = [ErrorKind::InputInvalid, ErrorKind::NotFound, ErrorKind::Forbidden];

        let retryable = seed(&repo, &["u1"]).await;
        let row = &repo.list_receiver_rows(&retryable.id).await.unwrap()[0];
        repo.begin_attempt(&retryable.id).await.unwrap();
        repo.record_outcome(&row.id, &DeliveryOutcome::failed(&Error::Timeout))
            .await
            .unwrap();
        repo.set_status(&retryable.id, NotificationStatus::Failed)
            .await
            .unwrap();

        let hopeless = seed(&repo, &["u2"]).await;
        let row = &repo.list_receiver_rows(&hopeless.id).await.unwrap()[0];
        repo.begin_attempt(&hopeless.id).await.unwrap();
        repo.record_outcome(
            &row.id,
            &DeliveryOutcome::failed(&Error::input_invalid("channel not enabled")),
        )
        .await
        .unwrap();
        repo.set_status(&hopeless.id, NotificationStatus::Failed)
            .await
            .unwrap();

        let found = repo.find_retry_candidates(0, 3, &terminal).await.unwrap();
        assert_eq!(found, vec![retryable.id.clone()]);

        // At the cap nothing is re-enqueued.
        assert!(repo.find_retry_candidates(0, 1, &terminal).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_received_before_cascades() {
        let repo = SqlxNotificationRepository::new(test_pool().await);
        let n = seed(&repo, &["u1", "u2"]).await;
        assert_eq!(repo.delete_received_before(n.received_at + 1).await.unwrap(), 1);
        assert!(repo.list_receiver_rows(&n.id).await.unwrap().is_empty());
    }
}
