//! Database maintenance.
//!
//! Periodically removes notifications older than the retention window and
//! verification codes that can no longer be redeemed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::database::DbPool;
use crate::database::repositories::{NotificationRepository, SqlxNotificationRepository};
use crate::database::time::{days_ms, now_ms};

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between maintenance passes (default: 1 hour).
    pub interval: Duration,
    /// Notification retention period in days (default: 30).
    pub retention_days: i64,
    /// Verification codes older than this are purged (default: 1 day).
    pub verification_ttl: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention_days: 30,
            verification_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Summary of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub notifications_deleted: u64,
    pub verifications_deleted: u64,
}

/// Database maintenance scheduler.
pub struct MaintenanceScheduler {
    pool: DbPool,
    notifications: SqlxNotificationRepository,
    config: MaintenanceConfig,
    running: Arc<AtomicBool>,
}

impl MaintenanceScheduler {
    pub fn new(pool: DbPool, config: MaintenanceConfig) -> Self {
        Self {
            notifications: SqlxNotificationRepository::new(pool.clone()),
            pool,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the scheduler; it stops when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.running.store(true, Ordering::SeqCst);
            scheduler.run_loop(cancel).await;
            scheduler.running.store(false, Ordering::SeqCst);
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Maintenance scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_maintenance().await {
                        tracing::error!("Maintenance error: {}", e);
                    }
                }
            }
        }
    }

    /// Run all maintenance tasks once.
    pub async fn run_maintenance(&self) -> crate::Result<MaintenanceReport> {
        let report = MaintenanceReport {
            notifications_deleted: self.cleanup_old_notifications().await?,
            verifications_deleted: self.cleanup_stale_verifications().await?,
        };

        if report != MaintenanceReport::default() {
            tracing::info!(
                notifications = report.notifications_deleted,
                verifications = report.verifications_deleted,
                "Database maintenance removed expired rows"
            );
        }
        Ok(report)
    }

    /// Delete notifications (and their delivery rows) past retention.
    pub async fn cleanup_old_notifications(&self) -> crate::Result<u64> {
        let cutoff = now_ms() - days_ms(self.config.retention_days);
        self.notifications.delete_received_before(cutoff).await
    }

    pub async fn cleanup_stale_verifications(&self) -> crate::Result<u64> {
        let cutoff = now_ms() - self.config.verification_ttl.as_millis() as i64;
        let result = sqlx::query("DELETE FROM verifications WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{
        NotificationDbModel, NotificationPriority, ReceiverNotificationDbModel, RecipientType,
    };
    use crate::database::test_pool;

    #[test]
    fn test_default_config() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.interval, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let pool = test_pool().await;
        let repo = SqlxNotificationRepository::new(pool.clone());

        let mut old = NotificationDbModel::new("T1", "email", NotificationPriority::Normal, "{}");
        old.received_at = now_ms() - days_ms(31);
        let row = ReceiverNotificationDbModel::new(&old.id, RecipientType::Receiver, "u1");
        repo.create_notification(&old, &[row]).await.unwrap();

        let fresh = NotificationDbModel::new("T1", "email", NotificationPriority::Normal, "{}");
        repo.create_notification(&fresh, &[]).await.unwrap();

        let scheduler = MaintenanceScheduler::new(pool, MaintenanceConfig::default());
        let report = scheduler.run_maintenance().await.unwrap();
        assert_eq!(report.notifications_deleted, 1);
        assert!(repo.get_notification(&fresh.id).await.is_ok());
        assert!(repo.get_notification(&old.id).await.is_err());
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let pool = test_pool().await;
        let scheduler = Arc::new(MaintenanceScheduler::new(pool, MaintenanceConfig::default()));
        let cancel = CancellationToken::new();
        let handle = scheduler.clone().start(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }
}
