//! Background re-dispatch of notifications that did not fully succeed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DispatchConfig, Dispatcher};
use crate::Result;
use crate::database::repositories::NotificationRepository;
use crate::database::time::now_ms;
use crate::error::ErrorKind;

const TERMINAL_KINDS: &[ErrorKind] = &[
    ErrorKind::InputInvalid,
    ErrorKind::NotFound,
    ErrorKind::Forbidden,
];

pub struct RetryScheduler {
    dispatcher: Arc<Dispatcher>,
    notifications: Arc<dyn NotificationRepository>,
    config: DispatchConfig,
    running: Arc<AtomicBool>,
}

impl RetryScheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        notifications: Arc<dyn NotificationRepository>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            dispatcher,
            notifications,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the scan loop; it stops when `cancel` fires.
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
        let mut interval = tokio::time::interval(self.config.resend_scope);
        // The first tick fires immediately; fresh notifications are still
        // being dispatched by their own task.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Retry scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Retry scan error: {}", e);
                    }
                }
            }
        }
    }

    /// Re-run every eligible notification received within the last two
    /// scan windows. Returns how many were re-dispatched.
    pub async fn run_once(&self) -> Result<usize> {
        let window = 2 * self.config.resend_scope.as_millis() as i64;
        let candidates = self
            .notifications
            .find_retry_candidates(now_ms() - window, self.config.max_send_times, TERMINAL_KINDS)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        info!(count = candidates.len(), "Retrying notifications");
        let mut retried = 0;
        for id in candidates {
            match self.dispatcher.run(&id).await {
                Ok(status) => {
                    debug!(notification_id = %id, status = %status, "Retry finished");
                    retried += 1;
                }
                Err(e) => warn!(notification_id = %id, error = %e, "Retry failed"),
            }
        }
        Ok(retried)
    }
}
