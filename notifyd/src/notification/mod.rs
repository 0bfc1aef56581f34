//! Notification creation, fan-out and delivery.
//!
//! The [`Dispatcher`] turns direct sends, resource events and contact
//! notifications into notification rows and drives each one through the
//! channel drivers; the [`RetryScheduler`] re-runs notifications that did
//! not fully succeed.

pub mod channels;
mod retry;
mod service;

pub use retry::RetryScheduler;
pub use service::{
    ContactNotify, Dispatcher, EventNotify, EventNotifyResult, FailedElem, NotificationCreate,
};

use std::time::Duration;

/// Dispatch engine settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent sends across all notifications.
    pub worker_count: usize,
    /// Per-attempt deadline for drivers without their own.
    pub send_timeout: Duration,
    /// Per-attempt deadline of the email driver.
    pub email_timeout: Duration,
    /// Attempts per notification, the first one included.
    pub max_send_times: i64,
    /// Retry scan interval.
    pub resend_scope: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 16,
            send_timeout: Duration::from_secs(60),
            email_timeout: Duration::from_secs(300),
            max_send_times: 3,
            resend_scope: Duration::from_secs(60),
        }
    }
}
