//! Notification log database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Receiver id recorded for deliveries to raw contacts without a receiver.
pub const DEFAULT_RECEIVER_ID: &str = "default";

/// Top-level notification record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct NotificationDbModel {
    pub id: String,
    pub topic: String,
    pub topic_type: String,
    pub channel: String,
    pub priority: String,
    /// JSON payload (or plain text for direct sends).
    pub message: String,
    /// `resource_type/action` for event notifications.
    pub event: String,
    pub tag: String,
    pub status: String,
    pub send_times: i64,
    pub received_at: i64,
    pub updated_at: i64,
}

impl NotificationDbModel {
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        priority: NotificationPriority,
        message: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            topic_type: String::new(),
            channel: channel.into(),
            priority: priority.as_str().to_string(),
            message: message.into(),
            event: String::new(),
            tag: String::new(),
            status: NotificationStatus::Received.as_str().to_string(),
            send_times: 0,
            received_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> Option<NotificationStatus> {
        self.status.parse().ok()
    }

    pub fn priority(&self) -> NotificationPriority {
        self.priority.parse().unwrap_or_default()
    }
}

/// Notification-level status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Received,
    Sending,
    Ok,
    PartOk,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Delivery priority.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    #[default]
    Normal,
    Important,
    Fatal,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Per-recipient delivery row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ReceiverNotificationDbModel {
    pub id: String,
    pub notification_id: String,
    pub receiver_type: String,
    pub receiver_id: String,
    pub contact: String,
    pub send_at: Option<i64>,
    pub send_by: String,
    pub status: String,
    pub failed_reason: String,
    /// [`ErrorKind`](crate::ErrorKind) of the last failure.
    pub failed_kind: String,
    pub updated_at: i64,
}

impl ReceiverNotificationDbModel {
    pub fn new(
        notification_id: impl Into<String>,
        receiver_type: RecipientType,
        receiver_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.into(),
            receiver_type: receiver_type.as_str().to_string(),
            receiver_id: receiver_id.into(),
            contact: String::new(),
            send_at: None,
            send_by: String::new(),
            status: RecipientStatus::Received.as_str().to_string(),
            failed_reason: String::new(),
            failed_kind: String::new(),
            updated_at: now_ms(),
        }
    }

    /// Row for a raw contact that has no receiver record.
    pub fn for_contact(notification_id: impl Into<String>, contact: impl Into<String>) -> Self {
        let mut row = Self::new(notification_id, RecipientType::Contact, DEFAULT_RECEIVER_ID);
        row.contact = contact.into();
        row
    }

    pub fn status(&self) -> RecipientStatus {
        self.status.parse().unwrap_or(RecipientStatus::Received)
    }

    pub fn recipient_type(&self) -> RecipientType {
        self.receiver_type.parse().unwrap_or(RecipientType::Receiver)
    }
}

/// Per-recipient delivery status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Received,
    Sent,
    Ok,
    Fail,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Fail)
    }
}

/// What a delivery row points at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    Receiver,
    Robot,
    Contact,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Notification status as a function of its recipients' statuses.
///
/// Rows still `received` or `sent` keep the notification `sending`.
pub fn roll_up<I>(statuses: I) -> NotificationStatus
where
    I: IntoIterator<Item = RecipientStatus>,
{
    let (mut ok, mut fail, mut pending) = (0usize, 0usize, 0usize);
    for status in statuses {
        match status {
            RecipientStatus::Ok => ok += 1,
            RecipientStatus::Fail => fail += 1,
            RecipientStatus::Received | RecipientStatus::Sent => pending += 1,
        }
    }

    if pending > 0 {
        NotificationStatus::Sending
    } else if fail == 0 && ok > 0 {
        NotificationStatus::Ok
    } else if ok == 0 {
        NotificationStatus::Failed
    } else {
        NotificationStatus::PartOk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RecipientStatus::*;

    #[test]
    fn test_roll_up() {
        assert_eq!(roll_up([Ok, Ok]), NotificationStatus::Ok);
        assert_eq!(roll_up([Fail, Fail]), NotificationStatus::Failed);
        assert_eq!(roll_up([Ok, Fail]), NotificationStatus::PartOk);
        assert_eq!(roll_up([Ok, Sent]), NotificationStatus::Sending);
        assert_eq!(roll_up([Fail, Received]), NotificationStatus::Sending);
        assert_eq!(roll_up([]), NotificationStatus::Failed);
    }

    #[test]
    fn test_priority_default_and_order() {
        assert_eq!(NotificationPriority::default(), NotificationPriority::Normal);
        assert!(NotificationPriority::Fatal > NotificationPriority::Important);
        assert_eq!("important".parse::<NotificationPriority>().unwrap().as_str(), "important");
    }

    #[test]
    fn test_contact_row() {
        let row = ReceiverNotificationDbModel::for_contact("n1", "x@y.z");
        assert_eq!(row.receiver_id, DEFAULT_RECEIVER_ID);
        assert_eq!(row.recipient_type(), RecipientType::Contact);
        assert_eq!(row.status(), RecipientStatus::Received);
    }
}
