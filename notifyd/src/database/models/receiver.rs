//! Receiver database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// A human recipient with primary email/mobile contacts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ReceiverDbModel {
    /// External identity reference.
    pub id: String,
    pub name: String,
    pub domain_id: String,
    pub lang: String,
    pub email: String,
    pub mobile: String,
    pub enabled: bool,
    pub enabled_email: bool,
    pub verified_email: bool,
    pub enabled_mobile: bool,
    pub verified_mobile: bool,
    /// Soft-delete marker, set when the identity user vanishes.
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ReceiverDbModel {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        domain_id: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            name: name.into(),
            domain_id: domain_id.into(),
            lang: String::new(),
            email: String::new(),
            mobile: String::new(),
            enabled: true,
            enabled_email: false,
            verified_email: false,
            enabled_mobile: false,
            verified_mobile: false,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Channel-specific contact of a receiver (dingtalk, feishu, workwx, ...).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct SubContactDbModel {
    pub receiver_id: String,
    pub contact_type: String,
    pub contact: String,
    /// Primary contact this one was derived from (e.g. "mobile" for pull-type channels).
    pub parent_contact_type: String,
    pub enabled: bool,
    pub verified: bool,
    pub verified_note: String,
    pub updated_at: i64,
}

impl SubContactDbModel {
    pub fn new(receiver_id: impl Into<String>, contact_type: impl Into<String>) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            contact_type: contact_type.into(),
            contact: String::new(),
            parent_contact_type: String::new(),
            enabled: false,
            verified: false,
            verified_note: String::new(),
            updated_at: now_ms(),
        }
    }
}
