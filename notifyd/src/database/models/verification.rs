//! Verification token database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Single outstanding verification code per (receiver, channel).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct VerificationDbModel {
    pub receiver_id: String,
    pub channel: String,
    pub token: String,
    /// The address the code was issued for.
    pub contact: String,
    pub created_at: i64,
}
