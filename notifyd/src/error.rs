//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification.
///
/// The kind of the last failure is persisted next to each per-recipient
/// delivery row so the retry scheduler can skip terminal failures without
/// parsing free-form reasons.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InputInvalid,
    NotFound,
    Forbidden,
    Duplicate,
    IncompleteConfig,
    NotSupported,
    NotImplemented,
    VendorRejected,
    TokenExpired,
    Timeout,
    Throttled,
    Transient,
    Internal,
}

impl ErrorKind {
    /// Terminal kinds are never retried by the scheduler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InputInvalid | Self::NotFound | Self::Forbidden)
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: String, id: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Incomplete config for {channel}: {detail}")]
    IncompleteConfig { channel: String, detail: String },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Vendor rejected: {0}")]
    VendorRejected(String),

    #[error("Access token expired")]
    TokenExpired,

    #[error("timeout")]
    Timeout,

    /// A verification code was requested again inside the cool-down window.
    #[error("Verification requested too frequently, please try again later")]
    VerifyFrequently,

    #[error("The verification code has expired, please request a new one")]
    VerifyExpired,

    #[error("The verification code is incorrect")]
    VerifyIncorrect,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn input_invalid(msg: impl Into<String>) -> Self {
        Self::InputInvalid(msg.into())
    }

    pub fn vendor_rejected(msg: impl Into<String>) -> Self {
        Self::VendorRejected(msg.into())
    }

    pub fn incomplete_config(channel: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IncompleteConfig {
            channel: channel.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputInvalid(_) | Self::Template(_) => ErrorKind::InputInvalid,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::IncompleteConfig { .. } => ErrorKind::IncompleteConfig,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::VendorRejected(_) => ErrorKind::VendorRejected,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::Timeout => ErrorKind::Timeout,
            Self::VerifyFrequently => ErrorKind::Throttled,
            Self::VerifyExpired | Self::VerifyIncorrect => ErrorKind::InputInvalid,
            Self::Transient(_) | Self::Io(_) => ErrorKind::Transient,
            Self::DatabaseSqlx(_)
            | Self::Migration(_)
            | Self::Serialization(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::vendor_rejected(format!("malformed response: {}", err))
        } else {
            Self::Transient(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_rejected_display() {
        let err = Error::vendor_rejected("bad mailbox");
        assert_eq!(err.to_string(), "Vendor rejected: bad mailbox");
        assert_eq!(err.kind(), ErrorKind::VendorRejected);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(ErrorKind::InputInvalid.is_terminal());
        assert!(ErrorKind::NotFound.is_terminal());
        assert!(ErrorKind::Forbidden.is_terminal());
        assert!(!ErrorKind::Timeout.is_terminal());
        assert!(!ErrorKind::VendorRejected.is_terminal());
        assert!(!ErrorKind::Transient.is_terminal());
    }

    #[test]
    fn test_kind_round_trips_through_string() {
        let kind: ErrorKind = "incomplete_config".parse().unwrap();
        assert_eq!(kind, ErrorKind::IncompleteConfig);
        assert_eq!(ErrorKind::TokenExpired.to_string(), "token_expired");
    }

    #[test]
    fn test_verify_messages_are_distinct() {
        assert!(Error::VerifyExpired.to_string().contains("expired"));
        assert!(Error::VerifyIncorrect.to_string().contains("incorrect"));
        assert_eq!(Error::Timeout.to_string(), "timeout");
    }
}
