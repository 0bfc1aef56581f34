//! Retry helper for contended SQLite writes.
//!
//! Delivery workers update per-recipient rows concurrently; on a shared
//! database these writes can hit `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6).

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: usize = 10;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 1000;

pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        return false;
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database table is locked")
}

fn backoff(attempt: usize) -> Duration {
    let exp_ms = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped_ms = exp_ms.min(BUSY_MAX_DELAY_MS);
    let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
    Duration::from_millis((capped_ms + jitter_ms).min(BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports
/// the database as busy or locked.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy_error(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = backoff(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    "SQLite busy, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        for attempt in 0..20 {
            assert!(backoff(attempt) <= Duration::from_millis(BUSY_MAX_DELAY_MS));
        }
    }

    #[test]
    fn test_non_database_errors_are_not_busy() {
        assert!(!is_sqlite_busy_error(&Error::Timeout));
        assert!(!is_sqlite_busy_error(&Error::DatabaseSqlx(
            sqlx::Error::RowNotFound
        )));
    }

    #[tokio::test]
    async fn test_non_busy_error_is_returned_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_sqlite_busy("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::input_invalid("nope")) }
        })
        .await;
        assert!(matches!(result, Err(Error::InputInvalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
