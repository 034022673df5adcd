//! Retry helpers for database operations.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::domain::capped_exponential;
use crate::{Error, Result};

const SQLITE_BUSY_MAX_RETRIES: u32 = 8;
const SQLITE_BUSY_BASE_DELAY: Duration = Duration::from_millis(10);
const SQLITE_BUSY_MAX_DELAY: Duration = Duration::from_millis(1000);

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), or their messages when the driver
/// did not surface a code.
pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports
/// the database busy. Other errors return immediately.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy_error(&err) || attempt >= SQLITE_BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let backoff = capped_exponential(SQLITE_BUSY_BASE_DELAY, SQLITE_BUSY_MAX_DELAY, attempt);
                let jitter_ms = random::<u64>() % (backoff.as_millis() as u64 / 4 + 1);
                let delay = (backoff + Duration::from_millis(jitter_ms)).min(SQLITE_BUSY_MAX_DELAY);

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    SQLITE_BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
