//! SQLite connection setup shared by the stores.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::ConnectOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tracing::debug;

use crate::error::ProxyError;

/// Open one connection to `database_url` (`sqlite:path` or `sqlite::memory:`),
/// creating the file if needed.
pub async fn connect(database_url: &str) -> Result<SqliteConnection, ProxyError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let conn = options.connect().await?;
    debug!(database = database_url, "Database connection opened");
    Ok(conn)
}

/// Database URL for a file path.
pub fn file_url(path: &str) -> String {
    format!("sqlite:{}", path)
}

pub(crate) fn to_unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn from_unix_secs(secs: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0))
}
