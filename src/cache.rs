//! Persistent DNS record cache with TTL-based expiration.

use std::time::SystemTime;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::db::{self, from_unix_secs, to_unix_secs};
use crate::dns::{RecordClass, RecordType};
use crate::error::ProxyError;
use crate::filter::ExclusionList;
use crate::record::{Record, RecordSet};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS records (
    domain     TEXT    NOT NULL,
    ip         TEXT    NOT NULL,
    rtype      TEXT    NOT NULL,
    rclass     TEXT    NOT NULL,
    ttl        INTEGER NOT NULL,
    expires_at REAL    NOT NULL,
    upstream   TEXT    NOT NULL,
    PRIMARY KEY (domain, ip)
)";

const CREATE_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS records_expires_at ON records (expires_at)";

/// TTL-aware record cache keyed by domain.
///
/// Expired rows are deleted at the start of every `find` and `add`, under the
/// same lock as the lookup or insert that follows, so there is no reaper task.
pub struct CacheStore {
    conn: Mutex<SqliteConnection>,
    exclusions: ExclusionList,
}

impl CacheStore {
    pub async fn new(
        mut conn: SqliteConnection,
        exclusions: ExclusionList,
    ) -> Result<Self, ProxyError> {
        sqlx::query(CREATE_TABLE).execute(&mut conn).await?;
        sqlx::query(CREATE_EXPIRY_INDEX).execute(&mut conn).await?;

        Ok(Self {
            conn: Mutex::new(conn),
            exclusions,
        })
    }

    pub async fn open(database_url: &str, exclusions: ExclusionList) -> Result<Self, ProxyError> {
        Self::new(db::connect(database_url).await?, exclusions).await
    }

    /// All unexpired records for `domain`; empty on a miss.
    pub async fn find(&self, domain: &str) -> Result<RecordSet, ProxyError> {
        let mut conn = self.conn.lock().await;
        let now = SystemTime::now();
        evict_expired(&mut conn, now).await?;

        let rows = sqlx::query(
            "SELECT domain, ip, rtype, rclass, ttl, expires_at, upstream
             FROM records WHERE domain = ? AND expires_at > ? ORDER BY rowid",
        )
        .bind(domain)
        .bind(to_unix_secs(now))
        .fetch_all(&mut *conn)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(record) = row_to_record(row)? {
                records.push(record);
            }
        }
        Ok(RecordSet::new(records))
    }

    /// Store a record, replacing any row for the same `(domain, ip)`.
    ///
    /// Returns `None` without touching the store when `ip` matches an
    /// exclusion pattern.
    pub async fn add(
        &self,
        domain: &str,
        ip: &str,
        record_type: RecordType,
        record_class: RecordClass,
        ttl: u32,
        source_upstream: &str,
    ) -> Result<Option<Record>, ProxyError> {
        if self.exclusions.is_excluded(ip) {
            debug!(domain, ip, "Address excluded from cache");
            return Ok(None);
        }

        let mut conn = self.conn.lock().await;
        evict_expired(&mut conn, SystemTime::now()).await?;

        let record = Record::new(domain, ip, record_type, record_class, ttl, source_upstream);
        sqlx::query(
            "INSERT OR REPLACE INTO records (domain, ip, rtype, rclass, ttl, expires_at, upstream)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.domain)
        .bind(&record.ip)
        .bind(record.record_type.to_string())
        .bind(record.record_class.to_string())
        .bind(i64::from(record.ttl))
        .bind(to_unix_secs(record.expires_at))
        .bind(&record.source_upstream)
        .execute(&mut *conn)
        .await?;

        Ok(Some(record))
    }

    /// Number of unexpired rows.
    pub async fn len(&self) -> Result<u64, ProxyError> {
        let mut conn = self.conn.lock().await;
        evict_expired(&mut conn, SystemTime::now()).await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count as u64)
    }
}

async fn evict_expired(conn: &mut SqliteConnection, now: SystemTime) -> Result<u64, sqlx::Error> {
    let evicted = sqlx::query("DELETE FROM records WHERE expires_at <= ?")
        .bind(to_unix_secs(now))
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if evicted > 0 {
        trace!(evicted, "Expired records removed");
    }
    Ok(evicted)
}

fn row_to_record(row: &SqliteRow) -> Result<Option<Record>, sqlx::Error> {
    let rtype: String = row.try_get("rtype")?;
    let rclass: String = row.try_get("rclass")?;
    let (Ok(record_type), Ok(record_class)) =
        (rtype.parse::<RecordType>(), rclass.parse::<RecordClass>())
    else {
        warn!(rtype = %rtype, rclass = %rclass, "Skipping cached row with unknown type");
        return Ok(None);
    };

    let ttl: i64 = row.try_get("ttl")?;
    let expires_at: f64 = row.try_get("expires_at")?;

    Ok(Some(Record {
        domain: row.try_get("domain")?,
        ip: row.try_get("ip")?,
        record_type,
        record_class,
        ttl: ttl.clamp(0, i64::from(u32::MAX)) as u32,
        expires_at: from_unix_secs(expires_at),
        source_upstream: row.try_get("upstream")?,
    }))
}
