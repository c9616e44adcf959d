//! Persistent ratings of upstream resolvers.
//!
//! The score is the last observed round-trip time in seconds, or the previous
//! score plus a penalty after a failed attempt. Lower is better.

use serde::Deserialize;
use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db;
use crate::error::ProxyError;
use crate::record::UpstreamCandidate;

/// Public resolvers used when no upstream list is configured.
pub const BUILTIN_UPSTREAMS: &[(&str, &str)] = &[
    ("Google", "8.8.8.8"),
    ("Google", "8.8.4.4"),
    ("Level3", "209.244.0.3"),
    ("Level3", "209.244.0.4"),
    ("DNS.WATCH", "84.200.69.80"),
    ("DNS.WATCH", "84.200.70.40"),
    ("Comodo Secure DNS", "8.26.56.26"),
    ("Comodo Secure DNS", "8.20.247.20"),
    ("OpenDNS Home", "208.67.222.222"),
    ("OpenDNS Home", "208.67.220.220"),
    ("DNS Advantage", "156.154.70.1"),
    ("DNS Advantage", "156.154.71.1"),
    ("Norton ConnectSafe", "199.85.126.10"),
    ("Norton ConnectSafe", "199.85.127.10"),
    ("GreenTeamDNS", "81.218.119.11"),
    ("GreenTeamDNS", "209.88.198.133"),
    ("SafeDNS", "195.46.39.39"),
    ("SafeDNS", "195.46.39.40"),
    ("OpenNIC", "216.87.84.211"),
    ("OpenNIC", "208.115.243.35"),
    ("Public-Root", "199.5.157.131"),
    ("Public-Root", "208.71.35.137"),
    ("SmartViper", "208.76.50.50"),
    ("SmartViper", "208.76.51.51"),
    ("Dyn", "216.146.35.35"),
    ("Dyn", "216.146.36.36"),
    ("FreeDNS", "37.235.1.174"),
    ("FreeDNS", "37.235.1.177"),
    ("censurfridns.dk", "89.233.43.71"),
    ("censurfridns.dk", "91.239.100.100"),
    ("Hurricane Electric", "74.82.42.42"),
    ("puntCAT", "109.69.8.51"),
];

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS upstreams (
    name  TEXT NOT NULL,
    ip    TEXT NOT NULL UNIQUE,
    score REAL NOT NULL DEFAULT 0
)";

/// An upstream to seed the store with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpstreamSeed {
    pub name: String,
    /// `ip` or `ip:port`.
    pub address: String,
}

impl UpstreamSeed {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

pub fn builtin_seeds() -> Vec<UpstreamSeed> {
    BUILTIN_UPSTREAMS
        .iter()
        .map(|(name, ip)| UpstreamSeed::new(*name, *ip))
        .collect()
}

/// Table of candidate upstreams ranked by score.
pub struct RatingStore {
    conn: Mutex<SqliteConnection>,
}

impl RatingStore {
    /// Wrap `conn`, seeding the table with `seeds` (or the built-in list
    /// when `seeds` is empty) if it has no rows yet.
    pub async fn new(mut conn: SqliteConnection, seeds: &[UpstreamSeed]) -> Result<Self, ProxyError> {
        sqlx::query(CREATE_TABLE).execute(&mut conn).await?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upstreams")
            .fetch_one(&mut conn)
            .await?;
        if existing == 0 {
            let builtin;
            let seeds = if seeds.is_empty() {
                builtin = builtin_seeds();
                &builtin[..]
            } else {
                seeds
            };
            seed(&mut conn, seeds).await?;
            info!(upstreams = seeds.len(), "Upstream ratings seeded");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn open(database_url: &str, seeds: &[UpstreamSeed]) -> Result<Self, ProxyError> {
        Self::new(db::connect(database_url).await?, seeds).await
    }

    /// Up to `n` candidates, best score first; ties keep insertion order.
    pub async fn best(&self, n: usize) -> Result<Vec<UpstreamCandidate>, ProxyError> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(
            "SELECT name, ip, score FROM upstreams ORDER BY score ASC, rowid ASC LIMIT ?",
        )
        .bind(n as i64)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UpstreamCandidate {
                    name: row.try_get("name")?,
                    ip: row.try_get("ip")?,
                    score: row.try_get("score")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(ProxyError::from)
    }

    /// Overwrite the score of the upstream at `ip`.
    pub async fn update(&self, ip: &str, score: f64) -> Result<(), ProxyError> {
        let mut conn = self.conn.lock().await;
        let updated = sqlx::query("UPDATE upstreams SET score = ? WHERE ip = ?")
            .bind(score)
            .bind(ip)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if updated == 0 {
            warn!(ip, "Score update for unknown upstream");
        }
        Ok(())
    }

    /// Number of configured candidates.
    pub async fn count(&self) -> Result<usize, ProxyError> {
        let mut conn = self.conn.lock().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upstreams")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count as usize)
    }
}

async fn seed(conn: &mut SqliteConnection, seeds: &[UpstreamSeed]) -> Result<(), sqlx::Error> {
    use sqlx::Connection;

    let mut tx = conn.begin().await?;
    for upstream in seeds {
        sqlx::query("INSERT OR IGNORE INTO upstreams (name, ip, score) VALUES (?, ?, 0.0)")
            .bind(&upstream.name)
            .bind(&upstream.address)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await
}
