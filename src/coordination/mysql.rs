//! Lease-table lock service over the shared MySQL pool.
//!
//! The compare-and-set lives in a single `INSERT … ON DUPLICATE KEY
//! UPDATE` statement: column assignments are evaluated left to right, so
//! the `expires_at` update observes the possibly-updated `holder` and
//! only fires when this caller took or kept the lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlPool;
use sqlx::Row;

use super::LockService;
use crate::error::{PoolError, Result};

pub struct MysqlLockService {
    pool: MySqlPool,
}

impl MysqlLockService {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn lease_end(ttl: Duration) -> chrono::DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    Utc::now() + ttl
}

fn coordination_error(e: sqlx::Error) -> PoolError {
    PoolError::Coordination(e.to_string())
}

#[async_trait]
impl LockService for MysqlLockService {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        sqlx::query(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE
                 holder = IF(holder = VALUES(holder) OR expires_at < NOW(6),
                             VALUES(holder), holder),
                 expires_at = IF(holder = VALUES(holder),
                                 VALUES(expires_at), expires_at)",
        )
        .bind(key)
        .bind(holder)
        .bind(lease_end(ttl))
        .execute(&self.pool)
        .await
        .map_err(coordination_error)?;

        Ok(self.read(key).await?.as_deref() == Some(holder))
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE leases SET expires_at = ?
             WHERE name = ? AND holder = ? AND expires_at > NOW(6)",
        )
        .bind(lease_end(ttl))
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(coordination_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn seize(&self, key: &str, holder: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE
                 holder = VALUES(holder),
                 expires_at = VALUES(expires_at)",
        )
        .bind(key)
        .bind(holder)
        .bind(lease_end(ttl))
        .execute(&self.pool)
        .await
        .map_err(coordination_error)?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT holder FROM leases WHERE name = ? AND expires_at > NOW(6)")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(coordination_error)?;
        row.map(|r| r.try_get("holder").map_err(coordination_error))
            .transpose()
    }
}
