//! Coordination primitive: an atomic leader lock with lease semantics.
//!
//! `acquire` succeeds only if the key is unbound, expired, or already held
//! by the same holder, so a live leader renews by re-acquiring. All
//! operations are atomic with respect to other callers.

pub mod memory;
pub mod mysql;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryLockService;
pub use mysql::MysqlLockService;

/// Lock key for a group's leadership lease.
pub fn group_key(group: &str) -> String {
    format!("{group}:leader")
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Bind `key` to `holder` for `ttl`. Returns true when the caller
    /// holds the lock afterwards.
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lease iff `holder` still owns the key.
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Bind `key` to `holder` unconditionally, evicting any prior holder.
    /// Only the tyrant election strategy uses this.
    async fn seize(&self, key: &str, holder: &str, ttl: Duration) -> Result<()>;

    /// Current live holder, if any.
    async fn read(&self, key: &str) -> Result<Option<String>>;
}
