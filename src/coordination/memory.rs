//! In-process lock service for tests and single-host groups.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::LockService;
use crate::error::Result;

struct Lease {
    holder: String,
    /// None means the lease never expires (tyrant).
    expires_at: Option<Instant>,
}

impl Lease {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |t| t > Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a lease outright, simulating an expired or flushed key.
    pub fn evict(&self, key: &str) {
        self.leases.lock().unwrap().remove(key);
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(key) {
            Some(lease) if lease.is_live() && lease.holder != holder => Ok(false),
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: expiry(ttl),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(key) {
            Some(lease) if lease.is_live() && lease.holder == holder => {
                lease.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn seize(&self, key: &str, holder: &str, ttl: Duration) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        leases.insert(
            key.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let leases = self.leases.lock().unwrap();
        Ok(leases
            .get(key)
            .filter(|l| l.is_live())
            .map(|l| l.holder.clone()))
    }
}
