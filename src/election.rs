//! Leader election over the coordination lock.
//!
//! Two strategies, selected at construction: [`Nomination`] re-acquires
//! the group key with the normal TTL on every tick (acquire doubles as
//! renewal because the lock is holder-idempotent), and [`Tyrant`] seizes
//! the key with an effectively infinite lease and keeps renewing from a
//! dedicated background task. Tyrant mode is for bootstrapping a stuck
//! group and must be opted into per peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::coordination::{group_key, LockService};
use crate::error::Result;

/// Lease length used by the tyrant; effectively infinite.
pub const TYRANT_TTL: Duration = Duration::from_secs(3600 * 24 * 365 * 10);

/// How often the tyrant's background task re-seizes the key.
pub const TYRANT_RENEW_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Role change observed by one election tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameLeader,
    StayedLeader,
    LostLeadership,
    StayedFollower,
}

impl Transition {
    pub fn is_leader(self) -> bool {
        matches!(self, Transition::BecameLeader | Transition::StayedLeader)
    }
}

#[async_trait]
pub trait ElectStrategy: Send + Sync {
    /// Attempt to take or keep leadership for one tick.
    async fn elect(&self) -> Result<bool>;
}

/// Normal nomination: conditional acquire with the configured lease TTL.
pub struct Nomination {
    lock: Arc<dyn LockService>,
    key: String,
    self_uri: String,
    ttl: Duration,
}

#[async_trait]
impl ElectStrategy for Nomination {
    async fn elect(&self) -> Result<bool> {
        self.lock.acquire(&self.key, &self.self_uri, self.ttl).await
    }
}

/// Bootstrap dictator: unconditional seize with an infinite lease.
pub struct Tyrant {
    lock: Arc<dyn LockService>,
    key: String,
    self_uri: String,
}

#[async_trait]
impl ElectStrategy for Tyrant {
    async fn elect(&self) -> Result<bool> {
        self.lock.seize(&self.key, &self.self_uri, TYRANT_TTL).await?;
        Ok(true)
    }
}

pub struct Election {
    strategy: Box<dyn ElectStrategy>,
    lock: Arc<dyn LockService>,
    key: String,
    self_uri: String,
    tyrant: bool,
    role: RwLock<Role>,
    leader_uri: Arc<RwLock<Option<String>>>,
}

impl Election {
    pub fn new(
        lock: Arc<dyn LockService>,
        group: &str,
        self_uri: &str,
        lease_ttl: Duration,
        tyrant: bool,
    ) -> Self {
        let key = group_key(group);
        let strategy: Box<dyn ElectStrategy> = if tyrant {
            Box::new(Tyrant {
                lock: lock.clone(),
                key: key.clone(),
                self_uri: self_uri.to_string(),
            })
        } else {
            Box::new(Nomination {
                lock: lock.clone(),
                key: key.clone(),
                self_uri: self_uri.to_string(),
                ttl: lease_ttl,
            })
        };
        Self {
            strategy,
            lock,
            key,
            self_uri: self_uri.to_string(),
            tyrant,
            role: RwLock::new(Role::Follower),
            leader_uri: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared handle to the cached leader URI, read by the worker loop
    /// and the failure envelope.
    pub fn leader_handle(&self) -> Arc<RwLock<Option<String>>> {
        self.leader_uri.clone()
    }

    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    /// One nomination round. A coordination error counts as "not leader
    /// for this tick"; there are no retries within a tick.
    pub async fn tick(&self) -> Transition {
        let was = *self.role.read().await;

        let is_leader = match self.strategy.elect().await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Election attempt failed");
                false
            }
        };

        if is_leader {
            *self.role.write().await = Role::Leader;
            *self.leader_uri.write().await = Some(self.self_uri.clone());
        } else {
            *self.role.write().await = Role::Follower;
            // Cache whoever holds the lock now; keep the stale value on a
            // read error so followers can still reach the last known leader.
            if let Ok(holder) = self.lock.read(&self.key).await {
                *self.leader_uri.write().await = holder;
            }
        }

        match (was, is_leader) {
            (Role::Follower, true) => {
                tracing::info!(key = %self.key, uri = %self.self_uri, "Became leader");
                Transition::BecameLeader
            }
            (Role::Leader, true) => Transition::StayedLeader,
            (Role::Leader, false) => {
                tracing::warn!(key = %self.key, uri = %self.self_uri, "Lost leadership");
                Transition::LostLeadership
            }
            (Role::Follower, false) => Transition::StayedFollower,
        }
    }

    /// Spawn the tyrant's renewal task. Returns `None` for normal peers.
    pub fn spawn_tyrant_renewer(
        &self,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.tyrant {
            return None;
        }
        let lock = self.lock.clone();
        let key = self.key.clone();
        let uri = self.self_uri.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TYRANT_RENEW_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = lock.seize(&key, &uri, TYRANT_TTL).await {
                            tracing::warn!(key = %key, error = %e, "Tyrant renewal failed");
                        }
                    }
                }
            }
        }))
    }
}
