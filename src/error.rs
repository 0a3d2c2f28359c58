use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Source sync failed: {0}")]
    SourceSync(String),

    #[error("Hook script failed: {0}")]
    Hook(String),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Bucket processing exceeded {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// True for the transient "server has gone away" database condition
    /// that the failure envelope recovers from by reconnecting.
    pub fn is_gone_away(&self) -> bool {
        matches!(self, PoolError::Store(e) if e.is_gone_away())
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(e: reqwest::Error) -> Self {
        PoolError::Rpc(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
