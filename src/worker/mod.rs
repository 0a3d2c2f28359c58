//! Follower-side execution engine.
//!
//! The worker loop pulls assignments from the current leader, honours the
//! back-off hint when the queue is drained, and hands each bucket to the
//! executor. Buckets run strictly sequentially within one peer; the
//! group's parallelism comes from its peers.

pub mod environment;
pub mod executor;
pub mod source;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub use environment::{with_environment, EnvironmentGuard};
pub use executor::BucketExecutor;
pub use source::{GitSync, SourceSync};
pub use task::{TaskOutcome, TaskRunner, ABORT_RETRY_MARKER};

use crate::envelope::{FailureEnvelope, FailureScope};
use crate::rpc::PeerClient;

pub struct Worker {
    executor: Arc<BucketExecutor>,
    peers: PeerClient,
    envelope: Arc<FailureEnvelope>,
    leader_uri: Arc<RwLock<Option<String>>>,
    self_uri: String,
    hostname: String,
    /// Fallback sleep when the leader cannot be reached at all.
    back_off: Duration,
}

impl Worker {
    pub fn new(
        executor: Arc<BucketExecutor>,
        peers: PeerClient,
        envelope: Arc<FailureEnvelope>,
        leader_uri: Arc<RwLock<Option<String>>>,
        self_uri: &str,
        hostname: &str,
        back_off: Duration,
    ) -> Self {
        Self {
            executor,
            peers,
            envelope,
            leader_uri,
            self_uri: self_uri.to_string(),
            hostname: hostname.to_string(),
            back_off,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let leader = self.leader_uri.read().await.clone();
            let Some(leader) = leader else {
                tracing::debug!("No leader known, waiting");
                self.sleep(self.back_off, &cancel).await;
                continue;
            };

            match self
                .peers
                .next_bucket(&leader, &self.self_uri, &self.hostname)
                .await
            {
                Ok(response) => match response.bucket_id {
                    Some(bucket_id) => {
                        self.envelope
                            .run(
                                FailureScope::Bucket(bucket_id),
                                "Bucket processing failed",
                                || self.executor.process(bucket_id),
                            )
                            .await;
                    }
                    None => {
                        let hint = Duration::from_secs(response.back_off_seconds);
                        tracing::debug!(seconds = response.back_off_seconds, "Queue drained, backing off");
                        self.sleep(hint, &cancel).await;
                    }
                },
                Err(e) => {
                    tracing::debug!(leader = %leader, error = %e, "Assignment call failed");
                    self.sleep(self.back_off, &cancel).await;
                }
            }
        }
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
