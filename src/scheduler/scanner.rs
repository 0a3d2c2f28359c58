//! Leader-tick project scan.
//!
//! On every tick the leader walks all projects: confirms that in-flight
//! buckets of the latest build still have a live worker, recovers the ones
//! that do not, and creates a new build (with one queued bucket per
//! configured bucket name) for projects that want one. One mutex covers
//! both the queue mutation and the in-build walk, so a concurrent
//! assignment call can never observe a half-enqueued build.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::envelope::{FailureEnvelope, FailureScope};
use crate::error::{PoolError, Result};
use crate::rpc::PeerClient;
use crate::scheduler::BucketQueue;
use crate::store::{Bucket, BucketState, Build, Project, Store};

/// Outcome of confirming one non-terminal bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead(String),
}

pub struct ProjectScanner {
    store: Arc<dyn Store>,
    queue: Arc<Mutex<BucketQueue>>,
    peers: PeerClient,
    envelope: Arc<FailureEnvelope>,
    self_uri: String,
}

impl ProjectScanner {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<Mutex<BucketQueue>>,
        peers: PeerClient,
        envelope: Arc<FailureEnvelope>,
        self_uri: &str,
    ) -> Self {
        Self {
            store,
            queue,
            peers,
            envelope,
            self_uri: self_uri.to_string(),
        }
    }

    /// Scan every project. Failures are recorded per project and never
    /// abort the pass over the remaining ones.
    pub async fn scan_all(&self) {
        let projects = match self.store.projects().await {
            Ok(projects) => projects,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list projects, skipping scan");
                return;
            }
        };

        for project in projects {
            let name = project.name.clone();
            self.envelope
                .run(FailureScope::Project(name), "Project scan failed", || {
                    self.scan_project(project.clone())
                })
                .await;
        }
    }

    async fn scan_project(&self, mut project: Project) -> Result<()> {
        let mut queue = self.queue.lock().await;

        if self.project_in_build(&project, &queue).await? {
            return Ok(());
        }
        if !project.wants_build() {
            return Ok(());
        }

        let commit = project
            .current_commit
            .clone()
            .ok_or_else(|| PoolError::Internal(format!("{} has no commit to build", project.name)))?;

        let number = self.store.next_build_number(&project.name).await?;
        let build = Build::new(&project.name, number, &commit, &self.self_uri);
        self.store.insert_build(&build).await?;

        let mut ids = Vec::new();
        for bucket_name in project.plan.bucket_names() {
            let bucket = Bucket::new(build.id, &bucket_name);
            self.store.insert_bucket(&bucket).await?;
            ids.push(bucket.id);
        }
        tracing::info!(
            project = %project.name,
            build = number,
            commit = %commit,
            buckets = ids.len(),
            "Created build"
        );
        queue.set_buckets(&project.name, ids);

        project.update_state();
        self.store.upsert_project(&project).await?;
        Ok(())
    }

    /// True when the project still has work in flight: queued buckets the
    /// leader knows about, or claimed buckets whose worker confirms them.
    /// Dead buckets found along the way are recovered to
    /// `ProcessingFailed`; confirmation errors never abort the walk.
    async fn project_in_build(&self, project: &Project, queue: &BucketQueue) -> Result<bool> {
        if !queue.is_empty(&project.name) {
            return Ok(true);
        }

        let Some(build) = self.store.last_build(&project.name, None).await? else {
            return Ok(false);
        };
        if build.finished_at.is_some() {
            return Ok(false);
        }

        let mut alive = false;
        for bucket in self.store.buckets_of_build(build.id).await? {
            if bucket.state.is_terminal() {
                continue;
            }
            match self.confirm_bucket(&bucket).await {
                Liveness::Alive => alive = true,
                Liveness::Dead(reason) => {
                    tracing::warn!(
                        bucket_id = %bucket.id,
                        bucket = %bucket.name,
                        reason = %reason,
                        "Recovering dead bucket"
                    );
                    self.envelope
                        .mark_bucket_dead(bucket.id, "Bucket confirmation failed", &reason)
                        .await;
                }
            }
        }
        Ok(alive)
    }

    /// The queue is known to be empty for this project when we get here,
    /// so a still-queued bucket belongs to a vanished leader.
    async fn confirm_bucket(&self, bucket: &Bucket) -> Liveness {
        match bucket.state {
            BucketState::Queued => {
                Liveness::Dead("queued bucket unknown to the current leader".to_string())
            }
            BucketState::Claimed => match bucket.worker_uri.as_deref() {
                Some(worker) => match self.peers.processing(worker, bucket.id).await {
                    Ok(true) => Liveness::Alive,
                    Ok(false) => {
                        Liveness::Dead(format!("worker {worker} denies processing this bucket"))
                    }
                    Err(e) => Liveness::Dead(format!("worker {worker} unreachable: {e}")),
                },
                None => Liveness::Dead("claimed bucket has no worker recorded".to_string()),
            },
            _ => Liveness::Alive,
        }
    }

    /// Rebuild the queue from the store; used by a fresh leader whose
    /// in-memory queue is empty. Queued buckets of unfinished builds are
    /// re-enqueued, claimed ones are left for confirmation on the next
    /// scan.
    pub async fn restore_queue(&self) -> Result<()> {
        let projects = self.store.projects().await?;
        let mut queue = self.queue.lock().await;
        for project in projects {
            let Some(build) = self.store.last_build(&project.name, None).await? else {
                continue;
            };
            if build.finished_at.is_some() {
                continue;
            }
            let ids: Vec<Uuid> = self
                .store
                .buckets_of_build(build.id)
                .await?
                .into_iter()
                .filter(|b| b.state == BucketState::Queued)
                .map(|b| b.id)
                .collect();
            if !ids.is_empty() {
                tracing::info!(project = %project.name, buckets = ids.len(), "Restored queue");
                queue.set_buckets(&project.name, ids);
            }
        }
        Ok(())
    }
}
