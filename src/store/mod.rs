//! Repository abstraction over the persistent build schema.
//!
//! Records are flat and keyed by id; in-memory values hold ids, never
//! references to each other. All traversal (build → buckets, bucket →
//! build, project → last build) goes through the [`Store`] trait, so the
//! scheduler core stays independent of the backing database.

pub mod memory;
pub mod mysql;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use mysql::MysqlStore;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The transient MySQL "server has gone away" condition. Recovered by
    /// the failure envelope via reconnect; never surfaced to users.
    #[error("Database server has gone away")]
    ConnectionGone,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_gone_away(&self) -> bool {
        matches!(self, StoreError::ConnectionGone)
    }
}

/// Bucket state machine. The numeric codes are the wire/database values.
///
/// Legal sequences are prefixes of
/// `Queued → Claimed → {Done | Failed | ProcessingFailed}`; the three
/// terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketState {
    /// Created by the scanner, waiting in the leader's queue.
    Queued,
    /// Handed to a worker by the assignment RPC.
    Claimed,
    /// Every task list completed successfully.
    Done,
    /// At least one task reported a non-zero exit.
    Failed,
    /// The bucket was not evaluated to completion: worker unreachable,
    /// database connection unrecoverable, or an uncaught error.
    ProcessingFailed,
}

impl BucketState {
    pub fn code(self) -> i32 {
        match self {
            BucketState::Done => 10,
            BucketState::Queued => 20,
            BucketState::Claimed => 30,
            BucketState::ProcessingFailed => 35,
            BucketState::Failed => 40,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(BucketState::Done),
            20 => Some(BucketState::Queued),
            30 => Some(BucketState::Claimed),
            35 => Some(BucketState::ProcessingFailed),
            40 => Some(BucketState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BucketState::Done | BucketState::Failed | BucketState::ProcessingFailed
        )
    }
}

impl std::fmt::Display for BucketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketState::Queued => write!(f, "queued"),
            BucketState::Claimed => write!(f, "claimed"),
            BucketState::Done => write!(f, "done"),
            BucketState::Failed => write!(f, "failed"),
            BucketState::ProcessingFailed => write!(f, "processing failed"),
        }
    }
}

/// One named shell command inside a task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub command: String,
}

impl Task {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Task list and hook configuration for one bucket name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPlan {
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Buckets sharing a group also share the before-group hook.
    #[serde(default)]
    pub group: Option<String>,
    /// Language runtime this bucket's tasks run under.
    #[serde(default)]
    pub runtime_version: Option<String>,
}

/// Per-project build configuration, stored as a JSON document on the
/// project row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Tasks that need to succeed only once per build across all buckets.
    #[serde(default)]
    pub before_all_tasks: Vec<Task>,
    /// Tasks run at the start of every bucket.
    #[serde(default)]
    pub before_bucket_tasks: Vec<Task>,
    /// Tasks run at the end of every bucket, even after failures.
    #[serde(default)]
    pub after_bucket_tasks: Vec<Task>,
    /// Bucket name → task list; one bucket is created per entry.
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketPlan>,
    /// Shell hook run once per build per worker, before anything else.
    #[serde(default)]
    pub before_all_script: Option<String>,
    /// Shell hook run once per bucket group per build per worker.
    #[serde(default)]
    pub before_group_script: Option<String>,
    /// Dependency manifest file; its presence triggers the install command.
    #[serde(default)]
    pub dependency_manifest: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    /// Recipient of failure/fixed mail for this project.
    #[serde(default)]
    pub notify_email: Option<String>,
    /// Chat handle appended to room notifications as " /cc @user".
    #[serde(default)]
    pub chat_cc: Option<String>,
}

impl BuildPlan {
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    pub fn bucket_tasks(&self, bucket: &str) -> Vec<Task> {
        self.buckets
            .get(bucket)
            .map(|b| b.tasks.clone())
            .unwrap_or_default()
    }

    pub fn bucket_group(&self, bucket: &str) -> Option<String> {
        self.buckets.get(bucket).and_then(|b| b.group.clone())
    }

    pub fn runtime_version(&self, bucket: &str) -> Option<String> {
        self.buckets
            .get(bucket)
            .and_then(|b| b.runtime_version.clone())
    }
}

/// A watched source-controlled project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique name; also the queue key on the leader.
    pub name: String,
    /// Source repository URL.
    pub url: String,
    /// Commit the watcher last observed upstream.
    pub current_commit: Option<String>,
    /// Commit the last created build consumed.
    pub built_commit: Option<String>,
    /// Set externally to force a build regardless of commit movement.
    pub build_requested: bool,
    /// Last scan-level error, surfaced in the UI.
    pub last_system_error: Option<String>,
    pub plan: BuildPlan,
}

impl Project {
    pub fn new(name: impl Into<String>, url: impl Into<String>, plan: BuildPlan) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            current_commit: None,
            built_commit: None,
            build_requested: false,
            last_system_error: None,
            plan,
        }
    }

    /// Whether a new build should be created: forced, or the observed
    /// commit moved past the last consumed one.
    pub fn wants_build(&self) -> bool {
        if self.build_requested {
            return true;
        }
        match &self.current_commit {
            Some(commit) => self.built_commit.as_ref() != Some(commit),
            None => false,
        }
    }

    /// Consume the current commit after a build was created for it.
    pub fn update_state(&mut self) {
        self.built_commit = self.current_commit.clone();
        self.build_requested = false;
    }
}

/// One build of a project, split into buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub project: String,
    /// Monotonically increasing per project.
    pub number: u32,
    pub commit: String,
    /// URI of the leader that created this build.
    pub leader_uri: String,
    /// Set by the assignment path when the first bucket is claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// Set only once every bucket has a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn new(project: &str, number: u32, commit: &str, leader_uri: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.to_string(),
            number,
            commit: commit.to_string(),
            leader_uri: leader_uri.to_string(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// One unit of work: a named slice of a build's task lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: Uuid,
    pub build_id: Uuid,
    pub name: String,
    pub state: BucketState,
    pub worker_uri: Option<String>,
    pub worker_hostname: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Concatenated task output, written at finalisation.
    pub log: Option<String>,
    /// Snapshot of the failed sections, written on failure.
    pub error_log: Option<String>,
}

impl Bucket {
    pub fn new(build_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            name: name.to_string(),
            state: BucketState::Queued,
            worker_uri: None,
            worker_hostname: None,
            started_at: None,
            finished_at: None,
            log: None,
            error_log: None,
        }
    }

    /// Append a report block to the bucket log, preserving prior content.
    pub fn append_to_log(&mut self, text: &str) {
        match &mut self.log {
            Some(log) => log.push_str(text),
            None => self.log = Some(text.to_string()),
        }
    }
}

/// Append-only chunk of task output captured while a bucket runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFragment {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Repository interface the scheduler and executor run against.
#[async_trait]
pub trait Store: Send + Sync {
    /// Re-establish the backing connection after a gone-away error.
    async fn reconnect(&self);

    async fn projects(&self) -> Result<Vec<Project>, StoreError>;
    async fn project(&self, name: &str) -> Result<Project, StoreError>;
    async fn upsert_project(&self, project: &Project) -> Result<(), StoreError>;

    async fn insert_build(&self, build: &Build) -> Result<(), StoreError>;
    async fn update_build(&self, build: &Build) -> Result<(), StoreError>;
    async fn build(&self, id: Uuid) -> Result<Build, StoreError>;
    /// Most recent build of a project, optionally restricted to builds
    /// numbered strictly below `before`.
    async fn last_build(&self, project: &str, before: Option<u32>)
        -> Result<Option<Build>, StoreError>;
    /// Next free build number for a project (max + 1, starting at 1).
    async fn next_build_number(&self, project: &str) -> Result<u32, StoreError>;

    async fn insert_bucket(&self, bucket: &Bucket) -> Result<(), StoreError>;
    async fn update_bucket(&self, bucket: &Bucket) -> Result<(), StoreError>;
    async fn bucket(&self, id: Uuid) -> Result<Bucket, StoreError>;
    async fn buckets_of_build(&self, build_id: Uuid) -> Result<Vec<Bucket>, StoreError>;
    async fn bucket_of_build(
        &self,
        build_id: Uuid,
        name: &str,
    ) -> Result<Option<Bucket>, StoreError>;

    async fn append_fragment(&self, bucket_id: Uuid, text: &str) -> Result<(), StoreError>;
    /// Fragments of a bucket in creation order.
    async fn fragments(&self, bucket_id: Uuid) -> Result<Vec<LogFragment>, StoreError>;
    async fn delete_fragments(&self, bucket_id: Uuid) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for state in [
            BucketState::Queued,
            BucketState::Claimed,
            BucketState::Done,
            BucketState::Failed,
            BucketState::ProcessingFailed,
        ] {
            assert_eq!(BucketState::from_code(state.code()), Some(state));
        }
        assert_eq!(BucketState::from_code(99), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!BucketState::Queued.is_terminal());
        assert!(!BucketState::Claimed.is_terminal());
        assert!(BucketState::Done.is_terminal());
        assert!(BucketState::Failed.is_terminal());
        assert!(BucketState::ProcessingFailed.is_terminal());
    }

    #[test]
    fn wants_build_on_commit_movement() {
        let mut project = Project::new("p", "git://example/p.git", BuildPlan::default());
        assert!(!project.wants_build());

        project.current_commit = Some("c1".to_string());
        assert!(project.wants_build());

        project.update_state();
        assert!(!project.wants_build());

        project.build_requested = true;
        assert!(project.wants_build());
    }

    #[test]
    fn plan_accessors() {
        let mut plan = BuildPlan::default();
        plan.buckets.insert(
            "units".to_string(),
            BucketPlan {
                tasks: vec![Task::new("units", "make test")],
                group: Some("tests".to_string()),
                runtime_version: Some("3.2".to_string()),
            },
        );

        assert_eq!(plan.bucket_names(), vec!["units".to_string()]);
        assert_eq!(plan.bucket_group("units"), Some("tests".to_string()));
        assert_eq!(plan.runtime_version("units"), Some("3.2".to_string()));
        assert!(plan.bucket_tasks("missing").is_empty());
    }
}
