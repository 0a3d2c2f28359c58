//! Per-bucket build execution.
//!
//! The executor owns one bucket at a time. It syncs the working copy to
//! the build's commit, runs the prepare hooks (once per build, per
//! runtime version, per bucket group), walks the four task lists, then
//! finalises the bucket and fires notifications. The whole run is bounded
//! by a wall-clock timeout; expiry kills the in-flight child and leaves
//! the bucket to the failure envelope.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::envelope::with_reconnect;
use crate::error::{PoolError, Result};
use crate::notify::Notifier;
use crate::store::{Bucket, BucketState, Build, Project, Store, Task};
use crate::worker::environment::EnvironmentGuard;
use crate::worker::source::SourceSync;
use crate::worker::task::{TaskOutcome, TaskRunner};

/// Per-build memoisation, cleared whenever this worker sees a new build.
#[derive(Debug, Default)]
struct BuildMemo {
    build_id: Option<Uuid>,
    prepared_groups: HashSet<String>,
    bundled_runtime_versions: HashSet<String>,
    succeeded_before_all: HashSet<String>,
}

impl BuildMemo {
    fn reset_for(&mut self, build_id: Uuid) {
        self.build_id = Some(build_id);
        self.prepared_groups.clear();
        self.bundled_runtime_versions.clear();
        self.succeeded_before_all.clear();
    }
}

pub struct BucketExecutor {
    store: Arc<dyn Store>,
    source: Arc<dyn SourceSync>,
    runner: TaskRunner,
    notifier: Arc<Notifier>,
    currently_processed: Arc<RwLock<Option<Uuid>>>,
    memo: Mutex<BuildMemo>,
    bucket_timeout: Duration,
    reconnect_delay: Duration,
    work_root: PathBuf,
}

impl BucketExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn SourceSync>,
        runner: TaskRunner,
        notifier: Arc<Notifier>,
        currently_processed: Arc<RwLock<Option<Uuid>>>,
        bucket_timeout: Duration,
        reconnect_delay: Duration,
        work_root: PathBuf,
    ) -> Self {
        Self {
            store,
            source,
            runner,
            notifier,
            currently_processed,
            memo: Mutex::new(BuildMemo::default()),
            bucket_timeout,
            reconnect_delay,
            work_root,
        }
    }

    /// Process one assigned bucket under the wall-clock limit. The
    /// liveness probe answers `true` for this bucket while we own it.
    pub async fn process(&self, bucket_id: Uuid) -> Result<()> {
        *self.currently_processed.write().await = Some(bucket_id);
        let result = tokio::time::timeout(self.bucket_timeout, self.process_inner(bucket_id)).await;
        *self.currently_processed.write().await = None;

        match result {
            Ok(inner) => inner,
            // Dropping the inner future kills any in-flight child.
            Err(_) => Err(PoolError::Timeout(self.bucket_timeout)),
        }
    }

    async fn process_inner(&self, bucket_id: Uuid) -> Result<()> {
        let store = self.store.clone();
        let bucket = with_reconnect(self.store.as_ref(), self.reconnect_delay, || {
            let store = store.clone();
            async move { Ok(store.bucket(bucket_id).await?) }
        })
        .await?;
        let build = self.store.build(bucket.build_id).await?;
        let project = self.store.project(&build.project).await?;

        tracing::info!(
            project = %project.name,
            build = build.number,
            bucket = %bucket.name,
            "Processing bucket"
        );

        let _env = EnvironmentGuard::sanitize();
        let dir = self.work_root.join(&project.name);
        self.source.sync(&project.url, &dir, &build.commit).await?;

        let child_env = self.child_env(&project, &bucket);
        self.prepare(&project, &build, &bucket, &dir, &child_env)
            .await?;

        let success = self
            .run_task_lists(&project, &bucket, &dir, &child_env)
            .await?;

        let finalized = self.finalize(bucket_id, success.success()).await?;
        self.finish_build_if_complete(finalized.build_id).await?;
        self.notify(&project, &build, finalized, &success.outcomes)
            .await;
        Ok(())
    }

    fn child_env(&self, project: &Project, bucket: &Bucket) -> Vec<(String, String)> {
        match project.plan.runtime_version(&bucket.name) {
            Some(version) => vec![("RUNTIME_VERSION".to_string(), version)],
            None => Vec::new(),
        }
    }

    /// Build preparation: per-build hook, per-runtime dependency install,
    /// per-group hook. A failing hook aborts processing; that is an
    /// infrastructure error, not a task failure.
    async fn prepare(
        &self,
        project: &Project,
        build: &Build,
        bucket: &Bucket,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<()> {
        let plan = &project.plan;

        let new_build = {
            let mut memo = self.memo.lock().await;
            if memo.build_id != Some(build.id) {
                memo.reset_for(build.id);
                true
            } else {
                false
            }
        };
        if new_build {
            if let Some(script) = &plan.before_all_script {
                self.run_hook(bucket.id, "before-all hook", script, dir, env)
                    .await?;
            }
        }

        let runtime = plan
            .runtime_version(&bucket.name)
            .unwrap_or_else(|| "default".to_string());
        let needs_bundle = {
            let memo = self.memo.lock().await;
            !memo.bundled_runtime_versions.contains(&runtime)
        };
        if needs_bundle {
            if let (Some(manifest), Some(install)) =
                (&plan.dependency_manifest, &plan.install_command)
            {
                if dir.join(manifest).exists() {
                    self.run_hook(bucket.id, "dependency install", install, dir, env)
                        .await?;
                }
            }
            self.memo
                .lock()
                .await
                .bundled_runtime_versions
                .insert(runtime);
        }

        if let Some(group) = plan.bucket_group(&bucket.name) {
            let needs_group = {
                let memo = self.memo.lock().await;
                !memo.prepared_groups.contains(&group)
            };
            if needs_group {
                if let Some(script) = &plan.before_group_script {
                    self.run_hook(bucket.id, "before-group hook", script, dir, env)
                        .await?;
                }
                self.memo.lock().await.prepared_groups.insert(group);
            }
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        bucket_id: Uuid,
        name: &str,
        script: &str,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<()> {
        let hook = Task::new(name, script);
        let outcome = self.runner.run(bucket_id, &hook, dir, env).await?;
        if !outcome.success {
            return Err(PoolError::Hook(format!("{name} failed:\n{}", outcome.output)));
        }
        Ok(())
    }

    /// Walk the four task lists. The non-after lists short-circuit on the
    /// first failure; after-tasks always run, and their failures count
    /// against the bucket's verdict too.
    async fn run_task_lists(
        &self,
        project: &Project,
        bucket: &Bucket,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<ListRun> {
        let plan = &project.plan;
        let mut run = ListRun::default();

        let before_all_pending: Vec<Task> = {
            let memo = self.memo.lock().await;
            plan.before_all_tasks
                .iter()
                .filter(|t| !memo.succeeded_before_all.contains(&t.name))
                .cloned()
                .collect()
        };

        let mut before_all_ok = true;
        for task in &before_all_pending {
            let outcome = self.runner.run(bucket.id, task, dir, env).await?;
            let success = outcome.success;
            run.outcomes.push(outcome);
            if !success {
                before_all_ok = false;
                run.failed = true;
                break;
            }
        }
        if before_all_ok {
            // Siblings of this build may now skip the whole list.
            let mut memo = self.memo.lock().await;
            for task in &plan.before_all_tasks {
                memo.succeeded_before_all.insert(task.name.clone());
            }
        }

        if !run.failed {
            self.run_list(&plan.before_bucket_tasks, bucket, dir, env, &mut run)
                .await?;
        }
        if !run.failed {
            let tasks = plan.bucket_tasks(&bucket.name);
            self.run_list(&tasks, bucket, dir, env, &mut run).await?;
        }

        // After-tasks run regardless of earlier failures.
        for task in &plan.after_bucket_tasks {
            let outcome = self.runner.run(bucket.id, task, dir, env).await?;
            if !outcome.success {
                run.failed = true;
            }
            run.outcomes.push(outcome);
        }

        Ok(run)
    }

    async fn run_list(
        &self,
        tasks: &[Task],
        bucket: &Bucket,
        dir: &Path,
        env: &[(String, String)],
        run: &mut ListRun,
    ) -> Result<()> {
        for task in tasks {
            let outcome = self.runner.run(bucket.id, task, dir, env).await?;
            let success = outcome.success;
            run.outcomes.push(outcome);
            if !success {
                run.failed = true;
                break;
            }
        }
        Ok(())
    }

    /// Concatenate the fragments into the final log, set the terminal
    /// state and drop the fragments.
    async fn finalize(&self, bucket_id: Uuid, success: bool) -> Result<Bucket> {
        let store = self.store.clone();
        with_reconnect(self.store.as_ref(), self.reconnect_delay, || {
            let store = store.clone();
            async move {
                let fragments = store.fragments(bucket_id).await?;
                let log: String = fragments.iter().map(|f| f.text.as_str()).collect();

                let mut bucket = store.bucket(bucket_id).await?;
                bucket.log = Some(log);
                bucket.error_log = None;
                bucket.state = if success {
                    BucketState::Done
                } else {
                    BucketState::Failed
                };
                bucket.finished_at = Some(Utc::now());
                store.update_bucket(&bucket).await?;
                store.delete_fragments(bucket_id).await?;
                Ok(bucket)
            }
        })
        .await
    }

    async fn finish_build_if_complete(&self, build_id: Uuid) -> Result<()> {
        let buckets = self.store.buckets_of_build(build_id).await?;
        if !buckets.iter().all(|b| b.state.is_terminal()) {
            return Ok(());
        }
        let mut build = self.store.build(build_id).await?;
        if build.finished_at.is_none() {
            build.finished_at = Some(Utc::now());
            self.store.update_build(&build).await?;
            tracing::info!(project = %build.project, build = build.number, "Build finished");
        }
        Ok(())
    }

    /// Fire notifications after the bucket row is durably updated. A
    /// delivery failure is logged but never alters the bucket's verdict.
    async fn notify(
        &self,
        project: &Project,
        build: &Build,
        mut bucket: Bucket,
        outcomes: &[TaskOutcome],
    ) {
        match bucket.state {
            BucketState::Failed => {
                let snapshot: String = outcomes
                    .iter()
                    .filter(|o| !o.success)
                    .map(|o| format!("------ {} failed ------\n{}", o.name, o.output))
                    .collect::<Vec<_>>()
                    .join("\n");
                bucket.error_log = Some(snapshot);
                if let Err(e) = self.store.update_bucket(&bucket).await {
                    tracing::warn!(bucket_id = %bucket.id, error = %e, "Could not store error log");
                }
                if let Err(e) = self.notifier.bucket_failed(project, build, &bucket).await {
                    tracing::warn!(bucket_id = %bucket.id, error = %e, "Failure notification failed");
                }
            }
            BucketState::Done => {
                if let Err(e) = self.notify_if_repaired(project, build, &bucket).await {
                    tracing::warn!(bucket_id = %bucket.id, error = %e, "Repair notification failed");
                }
            }
            _ => {}
        }
    }

    /// A success repairs the bucket when the same-named bucket of the
    /// immediately preceding build did not succeed.
    async fn notify_if_repaired(
        &self,
        project: &Project,
        build: &Build,
        bucket: &Bucket,
    ) -> Result<()> {
        let Some(previous) = self
            .store
            .last_build(&project.name, Some(build.number))
            .await?
        else {
            return Ok(());
        };
        let Some(predecessor) = self.store.bucket_of_build(previous.id, &bucket.name).await? else {
            return Ok(());
        };
        if predecessor.state != BucketState::Done {
            self.notifier.bucket_repaired(project, build, bucket).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ListRun {
    outcomes: Vec<TaskOutcome>,
    failed: bool,
}

impl ListRun {
    fn success(&self) -> bool {
        !self.failed
    }
}
