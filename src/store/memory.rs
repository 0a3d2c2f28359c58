//! In-memory store used by tests and single-process setups.
//!
//! Supports fault injection: `fail_next_ops` makes the next N operations
//! return the gone-away error so the reconnect envelope can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Build, Bucket, LogFragment, Project, Store, StoreError};

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Project>,
    builds: HashMap<Uuid, Build>,
    buckets: HashMap<Uuid, Bucket>,
    fragments: Vec<LogFragment>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_next: AtomicUsize,
    reconnects: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store operations fail with `ConnectionGone`.
    pub fn fail_next_ops(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of times `reconnect` was called.
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::ConnectionGone);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn projects(&self) -> Result<Vec<Project>, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn project(&self, name: &str) -> Result<Project, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        inner
            .projects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("project {name}")))
    }

    async fn upsert_project(&self, project: &Project) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut inner = self.inner.lock().unwrap();
        inner.projects.insert(project.name.clone(), project.clone());
        Ok(())
    }

    async fn insert_build(&self, build: &Build) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut inner = self.inner.lock().unwrap();
        inner.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn update_build(&self, build: &Build) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.builds.contains_key(&build.id) {
            return Err(StoreError::NotFound(format!("build {}", build.id)));
        }
        inner.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn build(&self, id: Uuid) -> Result<Build, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        inner
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build {id}")))
    }

    async fn last_build(
        &self,
        project: &str,
        before: Option<u32>,
    ) -> Result<Option<Build>, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .builds
            .values()
            .filter(|b| b.project == project)
            .filter(|b| before.map_or(true, |n| b.number < n))
            .max_by_key(|b| b.number)
            .cloned())
    }

    async fn next_build_number(&self, project: &str) -> Result<u32, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .builds
            .values()
            .filter(|b| b.project == project)
            .map(|b| b.number)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn insert_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut inner = self.inner.lock().unwrap();
        inner.buckets.insert(bucket.id, bucket.clone());
        Ok(())
    }

    async fn update_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.buckets.contains_key(&bucket.id) {
            return Err(StoreError::NotFound(format!("bucket {}", bucket.id)));
        }
        inner.buckets.insert(bucket.id, bucket.clone());
        Ok(())
    }

    async fn bucket(&self, id: Uuid) -> Result<Bucket, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        inner
            .buckets
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("bucket {id}")))
    }

    async fn buckets_of_build(&self, build_id: Uuid) -> Result<Vec<Bucket>, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        let mut buckets: Vec<Bucket> = inner
            .buckets
            .values()
            .filter(|b| b.build_id == build_id)
            .cloned()
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn bucket_of_build(
        &self,
        build_id: Uuid,
        name: &str,
    ) -> Result<Option<Bucket>, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .buckets
            .values()
            .find(|b| b.build_id == build_id && b.name == name)
            .cloned())
    }

    async fn append_fragment(&self, bucket_id: Uuid, text: &str) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut inner = self.inner.lock().unwrap();
        inner.fragments.push(LogFragment {
            id: Uuid::new_v4(),
            bucket_id,
            text: text.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn fragments(&self, bucket_id: Uuid) -> Result<Vec<LogFragment>, StoreError> {
        self.check_fault()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .fragments
            .iter()
            .filter(|f| f.bucket_id == bucket_id)
            .cloned()
            .collect())
    }

    async fn delete_fragments(&self, bucket_id: Uuid) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut inner = self.inner.lock().unwrap();
        inner.fragments.retain(|f| f.bucket_id != bucket_id);
        Ok(())
    }
}
