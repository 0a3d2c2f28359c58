//! Peer discovery through instance metadata tags.
//!
//! Each peer publishes `dcc:{group}:uri → self_uri` on startup and clears
//! it at shutdown, so enumerating a group is a tag lookup. The
//! cloud-metadata implementation is an external collaborator; the
//! in-memory store here backs tests and single-host pools.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

/// Tag under which a group's workers advertise themselves.
pub fn worker_tag(group: &str) -> String {
    format!("dcc:{group}:uri")
}

#[async_trait]
pub trait TagStore: Send + Sync {
    async fn publish(&self, tag: &str, value: &str) -> Result<()>;
    async fn withdraw(&self, tag: &str, value: &str) -> Result<()>;
    async fn lookup(&self, tag: &str) -> Result<Vec<String>>;
}

/// All worker URIs currently advertised for a group.
pub async fn find_workers(tags: &dyn TagStore, group: &str) -> Result<Vec<String>> {
    tags.lookup(&worker_tag(group)).await
}

#[derive(Default)]
pub struct MemoryTagStore {
    tags: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    async fn publish(&self, tag: &str, value: &str) -> Result<()> {
        let mut tags = self.tags.lock().unwrap();
        tags.entry(tag.to_string())
            .or_default()
            .insert(value.to_string());
        Ok(())
    }

    async fn withdraw(&self, tag: &str, value: &str) -> Result<()> {
        let mut tags = self.tags.lock().unwrap();
        if let Some(values) = tags.get_mut(tag) {
            values.remove(value);
            if values.is_empty() {
                tags.remove(tag);
            }
        }
        Ok(())
    }

    async fn lookup(&self, tag: &str) -> Result<Vec<String>> {
        let tags = self.tags.lock().unwrap();
        Ok(tags
            .get(tag)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default())
    }
}
