//! Leader-owned queue of unassigned bucket ids.
//!
//! The queue is intentionally ephemeral: its sole source of truth is the
//! store, and the next leader rebuilds it from the non-terminal buckets it
//! finds on its first scan. Pop order is FIFO within a project and
//! round-robin across projects, biased so the requestor that just received
//! a bucket from a project is steered to a different project next.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

#[derive(Debug, Default)]
pub struct BucketQueue {
    queues: HashMap<String, VecDeque<Uuid>>,
    /// Project rotation for round-robin across projects.
    rotation: VecDeque<String>,
    /// Per-project fairness list; the most recent recipient sits at the tail.
    recent: HashMap<String, VecDeque<String>>,
}

impl BucketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a project's pending sequence. Ids must belong to buckets in
    /// `queued` state.
    pub fn set_buckets(&mut self, project: &str, ids: Vec<Uuid>) {
        if ids.is_empty() {
            self.remove_project(project);
            return;
        }
        if !self.rotation.iter().any(|p| p == project) {
            self.rotation.push_back(project.to_string());
        }
        self.queues.insert(project.to_string(), ids.into());
    }

    pub fn is_empty(&self, project: &str) -> bool {
        self.queues.get(project).map_or(true, |q| q.is_empty())
    }

    pub fn pending(&self, project: &str) -> usize {
        self.queues.get(project).map_or(0, |q| q.len())
    }

    /// Pop the next bucket for `requestor`. Prefers a project whose last
    /// bucket went to someone else; falls back to any non-empty project.
    /// A bucket id is handed out at most once.
    pub fn next_bucket(&mut self, requestor: &str) -> Option<Uuid> {
        let chosen = self
            .position_of(|p, this| {
                !this.is_empty(p) && this.recent.get(p).and_then(|r| r.back()).map(|s| s.as_str())
                    != Some(requestor)
            })
            .or_else(|| self.position_of(|p, this| !this.is_empty(p)))?;

        let project = self.rotation.remove(chosen)?;
        let id = self.queues.get_mut(&project)?.pop_front()?;

        let recent = self.recent.entry(project.clone()).or_default();
        recent.retain(|r| r != requestor);
        recent.push_back(requestor.to_string());

        if self.queues.get(&project).is_some_and(|q| q.is_empty()) {
            self.queues.remove(&project);
            self.recent.remove(&project);
        } else {
            self.rotation.push_back(project);
        }
        Some(id)
    }

    /// Whether any project has pending buckets.
    pub fn is_drained(&self) -> bool {
        self.queues.values().all(|q| q.is_empty())
    }

    /// Discard everything; used when this peer loses leadership.
    pub fn clear(&mut self) {
        self.queues.clear();
        self.rotation.clear();
        self.recent.clear();
    }

    fn remove_project(&mut self, project: &str) {
        self.queues.remove(project);
        self.recent.remove(project);
        self.rotation.retain(|p| p != project);
    }

    fn position_of(&self, pred: impl Fn(&str, &Self) -> bool) -> Option<usize> {
        self.rotation.iter().position(|p| pred(p, self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn fifo_within_a_project() {
        let mut queue = BucketQueue::new();
        let buckets = ids(3);
        queue.set_buckets("p", buckets.clone());

        assert_eq!(queue.next_bucket("w1"), Some(buckets[0]));
        assert_eq!(queue.next_bucket("w1"), Some(buckets[1]));
        assert_eq!(queue.next_bucket("w1"), Some(buckets[2]));
        assert_eq!(queue.next_bucket("w1"), None);
    }

    #[test]
    fn each_id_handed_out_once() {
        let mut queue = BucketQueue::new();
        let buckets = ids(5);
        queue.set_buckets("p", buckets.clone());

        let mut seen = Vec::new();
        while let Some(id) = queue.next_bucket("w") {
            assert!(!seen.contains(&id));
            seen.push(id);
        }
        assert_eq!(seen.len(), buckets.len());
    }

    #[test]
    fn alternates_projects_for_one_requestor() {
        let mut queue = BucketQueue::new();
        let a = ids(2);
        let b = ids(2);
        queue.set_buckets("a", a.clone());
        queue.set_buckets("b", b.clone());

        assert_eq!(queue.next_bucket("w"), Some(a[0]));
        // "a" just served w, so "b" is preferred next.
        assert_eq!(queue.next_bucket("w"), Some(b[0]));
        assert_eq!(queue.next_bucket("w"), Some(a[1]));
        assert_eq!(queue.next_bucket("w"), Some(b[1]));
    }

    #[test]
    fn single_project_still_serves_repeat_requestor() {
        let mut queue = BucketQueue::new();
        let a = ids(2);
        queue.set_buckets("a", a.clone());

        assert_eq!(queue.next_bucket("w"), Some(a[0]));
        assert_eq!(queue.next_bucket("w"), Some(a[1]));
    }

    #[test]
    fn set_buckets_replaces_sequence() {
        let mut queue = BucketQueue::new();
        queue.set_buckets("p", ids(3));
        let replacement = ids(1);
        queue.set_buckets("p", replacement.clone());

        assert_eq!(queue.pending("p"), 1);
        assert_eq!(queue.next_bucket("w"), Some(replacement[0]));
    }

    #[test]
    fn clear_discards_all_state() {
        let mut queue = BucketQueue::new();
        queue.set_buckets("p", ids(3));
        queue.clear();
        assert!(queue.is_drained());
        assert!(queue.is_empty("p"));
        assert_eq!(queue.next_bucket("w"), None);
    }
}
