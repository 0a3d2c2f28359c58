//! Failure envelope: the single choke point for error handling.
//!
//! Every externally-invoked block runs inside [`FailureEnvelope::run`].
//! The transient "server has gone away" condition is absorbed by
//! re-running the block after a reconnect, twice at most. Anything else is
//! classified by the scope the caller supplied (bucket, project, or
//! operator) and produces exactly one record: a `ProcessingFailed`
//! bucket, a project system error, or an operator mail. Inside the
//! envelope errors propagate with `?`; outside it, nothing does.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::notify::Notifier;
use crate::store::{BucketState, Store};

/// Where a failure should be recorded.
#[derive(Debug, Clone)]
pub enum FailureScope {
    Bucket(Uuid),
    Project(String),
    Operator(String),
}

/// Trailer appended to a bucket's log when processing aborts.
pub fn processing_failed_report(subject: &str, detail: &str) -> String {
    format!("\n\n------ Processing failed ------\n\n{subject}\n\n{detail}\n")
}

/// Re-run `f` after a reconnect when it fails with the gone-away error.
/// The block runs at most three times; other errors pass through.
pub async fn with_reconnect<T, F, Fut>(
    store: &dyn Store,
    delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut reruns = 0;
    loop {
        match f().await {
            Err(e) if e.is_gone_away() && reruns < 2 => {
                reruns += 1;
                tracing::warn!(rerun = reruns, "Database has gone away, reconnecting");
                tokio::time::sleep(delay).await;
                store.reconnect().await;
            }
            other => return other,
        }
    }
}

pub struct FailureEnvelope {
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    self_uri: String,
    leader_uri: Arc<RwLock<Option<String>>>,
    reconnect_delay: Duration,
}

impl FailureEnvelope {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<Notifier>,
        self_uri: &str,
        leader_uri: Arc<RwLock<Option<String>>>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            self_uri: self_uri.to_string(),
            leader_uri,
            reconnect_delay,
        }
    }

    /// Run `f` under the reconnect retry; classify any residual error
    /// according to `scope`. Returns the block's value, or `None` when the
    /// failure was recorded instead.
    pub async fn run<T, F, Fut>(&self, scope: FailureScope, subject: &str, f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match with_reconnect(self.store.as_ref(), self.reconnect_delay, f).await {
            Ok(value) => Some(value),
            Err(error) => {
                self.record(scope, subject, &error).await;
                None
            }
        }
    }

    async fn record(&self, scope: FailureScope, subject: &str, error: &PoolError) {
        tracing::error!(?scope, subject, %error, "Recording failure");
        match scope {
            FailureScope::Bucket(id) => self.mark_bucket_dead(id, subject, &error.to_string()).await,
            FailureScope::Project(name) => self.mark_project_failed(&name, subject, error).await,
            FailureScope::Operator(address) => self.mail_operator(&address, subject, error).await,
        }
    }

    /// Transition a bucket to `ProcessingFailed` and append the report
    /// trailer to its log. Shared with the scanner's liveness recovery.
    pub async fn mark_bucket_dead(&self, id: Uuid, subject: &str, detail: &str) {
        let store = self.store.clone();
        let report = processing_failed_report(subject, detail);
        let result = with_reconnect(self.store.as_ref(), self.reconnect_delay, || {
            let store = store.clone();
            let report = report.clone();
            async move {
                let mut bucket = store.bucket(id).await?;
                // Terminal states are sticky; a bucket that already
                // finished keeps its verdict.
                if bucket.state.is_terminal() {
                    return Ok(());
                }
                bucket.state = BucketState::ProcessingFailed;
                bucket.append_to_log(&report);
                if bucket.finished_at.is_none() {
                    bucket.finished_at = Some(Utc::now());
                }
                store.update_bucket(&bucket).await?;
                Ok(())
            }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(bucket_id = %id, error = %e, "Failed to record bucket failure");
        }
    }

    async fn mark_project_failed(&self, name: &str, subject: &str, error: &PoolError) {
        let store = self.store.clone();
        let report = format!("{subject}: {error}");
        let result = with_reconnect(self.store.as_ref(), self.reconnect_delay, || {
            let store = store.clone();
            let report = report.clone();
            let name = name.to_string();
            async move {
                let mut project = store.project(&name).await?;
                project.last_system_error = Some(report);
                store.upsert_project(&project).await?;
                Ok(())
            }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(project = name, error = %e, "Failed to record project failure");
        }
    }

    async fn mail_operator(&self, address: &str, subject: &str, error: &PoolError) {
        let leader = self.leader_uri.read().await.clone();
        let body = format!(
            "{subject}\n\nworker: {}\nleader: {}\n\n{error:?}\n",
            self.self_uri,
            leader.as_deref().unwrap_or("unknown"),
        );
        if let Err(e) = self.notifier.operator(address, subject, &body).await {
            tracing::error!(address, error = %e, "Failed to mail operator");
        }
    }
}
