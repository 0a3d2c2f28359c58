//! Failure envelope: reconnect recovery and the three failure scopes.

mod test_harness;

use std::sync::Arc;

use forgepool::envelope::{with_reconnect, FailureScope};
use forgepool::error::{PoolError, Result};
use forgepool::store::{Bucket, BucketState, Build, Store, StoreError};
use test_harness::{plan_with_buckets, project_with_plan, ExecHarness, FAST_RECONNECT};

async fn seeded_bucket(harness: &ExecHarness) -> Bucket {
    let project = project_with_plan("web", plan_with_buckets(&[("alpha", "true")]));
    harness.store.upsert_project(&project).await.unwrap();
    let build = Build::new("web", 1, "c1", "http://leader.test");
    harness.store.insert_build(&build).await.unwrap();
    let bucket = Bucket::new(build.id, "alpha");
    harness.store.insert_bucket(&bucket).await.unwrap();
    bucket
}

#[tokio::test]
async fn gone_away_is_absorbed_by_reconnecting() {
    let harness = ExecHarness::new();
    let store = harness.store.clone();

    store.fail_next_ops(2);
    let projects = with_reconnect(store.as_ref(), FAST_RECONNECT, || {
        let store = store.clone();
        async move { Ok(store.projects().await?) }
    })
    .await
    .unwrap();

    assert!(projects.is_empty());
    assert_eq!(harness.store.reconnect_count(), 2);
}

#[tokio::test]
async fn gone_away_three_times_surfaces() {
    let harness = ExecHarness::new();
    let store = harness.store.clone();

    store.fail_next_ops(3);
    let result: Result<Vec<_>> = with_reconnect(store.as_ref(), FAST_RECONNECT, || {
        let store = store.clone();
        async move { Ok(store.projects().await?) }
    })
    .await;

    assert!(matches!(
        result,
        Err(PoolError::Store(StoreError::ConnectionGone))
    ));
}

#[tokio::test]
async fn other_errors_are_not_retried() {
    let harness = ExecHarness::new();
    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let counting = attempts.clone();
    let result: Option<()> = harness
        .envelope
        .run(
            FailureScope::Project("web".to_string()),
            "Project scan failed",
            move || {
                let counting = counting.clone();
                async move {
                    counting.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(PoolError::Internal("boom".to_string()))
                }
            },
        )
        .await;

    assert!(result.is_none());
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bucket_scope_marks_processing_failed() {
    let harness = ExecHarness::new();
    let bucket = seeded_bucket(&harness).await;

    let result: Option<()> = harness
        .envelope
        .run(
            FailureScope::Bucket(bucket.id),
            "Bucket processing failed",
            || async { Err(PoolError::Internal("executor crashed".to_string())) },
        )
        .await;
    assert!(result.is_none());

    let bucket = harness.store.bucket(bucket.id).await.unwrap();
    assert_eq!(bucket.state, BucketState::ProcessingFailed);
    assert!(bucket.finished_at.is_some());

    let log = bucket.log.unwrap();
    assert!(log.ends_with('\n'));
    assert!(log.contains("------ Processing failed ------"));
    assert!(log.contains("Bucket processing failed"));
    assert!(log.contains("executor crashed"));
}

#[tokio::test]
async fn terminal_buckets_keep_their_verdict() {
    let harness = ExecHarness::new();
    let mut bucket = seeded_bucket(&harness).await;
    bucket.state = BucketState::Done;
    bucket.log = Some("fine\n".to_string());
    harness.store.update_bucket(&bucket).await.unwrap();

    harness
        .envelope
        .run::<(), _, _>(
            FailureScope::Bucket(bucket.id),
            "Bucket processing failed",
            || async { Err(PoolError::Internal("late error".to_string())) },
        )
        .await;

    let bucket = harness.store.bucket(bucket.id).await.unwrap();
    assert_eq!(bucket.state, BucketState::Done);
    assert_eq!(bucket.log.as_deref(), Some("fine\n"));
}

#[tokio::test]
async fn project_scope_records_the_system_error() {
    let harness = ExecHarness::new();
    let project = project_with_plan("web", plan_with_buckets(&[("alpha", "true")]));
    harness.store.upsert_project(&project).await.unwrap();

    harness
        .envelope
        .run::<(), _, _>(
            FailureScope::Project("web".to_string()),
            "Project scan failed",
            || async { Err(PoolError::Internal("bad scan".to_string())) },
        )
        .await;

    let project = harness.store.project("web").await.unwrap();
    let error = project.last_system_error.unwrap();
    assert!(error.contains("Project scan failed"));
    assert!(error.contains("bad scan"));
}

#[tokio::test]
async fn operator_scope_mails_the_admin() {
    let harness = ExecHarness::new();

    harness
        .envelope
        .run::<(), _, _>(
            FailureScope::Operator("admin@test".to_string()),
            "Leader loop failed",
            || async { Err(PoolError::Internal("wedged".to_string())) },
        )
        .await;

    let mail = harness.mail.sent();
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].to, "admin@test");
    assert_eq!(mail[0].subject, "Leader loop failed");
    assert!(mail[0].body.contains("http://self.test"));
    assert!(mail[0].body.contains("http://leader.test"));
    assert!(mail[0].body.contains("wedged"));
}
