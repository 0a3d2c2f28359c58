use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{NextBucketRequest, NextBucketResponse, ProcessingResponse};
use crate::envelope::{FailureEnvelope, FailureScope};
use crate::error::Result;
use crate::scheduler::BucketQueue;
use crate::store::{BucketState, Store};

/// Leader-side implementation of the assignment RPC.
pub struct AssignmentService {
    store: Arc<dyn Store>,
    queue: Arc<Mutex<BucketQueue>>,
    envelope: Arc<FailureEnvelope>,
    jitter: Duration,
    back_off: Duration,
}

impl AssignmentService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<Mutex<BucketQueue>>,
        envelope: Arc<FailureEnvelope>,
        jitter: Duration,
        back_off: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            envelope,
            jitter,
            back_off,
        }
    }

    /// Pop and claim the next bucket for `requestor_uri`. Returns the
    /// bucket id and a back-off hint; the hint is zero exactly when a
    /// bucket was handed out.
    pub async fn next_bucket(&self, requestor_uri: &str, hostname: &str) -> (Option<Uuid>, u64) {
        // Smear concurrent callers so they do not all hit the pop at once.
        if !self.jitter.is_zero() {
            let smear = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(smear)).await;
        }

        let popped = {
            let mut queue = self.queue.lock().await;
            queue.next_bucket(requestor_uri)
        };
        let Some(id) = popped else {
            return (None, self.back_off.as_secs());
        };

        let claimed = self
            .envelope
            .run(FailureScope::Bucket(id), "Claiming bucket", || {
                self.claim(id, requestor_uri, hostname)
            })
            .await;
        match claimed {
            Some(()) => {
                tracing::info!(bucket_id = %id, requestor = requestor_uri, "Bucket assigned");
                (Some(id), 0)
            }
            None => (None, self.back_off.as_secs()),
        }
    }

    async fn claim(&self, id: Uuid, requestor_uri: &str, hostname: &str) -> Result<()> {
        let now = Utc::now();
        let mut bucket = self.store.bucket(id).await?;

        let mut build = self.store.build(bucket.build_id).await?;
        if build.started_at.is_none() {
            build.started_at = Some(now);
            self.store.update_build(&build).await?;
        }

        bucket.worker_uri = Some(requestor_uri.to_string());
        bucket.worker_hostname = Some(hostname.to_string());
        bucket.state = BucketState::Claimed;
        bucket.started_at = Some(now);
        self.store.update_bucket(&bucket).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RpcState {
    pub assignment: Arc<AssignmentService>,
    /// Bucket currently owned by this peer's executor, if any.
    pub currently_processed: Arc<RwLock<Option<Uuid>>>,
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/next_bucket", post(next_bucket_handler))
        .route("/processing/:bucket_id", get(processing_handler))
        .with_state(state)
}

async fn next_bucket_handler(
    State(state): State<RpcState>,
    Json(request): Json<NextBucketRequest>,
) -> Json<NextBucketResponse> {
    let (bucket_id, back_off_seconds) = state
        .assignment
        .next_bucket(&request.requestor_uri, &request.hostname)
        .await;
    Json(NextBucketResponse {
        bucket_id,
        back_off_seconds,
    })
}

async fn processing_handler(
    State(state): State<RpcState>,
    Path(bucket_id): Path<Uuid>,
) -> Json<ProcessingResponse> {
    let processing = *state.currently_processed.read().await == Some(bucket_id);
    Json(ProcessingResponse { processing })
}

pub struct RpcServer {
    addr: SocketAddr,
    state: RpcState,
}

impl RpcServer {
    pub fn new(addr: SocketAddr, state: RpcState) -> Self {
        Self { addr, state }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(addr = %self.addr, "Starting RPC server");
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }
}
