use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coordination::LockService;
use crate::discovery::{worker_tag, TagStore};
use crate::election::{Election, Transition};
use crate::envelope::{FailureEnvelope, FailureScope};
use crate::error::Result;
use crate::notify::Notifier;
use crate::rpc::{AssignmentService, PeerClient, RpcServer, RpcState};
use crate::scheduler::{BucketQueue, ProjectScanner};
use crate::store::Store;
use crate::worker::{BucketExecutor, SourceSync, TaskRunner, Worker};

/// One pool peer: election + scanner, assignment server, executor loop,
/// and the optional tyrant renewer, all sharing a single queue mutex.
pub struct Node {
    config: Config,
    store: Arc<dyn Store>,
    lock: Arc<dyn LockService>,
    tags: Arc<dyn TagStore>,
    source: Arc<dyn SourceSync>,
    notifier: Arc<Notifier>,
}

impl Node {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        lock: Arc<dyn LockService>,
        tags: Arc<dyn TagStore>,
        source: Arc<dyn SourceSync>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            lock,
            tags,
            source,
            notifier,
        }
    }

    /// Run the peer until `cancel` fires.
    ///
    /// Spawns the leader tick loop, the worker loop and (in tyrant mode)
    /// the lease renewer, then blocks on the RPC server. The discovery
    /// tag is published first and withdrawn on the way out, so shutdown
    /// leaves no residue behind.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = self.config.clone();
        let tag = worker_tag(&config.group);
        self.tags.publish(&tag, &config.self_uri).await?;
        tracing::info!(group = %config.group, uri = %config.self_uri, "Joined worker pool");

        let election = Arc::new(Election::new(
            self.lock.clone(),
            &config.group,
            &config.self_uri,
            config.lease_ttl,
            config.tyrant,
        ));
        let leader_uri = election.leader_handle();

        let envelope = Arc::new(FailureEnvelope::new(
            self.store.clone(),
            self.notifier.clone(),
            &config.self_uri,
            leader_uri.clone(),
            config.reconnect_delay,
        ));

        let queue = Arc::new(Mutex::new(BucketQueue::new()));
        let currently_processed = Arc::new(RwLock::new(None));
        let peers = PeerClient::new();

        let scanner = Arc::new(ProjectScanner::new(
            self.store.clone(),
            queue.clone(),
            peers.clone(),
            envelope.clone(),
            &config.self_uri,
        ));
        let assignment = Arc::new(AssignmentService::new(
            self.store.clone(),
            queue.clone(),
            envelope.clone(),
            config.assignment_jitter,
            config.back_off,
        ));

        let runner = TaskRunner::new(
            self.store.clone(),
            config.log_polling_interval,
            config.log_root.clone(),
        );
        let executor = Arc::new(BucketExecutor::new(
            self.store.clone(),
            self.source.clone(),
            runner,
            self.notifier.clone(),
            currently_processed.clone(),
            config.bucket_timeout,
            config.reconnect_delay,
            config.work_root.clone(),
        ));

        // Leader loop: one election round and, while leading, one scan
        // per tick.
        {
            let election = election.clone();
            let scanner = scanner.clone();
            let queue = queue.clone();
            let envelope = envelope.clone();
            let admin = config.admin_email.clone();
            let cancel = cancel.clone();
            let tick = config.tick_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    match election.tick().await {
                        Transition::BecameLeader => {
                            queue.lock().await.clear();
                            let restored = match &admin {
                                Some(address) => envelope
                                    .run(
                                        FailureScope::Operator(address.clone()),
                                        "Leader takeover failed",
                                        || scanner.restore_queue(),
                                    )
                                    .await
                                    .is_some(),
                                None => scanner
                                    .restore_queue()
                                    .await
                                    .map_err(
                                        |e| tracing::error!(error = %e, "Queue restore failed"),
                                    )
                                    .is_ok(),
                            };
                            if restored {
                                scanner.scan_all().await;
                            }
                        }
                        Transition::StayedLeader => scanner.scan_all().await,
                        Transition::LostLeadership => queue.lock().await.clear(),
                        Transition::StayedFollower => {}
                    }
                }
            });
        }

        let tyrant_renewer = election.spawn_tyrant_renewer(cancel.clone());

        // Worker loop: every peer executes buckets, the leader included.
        {
            let worker = Worker::new(
                executor,
                peers,
                envelope,
                leader_uri,
                &config.self_uri,
                &config.hostname,
                config.back_off,
            );
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker.run(cancel).await;
            });
        }

        let server = RpcServer::new(
            config.listen_addr,
            RpcState {
                assignment,
                currently_processed,
            },
        );
        let served = server.run(cancel.clone()).await;

        if let Some(handle) = tyrant_renewer {
            handle.abort();
        }
        self.tags.withdraw(&tag, &config.self_uri).await?;
        tracing::info!(group = %config.group, uri = %config.self_uri, "Left worker pool");
        served
    }
}
