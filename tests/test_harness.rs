//! Shared helpers for forgepool integration tests.
//!
//! Provides an in-memory store/lock setup, recording mail and chat
//! transports, a no-op source sync and a ready-wired executor harness.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use forgepool::envelope::FailureEnvelope;
use forgepool::error::Result;
use forgepool::rpc::{AssignmentService, RpcState};
use forgepool::scheduler::BucketQueue;
use forgepool::notify::{
    ChatNotification, ChatTransport, MailMessage, MailTransport, Mailer, Notifier,
};
use forgepool::store::{
    BucketPlan, BuildPlan, MemoryStore, Project, Store, Task,
};
use forgepool::worker::{BucketExecutor, SourceSync, TaskRunner};

/// Fast intervals so tests never wait on production timings.
#[allow(dead_code)]
pub const FAST_POLL: Duration = Duration::from_millis(20);
#[allow(dead_code)]
pub const FAST_RECONNECT: Duration = Duration::from_millis(5);

/// Mail transport that records instead of delivering.
#[derive(Default)]
pub struct RecordingMail {
    messages: Mutex<Vec<MailMessage>>,
}

impl RecordingMail {
    #[allow(dead_code)]
    pub fn sent(&self) -> Vec<MailMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingMail {
    async fn deliver(&self, message: &MailMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Chat transport that records instead of posting.
#[derive(Default)]
pub struct RecordingChat {
    notes: Mutex<Vec<ChatNotification>>,
}

impl RecordingChat {
    #[allow(dead_code)]
    pub fn posted(&self) -> Vec<ChatNotification> {
        self.notes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingChat {
    async fn post(&self, notification: &ChatNotification) -> Result<()> {
        self.notes.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Source sync that only ensures the working directory exists.
pub struct NoopSync;

#[async_trait]
impl SourceSync for NoopSync {
    async fn sync(&self, _url: &str, dir: &Path, _commit: &str) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }
}

/// Build plan with one bucket per (name, command) pair.
#[allow(dead_code)]
pub fn plan_with_buckets(buckets: &[(&str, &str)]) -> BuildPlan {
    let mut plan = BuildPlan::default();
    for (name, command) in buckets {
        plan.buckets.insert(
            name.to_string(),
            BucketPlan {
                tasks: vec![Task::new(*name, *command)],
                group: None,
                runtime_version: None,
            },
        );
    }
    plan
}

/// Project with an observed commit, ready to want a build.
#[allow(dead_code)]
pub fn project_with_plan(name: &str, plan: BuildPlan) -> Project {
    let mut project = Project::new(name, format!("git://example/{name}.git"), plan);
    project.current_commit = Some("c1".to_string());
    project
}

/// Serve the peer RPC router on an ephemeral port; returns the peer URI.
#[allow(dead_code)]
pub async fn serve_rpc(state: RpcState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind rpc listener");
    let addr = listener.local_addr().expect("rpc listener addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, forgepool::rpc::server::router(state)).await;
    });
    (format!("http://{addr}"), handle)
}

/// Assignment service over the given queue with zero jitter.
#[allow(dead_code)]
pub fn assignment_service(
    store: Arc<MemoryStore>,
    queue: Arc<tokio::sync::Mutex<BucketQueue>>,
    envelope: Arc<FailureEnvelope>,
    back_off: Duration,
) -> Arc<AssignmentService> {
    Arc::new(AssignmentService::new(
        store as Arc<dyn Store>,
        queue,
        envelope,
        Duration::ZERO,
        back_off,
    ))
}

/// Executor wired against the in-memory store with recording transports.
#[allow(dead_code)]
pub struct ExecHarness {
    pub store: Arc<MemoryStore>,
    pub executor: Arc<BucketExecutor>,
    pub envelope: Arc<FailureEnvelope>,
    pub mail: Arc<RecordingMail>,
    pub chat: Arc<RecordingChat>,
    pub currently_processed: Arc<RwLock<Option<Uuid>>>,
    pub work: tempfile::TempDir,
    pub logs: tempfile::TempDir,
}

#[allow(dead_code)]
impl ExecHarness {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(bucket_timeout: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mail = Arc::new(RecordingMail::default());
        let chat = Arc::new(RecordingChat::default());
        let mailer = Mailer::new(mail.clone(), "pool@test");
        let notifier = Arc::new(Notifier::new(
            Some(mailer),
            Some(chat.clone() as Arc<dyn ChatTransport>),
            "http://gui.test",
        ));

        let currently_processed = Arc::new(RwLock::new(None));
        let leader_uri = Arc::new(RwLock::new(Some("http://leader.test".to_string())));
        let envelope = Arc::new(FailureEnvelope::new(
            store.clone() as Arc<dyn Store>,
            notifier.clone(),
            "http://self.test",
            leader_uri,
            FAST_RECONNECT,
        ));

        let work = tempfile::tempdir().expect("work dir");
        let logs = tempfile::tempdir().expect("log dir");
        let runner = TaskRunner::new(
            store.clone() as Arc<dyn Store>,
            FAST_POLL,
            logs.path().to_path_buf(),
        );
        let executor = Arc::new(BucketExecutor::new(
            store.clone() as Arc<dyn Store>,
            Arc::new(NoopSync),
            runner,
            notifier,
            currently_processed.clone(),
            bucket_timeout,
            FAST_RECONNECT,
            work.path().to_path_buf(),
        ));

        Self {
            store,
            executor,
            envelope,
            mail,
            chat,
            currently_processed,
            work,
            logs,
        }
    }
}
