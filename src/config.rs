use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one pool peer.
///
/// Every peer in a group runs with the same settings apart from
/// `self_uri`/`listen_addr` and the optional tyrant flag.
#[derive(Debug, Clone)]
pub struct Config {
    /// Group this peer belongs to; also names the leader lock key.
    pub group: String,
    /// URI under which other peers reach this one, e.g. "http://10.0.0.5:3123".
    pub self_uri: String,
    /// Address the RPC server binds to.
    pub listen_addr: SocketAddr,
    /// Hostname recorded on buckets this peer claims.
    pub hostname: String,
    /// Bootstrap mode: hold the leader lock with an effectively infinite
    /// lease and renew it unconditionally.
    pub tyrant: bool,
    /// Address operator failure reports are mailed to.
    pub admin_email: Option<String>,
    /// Sender address for all outgoing mail.
    pub mail_from: String,
    /// Base URL of the web front-end, used in chat notifications.
    pub gui_base_url: String,
    /// Lease TTL for normal (non-tyrant) leadership.
    pub lease_ttl: Duration,
    /// Interval between leader ticks (election attempt + project scan).
    pub tick_interval: Duration,
    /// Wait hint returned to followers when the queue is drained.
    pub back_off: Duration,
    /// Upper bound of the random smear before popping a bucket.
    pub assignment_jitter: Duration,
    /// How often the task runner tails the child's log file.
    pub log_polling_interval: Duration,
    /// Wall-clock limit for processing one bucket.
    pub bucket_timeout: Duration,
    /// Delay before re-running a block after a database reconnect.
    pub reconnect_delay: Duration,
    /// Directory holding per-project working copies.
    pub work_root: PathBuf,
    /// Directory for transient task log files.
    pub log_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            self_uri: "http://127.0.0.1:3123".to_string(),
            listen_addr: "127.0.0.1:3123".parse().unwrap(),
            hostname: "localhost".to_string(),
            tyrant: false,
            admin_email: None,
            mail_from: "forgepool@localhost".to_string(),
            gui_base_url: "http://localhost:8080".to_string(),
            lease_ttl: Duration::from_secs(120),
            tick_interval: Duration::from_secs(60),
            back_off: Duration::from_secs(60),
            assignment_jitter: Duration::from_secs(2),
            log_polling_interval: Duration::from_secs(10),
            bucket_timeout: Duration::from_secs(7200),
            reconnect_delay: Duration::from_secs(3),
            work_root: PathBuf::from("/var/lib/forgepool/work"),
            log_root: std::env::temp_dir(),
        }
    }
}

impl Config {
    pub fn new(
        group: impl Into<String>,
        self_uri: impl Into<String>,
        listen_addr: SocketAddr,
    ) -> Self {
        Self {
            group: group.into(),
            self_uri: self_uri.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_tyrant(mut self, tyrant: bool) -> Self {
        self.tyrant = tyrant;
        self
    }

    pub fn with_admin_email(mut self, email: impl Into<String>) -> Self {
        self.admin_email = Some(email.into());
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }
}
