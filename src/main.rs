use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::mysql::MySqlPoolOptions;
use tracing_subscriber::EnvFilter;

use forgepool::config::Config;
use forgepool::coordination::MysqlLockService;
use forgepool::discovery::MemoryTagStore;
use forgepool::node::Node;
use forgepool::notify::{ChatRoomConfig, HttpChatRoom, Mailer, Notifier, SendmailTransport};
use forgepool::shutdown::shutdown_token;
use forgepool::store::MysqlStore;
use forgepool::worker::GitSync;

#[derive(Parser, Debug)]
#[command(name = "forgepool")]
#[command(about = "Distributed CI worker pool with leader-elected bucket scheduling")]
struct Args {
    /// Worker group this peer joins.
    #[arg(long, default_value = "default")]
    group: String,

    /// Port the peer RPC server listens on.
    #[arg(long, default_value = "3123")]
    port: u16,

    /// URI other peers use to reach this one; defaults to the local
    /// hostname and the RPC port.
    #[arg(long)]
    uri: Option<String>,

    /// MySQL connection string for the shared build store.
    #[arg(long, env = "FORGEPOOL_DATABASE_URL")]
    database_url: String,

    /// Seize the leader lock unconditionally (bootstrap a stuck group).
    #[arg(long)]
    tyrant: bool,

    /// Operator address for infrastructure failure reports.
    #[arg(long)]
    admin_email: Option<String>,

    /// Sender address for outgoing mail.
    #[arg(long, default_value = "forgepool@localhost")]
    mail_from: String,

    /// Base URL of the web front-end, used in notifications.
    #[arg(long, default_value = "http://localhost:8080")]
    gui_url: String,

    /// Chat API base URL; chat notifications are disabled without it.
    #[arg(long)]
    chat_api: Option<String>,

    #[arg(long, default_value = "")]
    chat_room: String,

    #[arg(long, default_value = "", env = "FORGEPOOL_CHAT_TOKEN")]
    chat_token: String,

    /// Directory holding per-project working copies.
    #[arg(long, default_value = "/var/lib/forgepool/work")]
    work_dir: String,
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let hostname = local_hostname();
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let self_uri = args
        .uri
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", hostname, args.port));

    let mut config = Config::new(&args.group, &self_uri, listen_addr);
    config.hostname = hostname;
    config.tyrant = args.tyrant;
    config.admin_email = args.admin_email.clone();
    config.mail_from = args.mail_from.clone();
    config.gui_base_url = args.gui_url.clone();
    config.work_root = args.work_dir.clone().into();

    tracing::info!(
        group = %config.group,
        uri = %config.self_uri,
        tyrant = config.tyrant,
        "Starting forgepool peer"
    );

    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await
        .context("connecting to the build store")?;
    let store = Arc::new(MysqlStore::new(pool.clone()));
    store
        .ensure_schema()
        .await
        .context("preparing the build schema")?;
    let lock = Arc::new(MysqlLockService::new(pool));

    let mailer = Mailer::new(Arc::new(SendmailTransport::default()), &config.mail_from);
    let chat = args.chat_api.as_ref().map(|api| {
        Arc::new(HttpChatRoom::new(ChatRoomConfig {
            api_base: api.clone(),
            room_id: args.chat_room.clone(),
            token: args.chat_token.clone(),
        })) as Arc<dyn forgepool::notify::ChatTransport>
    });
    let notifier = Arc::new(Notifier::new(Some(mailer), chat, &config.gui_base_url));

    let node = Node::new(
        config,
        store,
        lock,
        Arc::new(MemoryTagStore::new()),
        Arc::new(GitSync::new()),
        notifier,
    );

    let cancel = shutdown_token()?;
    node.run(cancel).await?;
    Ok(())
}
