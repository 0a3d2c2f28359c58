use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Token cancelled on SIGTERM or SIGINT.
///
/// Subsystems watch the token and drain gracefully; the node withdraws
/// its discovery tag before the process exits.
pub fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }
        trigger.cancel();
    });

    Ok(token)
}
