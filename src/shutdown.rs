use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and ctrl-c.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The engine and its replication tasks monitor child tokens and
/// drain gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received ctrl-c, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received ctrl-c, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}
