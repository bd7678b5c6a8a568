//! `tbrelay serve`: run the bridge until a signal or a terminal upstream close.

use tokio_util::sync::CancellationToken;
use tracing::info;

use tbrelay_core::Bridge;

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let settings = super::load(global)?;
    let config = settings.to_relay_config()?;

    let mut bridge = Bridge::new(config)?;
    let addr = bridge.start().await?;
    info!(%addr, "relay ready");

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal.cancel();
    });

    let result = bridge.run(cancel.clone()).await;
    cancel.cancel();
    bridge.shutdown().await;
    Ok(result?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
