//! Notecard proxy daemon.
//!
//! Resolves configuration, opens the Notecard, and serves HTTP on port 3434
//! until SIGINT or SIGTERM. If the Notecard can't be opened the daemon exits
//! with an error before it ever binds the port.

use anyhow::{Context, Result};
use std::{process::ExitCode, sync::Arc};
use tokio::{
    net::TcpListener,
    signal::unix::{self, SignalKind},
};
use tokio_util::sync::CancellationToken;

use notecard_proxy::{
    api,
    config::Config,
    notecard,
    proxy::RequestProxy,
    tracing::{self, prelude::*},
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();
    tracing::init_journald_or_stdout(config.as_ref().is_ok_and(|c| c.debug));

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e).context("while resolving configuration"),
    };

    match result {
        Ok(()) => {
            info!("Exiting.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let channel = notecard::open(&config.transport)
        .await
        .context("while setting up notecard")?;
    let proxy = Arc::new(RequestProxy::new(channel, config.debug));

    let result = serve(proxy.clone()).await;

    // Release the device on every path out, including a failed bind.
    proxy.close().await;
    result
}

async fn serve(proxy: Arc<RequestProxy>) -> Result<()> {
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;

    let listener = TcpListener::bind(api::LISTEN_ADDR)
        .await
        .with_context(|| format!("while binding {}", api::LISTEN_ADDR))?;

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(api::serve(listener, proxy, shutdown.clone()));
    info!("Started.");

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        result = &mut server => {
            result.context("HTTP server task failed")??;
            anyhow::bail!("HTTP server stopped unexpectedly");
        }
    }

    trace!("Shutting down.");
    shutdown.cancel();

    server.await.context("HTTP server task failed")??;
    Ok(())
}
