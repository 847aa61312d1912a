use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use feedpull::config::Config;
use feedpull::coordinator::{ControlServer, HttpManagerClient, SessionHandle, SessionRunner};
use feedpull::crawler::ReqwestFetcher;
use feedpull::metrics;
use feedpull::utils::SystemClock;

pub async fn run(config: Config, puller_name: Option<String>) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    let puller_name = puller_name.unwrap_or_else(|| format!("feedpull-{}", Uuid::new_v4()));
    tracing::info!(
        puller = %puller_name,
        manager = %config.manager.url,
        threads = config.feed_request.threads,
        "Starting feed puller"
    );

    let manager = Arc::new(
        HttpManagerClient::new(&config.manager, puller_name)
            .context("Failed to create manager client")?,
    );
    let fetcher =
        Arc::new(ReqwestFetcher::new(&config.feed_request).context("Failed to create fetcher")?);

    let handle = SessionHandle::new();
    let server = ControlServer::new(&config.manager.listen_addr, handle.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut server_shutdown = shutdown_rx.clone();
    let mut server_task = tokio::spawn(async move {
        server
            .start_with_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    let runner = SessionRunner::new(config, manager, fetcher, Arc::new(SystemClock), handle);
    let runner_task = tokio::spawn(runner.run(shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
        }
        result = &mut server_task => {
            shutdown_tx.send_replace(true);
            runner_task.await??;
            result??;
            anyhow::bail!("Control server stopped unexpectedly");
        }
    }

    shutdown_tx.send_replace(true);
    runner_task.await??;
    server_task.await??;

    tracing::info!("Feed puller stopped");
    Ok(())
}
