//! Bridge HTTP server: the webhook and the background tasks that live alongside it.

use crate::channels::{MessagingClient, RockBlockClient, SatelliteUplink, SignalCli, SignalPoller};
use crate::config::{self, Config};
use crate::dispatch::{self, Dispatcher};
use crate::gateway::webhook::receive_webhook;
use crate::whitelist::WhitelistStore;
use anyhow::{Context, Result};
use axum::{routing::post, Router};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct BridgeState {
    /// The bridge's own Signal number; recipient when a satellite message names nobody.
    pub account: String,
    pub whitelist: Arc<WhitelistStore>,
    pub messenger: Arc<dyn MessagingClient>,
    pub dispatcher: Dispatcher,
}

/// The collaborators the bridge runs with. Production uses signal-cli and RockBLOCK; tests pass doubles.
pub struct Collaborators {
    pub whitelist: Arc<WhitelistStore>,
    pub messenger: Arc<dyn MessagingClient>,
    pub uplink: Arc<dyn SatelliteUplink>,
}

/// Routes served by the bridge: the RockBLOCK webhook only.
pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/webhook", post(receive_webhook))
        .with_state(state)
}

/// Run the bridge with signal-cli and RockBLOCK; binds to config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (Ctrl+C or SIGTERM).
/// `config_path` is used to resolve a relative whitelist path.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    config::validate(&config)?;
    let account = config
        .signal
        .account
        .clone()
        .context("signal.account is not set")?;
    let whitelist_path = config::resolve_whitelist_path(&config, &config_path);
    let whitelist = Arc::new(WhitelistStore::new(
        &whitelist_path,
        config.whitelist.missing_file,
    ));
    if !whitelist_path.exists() {
        log::warn!(
            "whitelist {} does not exist; missing-file policy is {:?}",
            whitelist_path.display(),
            config.whitelist.missing_file
        );
    }
    let messenger: Arc<dyn MessagingClient> = Arc::new(SignalCli::new(&config.signal, account));
    let uplink: Arc<dyn SatelliteUplink> =
        Arc::new(RockBlockClient::new(&config.rockblock).context("building rockblock client")?);

    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("webhook listening on {}", bind_addr);

    serve(
        config,
        listener,
        Collaborators {
            whitelist,
            messenger,
            uplink,
        },
        shutdown_signal(),
    )
    .await
}

/// Serve on `listener` until `shutdown` completes, then stop the poller and drain queued sends.
pub async fn serve<F>(
    config: Config,
    listener: TcpListener,
    parts: Collaborators,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let account = config
        .signal
        .account
        .clone()
        .context("signal.account is not set")?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let (dispatcher, dispatch_worker) = Dispatcher::start(
        config.dispatch.max_in_flight,
        config.dispatch.queue_capacity,
        stop_rx.clone(),
    );

    let poller = SignalPoller::new(
        parts.messenger.clone(),
        parts.uplink,
        parts.whitelist.clone(),
        Duration::from_secs(config.signal.poll_interval_secs),
    );
    let poller_task = poller.start(stop_rx);

    let drain_timeout = Duration::from_secs(config.dispatch.drain_timeout_secs);
    let state = BridgeState {
        account,
        whitelist: parts.whitelist,
        messenger: parts.messenger,
        dispatcher,
    };

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown signal received, draining connections");
        })
        .await
        .context("webhook server exited");

    let _ = stop_tx.send(true);
    if let Err(e) = poller_task.await {
        log::error!("signal poller task failed: {}", e);
    }
    dispatch::drain(dispatch_worker, drain_timeout).await;
    log::info!("bridge stopped");
    served
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
