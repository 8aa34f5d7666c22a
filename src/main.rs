use std::sync::Arc;

use n0_error::Result;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunnl::config::{Config, SHUTDOWN_GRACE};
use tunnl::registry::Registry;
use tunnl::{gateway, redirect, ssh, stats, tls};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .ok();

    let config = Arc::new(Config::from_env());
    let registry = Registry::new();

    let host_key = ssh::load_or_generate_host_key(&config.host_key_path).await?;
    let ssh_config = ssh::server_config(host_key);
    let tls_config = tls::load_server_config(&config.tls_cert, &config.tls_key)?;

    // any bind failure here is fatal; the process exits non-zero
    let ssh_listener = bind(&config.ssh_addr).await?;
    info!(addr = %config.ssh_addr, "SSH server listening");
    let http_listener = bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP server listening (redirects to HTTPS)");
    let https_listener = bind(&config.https_addr).await?;
    info!(addr = %config.https_addr, "HTTPS server listening");
    let stats_listener = bind(&config.stats_addr).await?;
    info!(addr = %config.stats_addr, "stats server listening");

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();

    tasks.spawn(watch(
        "ssh",
        shutdown.clone(),
        ssh::run_ssh_listener(
            registry.clone(),
            config.clone(),
            ssh_config,
            ssh_listener,
            shutdown.clone(),
        ),
    ));
    tasks.spawn(watch(
        "http",
        shutdown.clone(),
        redirect::run_redirect_listener(config.clone(), http_listener, shutdown.clone()),
    ));
    tasks.spawn(watch(
        "https",
        shutdown.clone(),
        gateway::run_https_listener(
            registry.clone(),
            config.clone(),
            https_listener,
            tls_config,
            shutdown.clone(),
        ),
    ));
    tasks.spawn(watch(
        "stats",
        shutdown.clone(),
        stats::run_stats_listener(registry.clone(), stats_listener, shutdown.clone()),
    ));

    tokio::select! {
        _ = wait_for_signal() => info!("received shutdown signal"),
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    tasks.close();
    if timeout(SHUTDOWN_GRACE, tasks.wait()).await.is_err() {
        warn!("some connections did not finish within the shutdown grace period");
    }
    registry.stop().await;
    info!("shutdown complete");
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    use n0_error::StdResultExt;
    TcpListener::bind(Config::bind_addr(addr))
        .await
        .std_context(format!("failed to listen on {addr}"))
}

/// Runs a listener task; a fatal listener error brings the process down via
/// the shared shutdown token.
async fn watch(
    name: &'static str,
    shutdown: CancellationToken,
    task: impl Future<Output = Result<()>>,
) {
    if let Err(err) = task.await {
        error!("{name} listener failed: {err:#}");
    }
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
