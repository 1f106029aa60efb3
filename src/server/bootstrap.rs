use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{self, LbCliOverrides, NodeCliOverrides};
use crate::dispatcher::Dispatcher;
use crate::forwarder::{ForwarderAdapter, LoggingForwarder};
use crate::net;
use crate::server::{self, LbState};

/// CLI arguments forwarded from `gale-lb`'s `main()`.
pub struct LbArgs {
    pub config_path: PathBuf,
    pub overrides: LbCliOverrides,
}

/// LB lifecycle: load config → build ring/registry → serve control plane +
/// introspection → block until signalled → drain sessions and return.
pub async fn run_lb(args: LbArgs) -> Result<()> {
    init_tracing();

    let config = config::LbConfig::load(&args.config_path, &args.overrides)?;

    let forwarder: Arc<dyn ForwarderAdapter> = Arc::new(LoggingForwarder::default());
    let state = LbState::new(config.clone(), forwarder)?;

    let control_addr = bind_addr(
        &config.private_interface.net_interface_private,
        config.private_interface.node_port,
    );
    let introspection_addr = bind_addr(
        &config.private_interface.net_interface_private,
        config.private_interface.api_port,
    );

    let cancel = CancellationToken::new();

    let control_handle = tokio::spawn({
        let state = state.clone();
        let cancel = cancel.clone();
        async move { server::run_control_server(control_addr, state, cancel).await }
    });

    let introspection_handle = tokio::spawn({
        let state = state.clone();
        let cancel = cancel.clone();
        async move { server::run_introspection_server(introspection_addr, state, cancel).await }
    });

    tracing::info!(
        control = %control_addr,
        introspection = %introspection_addr,
        "server: gale-lb ready",
    );

    wait_for_shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = control_handle.await {
        tracing::error!("server: control task error: {}", e);
    }
    if let Err(e) = introspection_handle.await {
        tracing::error!("server: introspection task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// CLI arguments forwarded from `gale-node`'s `main()`.
pub struct NodeArgs {
    pub config_path: PathBuf,
    pub overrides: NodeCliOverrides,
}

/// Node-agent lifecycle: load config → run the dispatcher until a shutdown
/// signal arrives → cancel and let in-flight reports drain.
pub async fn run_node(args: NodeArgs) -> Result<()> {
    init_tracing();

    let config = config::NodeConfig::load(&args.config_path, &args.overrides)?;
    let dispatcher = Arc::new(Dispatcher::new(config.load_balancer.addresses.clone()));

    let mut run_handle = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.start().await })
    };

    let result = tokio::select! {
        result = &mut run_handle => Some(result),
        _ = wait_for_shutdown_signal() => {
            tracing::info!("server: received shutdown signal, stopping dispatcher");
            dispatcher.stop()?;
            None
        }
    };

    // Either branch leaves the dispatcher task still owned by `run_handle`;
    // join it so every target has actually finished before we return.
    let result = match result {
        Some(r) => r,
        None => run_handle.await,
    };

    match result {
        Ok(Ok(())) => tracing::info!("dispatcher: all targets stopped"),
        Ok(Err(e)) => {
            tracing::error!("dispatcher: startup failed: {}", e);
            return Err(e);
        }
        Err(e) => anyhow::bail!("dispatcher task panicked: {e}"),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// Resolves `iface` to its bound IPv4 address for binding a server; falls
/// back to the wildcard address when `iface` is empty or unresolvable.
fn bind_addr(iface: &str, port: u16) -> SocketAddr {
    let ip = net::iface::resolve_ipv4(iface).unwrap_or(IpAddr::from([0, 0, 0, 0]));
    SocketAddr::new(ip, port)
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
