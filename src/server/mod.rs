pub mod bootstrap;
pub mod introspection;
pub mod runtime;
mod state;

pub use state::LbState;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as TonicServer;
use tracing::{error, info};

use crate::control::ControlServer;
use crate::pb::lb_node_manager_server::LbNodeManagerServer;

const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const INTROSPECTION_READ_TIMEOUT: Duration = Duration::from_secs(5);
const INTROSPECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const INTROSPECTION_MAX_HEADER_BYTES: usize = 1024 * 1024;
const INTROSPECTION_SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Runs the `LBNodeManager` control-plane server until `cancel` fires.
///
/// Server parameters follow spec §4.4: 4 MiB message limit, ~5s keepalive
/// ping / ~10s keepalive timeout, no connection-age cap (sessions are
/// long-lived by design — `tonic`'s default has none, so nothing to set).
///
/// Shutdown discipline (spec §5): `cancel` is handed to every `HealthSession`
/// spawned while serving, and `serve_with_shutdown` returning only means
/// `tonic` stopped accepting new streams — it does not wait for the session
/// tasks those streams spawned. So this also closes and drains the
/// `ControlServer`'s session tracker before returning, which is what
/// actually awaits every session's termination (and its `purge`).
pub async fn run_control_server(
    addr: SocketAddr,
    state: LbState,
    cancel: CancellationToken,
) -> Result<()> {
    let control = ControlServer::new(state.registry.clone(), state.config.clone(), cancel.clone());
    let sessions = control.session_tracker();

    info!(%addr, "server: control plane listening");

    TonicServer::builder()
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
        .add_service(
            LbNodeManagerServer::new(control)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .serve_with_shutdown(addr, cancel.cancelled())
        .await?;

    sessions.close();
    sessions.wait().await;

    info!("server: control plane stopped");
    Ok(())
}

/// Runs the read-only introspection HTTP API (`GET /nodes`, `GET /nodes/:id`,
/// `/healthz`, `/metrics`) until `cancel` fires, then drains in-flight
/// connections for up to `INTROSPECTION_SHUTDOWN_DRAIN` (spec §6).
///
/// Per-connection limits: `INTROSPECTION_READ_TIMEOUT` bounds header reads,
/// `INTROSPECTION_MAX_HEADER_BYTES` caps the request buffer, and
/// `INTROSPECTION_IDLE_TIMEOUT` bounds the connection overall.
pub async fn run_introspection_server(
    addr: SocketAddr,
    state: LbState,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "server: introspection listening");

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = cancel.cancelled() => {
                info!("server: introspection: stop accepting, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: introspection: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        active_conns.fetch_add(1, Ordering::Relaxed);
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { introspection::handle_introspection(req, state) }
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder
                .http1()
                .keep_alive(true)
                .header_read_timeout(INTROSPECTION_READ_TIMEOUT)
                .max_buf_size(INTROSPECTION_MAX_HEADER_BYTES);
            let serve = builder.serve_connection_with_upgrades(io, svc);

            // hyper's connection API has no separate knob for "idle between
            // keep-alive requests" vs. "total connection lifetime", so this
            // timeout bounds the whole connection; header_read_timeout above
            // covers the tighter per-request read bound.
            match tokio::time::timeout(INTROSPECTION_IDLE_TIMEOUT, serve).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if !e.to_string().contains("connection closed") {
                        error!("server: introspection: connection error, peer={}, error={}", peer_addr, e);
                    }
                }
                Err(_) => {
                    error!("server: introspection: connection idle timeout, peer={}", peer_addr);
                }
            }

            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    let remaining = active_conns.load(Ordering::Relaxed);
    if remaining > 0 {
        info!("server: introspection: draining {} connections", remaining);
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        if tokio::time::timeout(INTROSPECTION_SHUTDOWN_DRAIN, drain).await.is_err() {
            info!(
                "server: introspection: drain timeout, {} connections still active",
                active_conns.load(Ordering::Relaxed)
            );
        }
    }

    info!("server: introspection stopped");
    Ok(())
}
