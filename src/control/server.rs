use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::{Request, Response, Status, Streaming};

use crate::config::LbConfig;
use crate::net::arp;
use crate::pb::lb_node_manager_server::LbNodeManager;
use crate::pb::{ConfigResponse, Empty, HealthStatus};
use crate::registry::{NodeKey, NodeRegistry};

use super::session;

/// Implements `LBNodeManager`: `GetConfig` (pure read) and the streaming
/// `ReportHealthStatus` (constructs one `HealthSession` per accepted
/// stream, bound to the peer address). Server-level parameters (message
/// size, keepalive) are set where the `tonic::transport::Server` is built
/// (see `server::bootstrap`), not on this type.
///
/// `GetConfig` and every newly opened `ReportHealthStatus` stream both read
/// the live config snapshot rather than a value captured at server startup,
/// so an operator change is observed on the *next* call/session, per spec
/// §3 — but a session already in progress keeps the `health_check_timeout`
/// it was handed when its stream was opened; it is never re-read mid-session.
///
/// `sessions` tracks every spawned `HealthSession` task; `cancel` is handed
/// to each one so server shutdown (spec §5: "the server's shutdown cancels
/// all sessions and awaits their termination before returning") can drain
/// them deterministically instead of letting them run as orphaned tasks.
pub struct ControlServer {
    registry: Arc<NodeRegistry>,
    config: Arc<ArcSwap<LbConfig>>,
    cancel: CancellationToken,
    sessions: TaskTracker,
}

impl ControlServer {
    pub fn new(
        registry: Arc<NodeRegistry>,
        config: Arc<ArcSwap<LbConfig>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            config,
            cancel,
            sessions: TaskTracker::new(),
        }
    }

    /// A clone of the session tracker, taken before `self` is moved into the
    /// `tonic` service builder, so the caller can `close()` + `wait()` on it
    /// after `serve_with_shutdown` returns.
    pub fn session_tracker(&self) -> TaskTracker {
        self.sessions.clone()
    }
}

#[tonic::async_trait]
impl LbNodeManager for ControlServer {
    async fn get_config(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ConfigResponse>, Status> {
        let cfg = self.config.load();
        let health = &cfg.node_health;
        let health_check_timeout_ns = health
            .checks_timeout_duration()
            .map_err(|e| Status::internal(format!("invalid checks_timeout: {e}")))?
            .as_nanos() as i64;
        let black_list_expiry_ns = health
            .black_list_expiry_duration()
            .map_err(|e| Status::internal(format!("invalid black_list_expiry: {e}")))?
            .as_nanos() as i64;

        Ok(Response::new(ConfigResponse {
            checks_before_routing: health.checks_before_routing,
            health_check_timeout: health_check_timeout_ns,
            black_list_after_fails: health.black_list_after_fails,
            black_list_expiry: black_list_expiry_ns,
        }))
    }

    type ReportHealthStatusStream =
        Pin<Box<dyn Stream<Item = Result<HealthStatus, Status>> + Send + 'static>>;

    async fn report_health_status(
        &self,
        request: Request<Streaming<HealthStatus>>,
    ) -> Result<Response<Self::ReportHealthStatusStream>, Status> {
        let peer_addr = request
            .remote_addr()
            .ok_or_else(|| Status::invalid_argument("no peer address available"))?;
        let inbound = request.into_inner();

        let key = NodeKey::new(peer_addr);
        if !self.registry.register(&key) {
            return Err(Status::permission_denied("node is blacklisted"));
        }
        metrics::gauge!("gale_sessions_active").increment(1.0);

        // Informational only (spec §3/§4.3: "optional ARP-resolved MAC is
        // informational only, not part of identity") — never folded into
        // `NodeKey`, just logged alongside registration.
        let cfg = self.config.load();
        let private_iface = &cfg.private_interface.net_interface_private;
        if let Some(mac) = arp::lookup_mac(&peer_addr.ip().to_string(), private_iface) {
            tracing::debug!(node_key = %key, mac = %mac, "control: resolved peer MAC");
        }
        drop(cfg);

        let timeout = self
            .config
            .load()
            .node_health
            .checks_timeout_duration()
            .map_err(|e| Status::internal(format!("invalid checks_timeout: {e}")))?;

        // Reverse half of the bidirectional stream: reserved for future use
        // (admin-initiated drain, config push); the core never sends on it.
        let (reverse_tx, reverse_rx) = mpsc::channel::<Result<HealthStatus, Status>>(1);

        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        self.sessions.spawn(async move {
            session::run(key, peer_addr, inbound, registry, timeout, cancel, reverse_tx).await;
        });

        let out = ReceiverStream::new(reverse_rx);
        Ok(Response::new(Box::pin(out)))
    }
}
