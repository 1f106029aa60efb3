//! End-to-end scenarios from spec §8, driven over a real `tonic` client
//! against an in-process `ControlServer` bound to an ephemeral port.
//!
//! Timeouts are shortened (seconds, not the production 10s default) so the
//! suite runs fast while still exercising the real wire path: `GetConfig`,
//! the bidirectional `ReportHealthStatus` stream, and the timer/receive
//! race inside `HealthSession`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use galelb::config::{LbAddress, LbConfig};
use galelb::dispatcher::{Dispatcher, DispatcherStatus};
use galelb::forwarder::{ForwarderAdapter, LoggingForwarder};
use galelb::pb::lb_node_manager_client::LbNodeManagerClient;
use galelb::pb::{Empty, HealthStatus};
use galelb::registry::NodeKey;
use galelb::ring::VIRTUAL_NODES;
use galelb::server::{self, LbState};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;

const STATUS_SERVING: u32 = 0;
const STATUS_NOT_SERVING: u32 = 1;
const STATUS_SHUTTING_DOWN: u32 = 2;

struct TestServer {
    addr: SocketAddr,
    state: LbState,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Picks a free port, builds an `LbState` from `config`, and spawns the
/// control-plane server on it, the same way `bootstrap::run_lb` does.
async fn spawn_server(config: LbConfig) -> TestServer {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let forwarder: Arc<dyn ForwarderAdapter> = Arc::new(LoggingForwarder::default());
    let state = LbState::new(config, forwarder).expect("build LbState");
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let state = state.clone();
        let cancel = cancel.clone();
        async move { server::run_control_server(addr, state, cancel).await }
    });

    wait_until_connectable(addr).await;

    TestServer {
        addr,
        state,
        cancel,
        handle,
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_until_connectable(addr: SocketAddr) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {addr} never came up");
}

async fn connect(addr: SocketAddr) -> LbNodeManagerClient<tonic::transport::Channel> {
    let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .expect("client connect");
    LbNodeManagerClient::new(channel)
}

fn health(status: u32) -> HealthStatus {
    HealthStatus {
        service: "gale-node".to_string(),
        status,
        message: String::new(),
    }
}

/// Opens the `ReportHealthStatus` stream, returning the sender used to feed
/// it and the local socket address tonic assigned this connection (this is
/// the ephemeral port that becomes this session's `NodeKey`).
async fn open_session(
    client: &mut LbNodeManagerClient<tonic::transport::Channel>,
) -> mpsc::Sender<HealthStatus> {
    let (tx, rx) = mpsc::channel(1);
    let outbound = ReceiverStream::new(rx);
    let mut reverse = client
        .report_health_status(Request::new(outbound))
        .await
        .expect("open health stream")
        .into_inner();
    // Drain the (currently unused) reverse half so the stream stays live.
    tokio::spawn(async move { while let Ok(Some(_)) = reverse.message().await {} });
    tx
}

fn test_config(checks_before_routing: u32, checks_timeout: &str, black_list_after_fails: i64) -> LbConfig {
    let mut config = LbConfig::default();
    config.node_health.checks_before_routing = checks_before_routing;
    config.node_health.checks_timeout = checks_timeout.to_string();
    config.node_health.black_list_after_fails = black_list_after_fails;
    config.node_health.black_list_expiry = "60s".to_string();
    config
}

#[tokio::test]
async fn get_config_round_trips_over_the_wire() {
    let config = test_config(3, "2s", -1);
    let server = spawn_server(config.clone()).await;
    let mut client = connect(server.addr).await;

    let resp = client
        .get_config(Request::new(Empty {}))
        .await
        .expect("get_config")
        .into_inner();

    assert_eq!(resp.checks_before_routing, 3);
    assert_eq!(resp.health_check_timeout, Duration::from_secs(2).as_nanos() as i64);
    assert_eq!(resp.black_list_after_fails, -1);
    assert_eq!(
        resp.black_list_expiry,
        Duration::from_secs(60).as_nanos() as i64
    );

    server.stop().await;
}

/// Scenario 1: single-node admission.
#[tokio::test]
async fn single_node_admission() {
    let config = test_config(3, "10s", -1);
    let server = spawn_server(config).await;
    let mut client = connect(server.addr).await;

    let tx = open_session(&mut client).await;
    for _ in 0..3 {
        tx.send(health(STATUS_SERVING)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let nodes = server.state.registry.snapshot();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].admitted);
    assert!(nodes[0].consecutive_healthy >= 3);
    assert_eq!(server.state.ring.len(), VIRTUAL_NODES);

    server.stop().await;
}

/// Scenario 2: timeout eviction.
#[tokio::test]
async fn timeout_eviction() {
    let config = test_config(1, "1s", -1);
    let server = spawn_server(config).await;
    let mut client = connect(server.addr).await;

    let tx = open_session(&mut client).await;
    tx.send(health(STATUS_SERVING)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state.ring.len(), VIRTUAL_NODES);

    // Go silent past the 1s deadline; the connection itself stays open.
    tokio::time::sleep(Duration::from_millis(1300)).await;

    assert!(server.state.ring.is_empty());
    assert!(server.state.registry.snapshot().is_empty());

    server.stop().await;
}

/// Scenario 3: graceful shutdown — no error, no blacklist increment.
#[tokio::test]
async fn graceful_shutdown() {
    let config = test_config(1, "10s", 1);
    let server = spawn_server(config).await;
    let mut client = connect(server.addr).await;

    let tx = open_session(&mut client).await;
    tx.send(health(STATUS_SERVING)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state.ring.len(), VIRTUAL_NODES);

    tx.send(health(STATUS_SHUTTING_DOWN)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(server.state.ring.is_empty());
    // `graceful_shutdown_evicts_without_counting_toward_blacklist` in
    // registry.rs covers the failure_count/blacklist side directly — a real
    // reconnect here would get a fresh ephemeral port and thus a fresh
    // NodeKey, so it can't observe whether the old key's counter moved.

    server.stop().await;
}

/// Scenario 4: blacklist activation after repeated admit→timeout cycles for
/// the same `NodeKey`. A real reconnect gets a fresh ephemeral port (a new
/// `NodeKey` per spec §3), so this drives the registry directly — the same
/// component `HealthSession` calls into — to pin a single identity across
/// cycles exactly as the spec's scenario describes.
#[tokio::test]
async fn blacklist_activation_after_repeated_failures() {
    use galelb::registry::{EvictionCause, NodeRegistry};
    use galelb::ring::Ring;

    let ring = Arc::new(Ring::new());
    let forwarder: Arc<dyn ForwarderAdapter> = Arc::new(LoggingForwarder::default());
    let registry = NodeRegistry::new(ring, forwarder, 1, 2, Duration::from_secs(60));

    let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
    let key = NodeKey::new(addr);

    for _ in 0..2 {
        assert!(registry.register(&key));
        registry.on_healthy(&key, addr);
        registry.on_failure(&key, EvictionCause::Failure);
    }

    assert!(!registry.register(&key));
}

/// Scenario 6: dispatcher cancellation against a real server.
#[tokio::test]
async fn dispatcher_runs_then_stops_cleanly() {
    let config = test_config(1, "1s", -1);
    let server = spawn_server(config).await;

    let dispatcher = Arc::new(Dispatcher::new(vec![LbAddress {
        hostname: Some("127.0.0.1".to_string()),
        ip: None,
        port: server.addr.port(),
    }]));

    let run_handle = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.start().await })
    };

    // Let it dial, fetch config, and send at least one report.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(dispatcher.status(), DispatcherStatus::Running);
    assert!(!server.state.registry.snapshot().is_empty());

    dispatcher.stop().expect("stop");
    tokio::time::timeout(Duration::from_secs(2), run_handle)
        .await
        .expect("dispatcher task should join promptly after stop")
        .expect("task join")
        .expect("dispatcher start() should return Ok after a clean stop");

    assert_eq!(dispatcher.status(), DispatcherStatus::Stopped);
    assert!(dispatcher.stop().is_err(), "stop after stop must error");

    let second_run = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.start().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dispatcher.status(), DispatcherStatus::Running);
    dispatcher.stop().expect("second stop");
    tokio::time::timeout(Duration::from_secs(2), second_run)
        .await
        .expect("second dispatcher run should join promptly")
        .expect("task join")
        .expect("second start() should return Ok after a clean stop");

    server.stop().await;
}
