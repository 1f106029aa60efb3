use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Status, Streaming};

use crate::error::GaleError;
use crate::pb::HealthStatus;
use crate::registry::{EvictionCause, NodeKey, NodeRegistry};

const STATUS_SERVING: i32 = 0;
const STATUS_NOT_SERVING: i32 = 1;
const STATUS_SHUTTING_DOWN: i32 = 2;

/// Terminal state a `HealthSession` can end in. All but `Reporting` (the
/// implicit non-terminal running state) are terminal, per spec §4.3.
/// `Cancelled` is not one of the spec's per-message states — it is the
/// server-shutdown path from spec §5: "every session honors a cancellation
/// signal propagated from the server shutdown... on cancellation, the
/// session runs purge before returning."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    ShuttingDown,
    Evicted,
    StreamClosed,
    Cancelled,
}

enum RecvEvent {
    Message(HealthStatus),
    Error(Status),
    Closed,
}

/// Returns true for transport errors that cannot be recovered from within
/// the stream — the session must terminate (spec §4.3, §7).
fn is_unrecoverable(status: &Status) -> bool {
    matches!(status.code(), tonic::Code::Cancelled | tonic::Code::Unavailable)
}

fn status_label(status: i32) -> &'static str {
    match status {
        STATUS_SERVING => "serving",
        STATUS_NOT_SERVING => "not_serving",
        STATUS_SHUTTING_DOWN => "shutting_down",
        _ => "unknown",
    }
}

/// Runs one `HealthSession` to completion: consumes the inbound stream,
/// drives `NodeRegistry` transitions, and returns once the session reaches
/// a terminal state. The receive path runs in its own task, handed to the
/// decision loop through a single-slot (`depth 1`) channel so at most one
/// message is ever in flight and none are reordered (spec §5, §9).
///
/// `cancel` is the server's shutdown token — it is raced against the
/// receive path and the deadline timer on every iteration, so cancellation
/// is observable at every suspension point inside the loop (spec §5).
pub async fn run(
    key: NodeKey,
    peer_addr: SocketAddr,
    mut inbound: Streaming<HealthStatus>,
    registry: Arc<NodeRegistry>,
    health_check_timeout: Duration,
    cancel: CancellationToken,
    // Held for the session's lifetime only to keep the reverse half of the
    // bidirectional stream open; the core never sends on it (spec §4.4's
    // reserved backward-adapter slot).
    _reverse_channel: mpsc::Sender<Result<HealthStatus, Status>>,
) -> SessionOutcome {
    let (tx, mut rx) = mpsc::channel::<RecvEvent>(1);

    let recv_task = tokio::spawn(async move {
        loop {
            let event = match inbound.message().await {
                Ok(Some(msg)) => RecvEvent::Message(msg),
                Ok(None) => RecvEvent::Closed,
                Err(status) => RecvEvent::Error(status),
            };
            let is_terminal = matches!(event, RecvEvent::Closed | RecvEvent::Error(_));
            if tx.send(event).await.is_err() || is_terminal {
                return;
            }
        }
    });

    let deadline = tokio::time::sleep(health_check_timeout);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break SessionOutcome::Cancelled;
            }
            event = rx.recv() => {
                match event {
                    Some(RecvEvent::Message(health)) => {
                        metrics::counter!(
                            "gale_health_reports_total",
                            "status" => status_label(health.status as i32)
                        )
                        .increment(1);
                        match health.status as i32 {
                        STATUS_SERVING => {
                            registry.on_healthy(&key, peer_addr);
                            deadline.as_mut().reset(
                                tokio::time::Instant::now() + health_check_timeout,
                            );
                        }
                        STATUS_NOT_SERVING => {
                            // Failure tick: reset the counter and evict if
                            // admitted, but do not restart the deadline — a
                            // silent backend should still time out.
                            registry.on_failure(&key, EvictionCause::Failure);
                        }
                        STATUS_SHUTTING_DOWN => {
                            registry.on_failure(&key, EvictionCause::Shutdown);
                            let err = GaleError::ShuttingDown;
                            tracing::info!(node_key = %key, reason = %err, "control: session shutting down");
                            break SessionOutcome::ShuttingDown;
                        }
                        other => {
                            let err = GaleError::Internal(format!("unknown health status {other}"));
                            tracing::warn!(node_key = %key, error = %err, "control: ignoring malformed report");
                        }
                        }
                    },
                    Some(RecvEvent::Error(status)) => {
                        if is_unrecoverable(&status) {
                            let err = GaleError::TransportUnrecoverable(status.to_string());
                            tracing::warn!(node_key = %key, error = %err, "control: session terminating");
                            registry.on_failure(&key, EvictionCause::Failure);
                            break SessionOutcome::StreamClosed;
                        }
                        let err = GaleError::TransportRecoverable(status.to_string());
                        tracing::warn!(node_key = %key, error = %err, "control: continuing session");
                    }
                    Some(RecvEvent::Closed) | None => {
                        let err = GaleError::TransportUnrecoverable("stream closed by peer".to_string());
                        tracing::warn!(node_key = %key, error = %err, "control: session terminating");
                        registry.on_failure(&key, EvictionCause::Failure);
                        break SessionOutcome::StreamClosed;
                    }
                }
            }
            _ = &mut deadline => {
                let err = GaleError::Timeout;
                tracing::warn!(node_key = %key, error = %err, "control: session terminating");
                registry.on_failure(&key, EvictionCause::Failure);
                break SessionOutcome::Evicted;
            }
        }
    };

    recv_task.abort();
    registry.purge(&key);
    metrics::gauge!("gale_sessions_active").decrement(1.0);
    tracing::info!(node_key = %key, outcome = ?outcome, "control: session terminated");
    outcome
}
