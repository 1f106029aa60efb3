use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;

use crate::config::LbAddress;
use crate::pb::lb_node_manager_client::LbNodeManagerClient;
use crate::pb::{Empty, HealthStatus};

const GET_CONFIG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherStatus {
    Stopped,
    Running,
}

struct State {
    status: DispatcherStatus,
    cancel: Option<CancellationToken>,
}

/// Node-side agent: one long-lived connection per configured LB target.
///
/// `start` does not return until every target task has finished (either
/// because `stop` was called, or because a target failed during its initial
/// dial/`GetConfig` handshake). Every target task carries its own
/// `CancellationToken`, observable at every suspension point, so `stop`
/// always has somewhere to signal.
pub struct Dispatcher {
    targets: Vec<LbAddress>,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(targets: Vec<LbAddress>) -> Self {
        Self {
            targets,
            state: Mutex::new(State {
                status: DispatcherStatus::Stopped,
                cancel: None,
            }),
        }
    }

    /// Dials every target, fetches its execution config, then runs the
    /// periodic health-reporting loop until cancelled. Returns an error
    /// (without retrying) if any target fails its initial handshake —
    /// operators should see misconfiguration immediately rather than have
    /// it silently retried away.
    pub async fn start(&self) -> anyhow::Result<()> {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            if state.status == DispatcherStatus::Running {
                anyhow::bail!("dispatcher already running");
            }
            let token = CancellationToken::new();
            state.status = DispatcherStatus::Running;
            state.cancel = Some(token.clone());
            token
        };

        let mut tasks = tokio::task::JoinSet::new();
        for target in self.targets.clone() {
            let cancel = cancel.clone();
            tasks.spawn(async move { run_target(target, cancel).await });
        }

        let mut startup_error: Option<anyhow::Error> = None;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("dispatcher: target task failed: {e}");
                    startup_error.get_or_insert(e);
                    cancel.cancel();
                }
                Err(e) => {
                    tracing::error!("dispatcher: target task panicked: {e}");
                    startup_error.get_or_insert(anyhow::anyhow!("target task panicked: {e}"));
                    cancel.cancel();
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.status = DispatcherStatus::Stopped;
            state.cancel = None;
        }

        match startup_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancels all running target tasks. `start()` will return once they
    /// drain. Returns an error if the dispatcher is already stopped.
    pub fn stop(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.status == DispatcherStatus::Stopped {
            anyhow::bail!("dispatcher already stopped");
        }
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        Ok(())
    }

    pub fn status(&self) -> DispatcherStatus {
        self.state.lock().unwrap().status
    }
}

async fn run_target(target: LbAddress, cancel: CancellationToken) -> anyhow::Result<()> {
    let dial_target = target.dial_target()?;
    tracing::info!(target = %dial_target, "dispatcher: dialing");

    let channel = tonic::transport::Endpoint::from_shared(dial_target.clone())?
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("dial failed for {dial_target}: {e}"))?;
    let mut client = LbNodeManagerClient::new(channel);

    let config = tokio::time::timeout(GET_CONFIG_TIMEOUT, client.get_config(Request::new(Empty {})))
        .await
        .map_err(|_| anyhow::anyhow!("get_config timed out for {dial_target}"))?
        .map_err(|e| anyhow::anyhow!("get_config failed for {dial_target}: {e}"))?
        .into_inner();

    let health_check_timeout = Duration::from_nanos(config.health_check_timeout.max(0) as u64);
    let health_period = (health_check_timeout / 2).max(Duration::from_millis(1));

    let (tx, rx) = mpsc::channel::<HealthStatus>(1);
    let outbound = ReceiverStream::new(rx);
    let mut reverse = client
        .report_health_status(Request::new(outbound))
        .await
        .map_err(|e| anyhow::anyhow!("opening health stream failed for {dial_target}: {e}"))?
        .into_inner();

    // Drain (but ignore) the reverse direction — reserved for future
    // admin-initiated use, carries nothing from the LB today.
    tokio::spawn(async move { while let Ok(Some(_)) = reverse.message().await {} });

    let mut ticker = tokio::time::interval(health_period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(target = %dial_target, "dispatcher: target cancelled");
                return Ok(());
            }
            _ = ticker.tick() => {
                let msg = HealthStatus {
                    service: "gale-node".to_string(),
                    status: 0, // Serving
                    message: "serving".to_string(),
                };
                match tokio::time::timeout(health_check_timeout, tx.send(msg)).await {
                    Ok(Ok(())) => {
                        metrics::counter!("gale_dispatcher_reports_total", "result" => "ok").increment(1);
                    }
                    Ok(Err(_)) => {
                        tracing::error!(target = %dial_target, "dispatcher: report channel closed");
                        metrics::counter!("gale_dispatcher_reports_total", "result" => "error").increment(1);
                    }
                    Err(_) => {
                        tracing::error!(target = %dial_target, "dispatcher: report send timed out");
                        metrics::counter!("gale_dispatcher_reports_total", "result" => "timeout").increment(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_dispatcher_starts_stopped() {
        let d = Dispatcher::new(vec![]);
        assert_eq!(d.status(), DispatcherStatus::Stopped);
    }

    #[test]
    fn stop_before_start_is_an_error() {
        let d = Dispatcher::new(vec![]);
        assert!(d.stop().is_err());
    }

    #[tokio::test]
    async fn start_with_no_targets_returns_immediately() {
        let d = Dispatcher::new(vec![]);
        d.start().await.unwrap();
        assert_eq!(d.status(), DispatcherStatus::Stopped);
    }
}
