use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`)
/// can be used anywhere in the codebase. The `PrometheusHandle` is retained
/// solely for rendering the `/metrics` endpoint on the introspection API.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

impl Metrics {
    /// Installs the global Prometheus recorder and registers metric
    /// descriptions the first time it's called; later calls (multiple
    /// `LbState`s in the same process, as in integration tests) just hand
    /// back the same handle instead of panicking on a double-install.
    pub fn install() -> Self {
        let handle = HANDLE.get_or_init(install_once).clone();
        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn install_once() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");

    describe_gauge!(
        "gale_ring_size",
        Unit::Count,
        "Number of virtual-node entries currently in the hash ring"
    );
    describe_gauge!(
        "gale_nodes_admitted",
        Unit::Count,
        "Number of backend nodes currently admitted to the ring"
    );
    describe_counter!(
        "gale_nodes_admitted_total",
        Unit::Count,
        "Total AdmitEvent transitions observed"
    );
    describe_counter!(
        "gale_nodes_evicted_total",
        Unit::Count,
        "Total EvictEvent transitions observed"
    );
    describe_gauge!(
        "gale_blacklist_size",
        Unit::Count,
        "Number of node keys currently blacklisted"
    );
    describe_counter!(
        "gale_health_reports_total",
        Unit::Count,
        "Total HealthMessage reports received, by status"
    );
    describe_gauge!(
        "gale_sessions_active",
        Unit::Count,
        "Number of live control-plane sessions"
    );
    describe_counter!(
        "gale_dispatcher_reports_total",
        Unit::Count,
        "Total health reports sent by the node-side dispatcher, by result"
    );

    handle
}
