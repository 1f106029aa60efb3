use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::LbConfig;
use crate::forwarder::ForwarderAdapter;
use crate::metrics::Metrics;
use crate::registry::NodeRegistry;
use crate::ring::Ring;

/// Shared LB-side state, cheaply cloneable. Holds the ring, the registry
/// built on top of it, and the current config snapshot the introspection
/// API and control server both read from.
#[derive(Clone)]
pub struct LbState {
    pub config: Arc<ArcSwap<LbConfig>>,
    pub metrics: Metrics,
    pub ring: Arc<Ring>,
    pub registry: Arc<NodeRegistry>,
}

impl LbState {
    pub fn new(config: LbConfig, forwarder: Arc<dyn ForwarderAdapter>) -> anyhow::Result<Self> {
        let ring = Arc::new(Ring::new());
        let registry = Arc::new(NodeRegistry::new(
            ring.clone(),
            forwarder,
            config.node_health.checks_before_routing,
            config.node_health.black_list_after_fails,
            config.node_health.black_list_expiry_duration()?,
        ));
        let metrics = Metrics::install();
        metrics::gauge!("gale_ring_size").set(0.0);
        metrics::gauge!("gale_nodes_admitted").set(0.0);
        metrics::gauge!("gale_blacklist_size").set(0.0);

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            ring,
            registry,
        })
    }
}
