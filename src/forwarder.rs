use std::net::SocketAddr;

use crate::registry::NodeKey;

/// Contract with the external fast-path program: an in-kernel DNAT/SNAT
/// rewriter attached to the public and private interfaces, out of scope for
/// this crate. Between `install` and `evict`, the adapter is expected to
/// rewrite data-plane lookups for `node_key` to `addr` with
/// at-most-once-per-flow destination stability.
pub trait ForwarderAdapter: Send + Sync {
    fn install(&self, node_key: &NodeKey, addr: SocketAddr);
    fn evict(&self, node_key: &NodeKey);
}

/// Default adapter: logs and meters the calls it would otherwise forward to
/// the fast-path program. Used until a real XDP/eBPF integration exists.
#[derive(Default)]
pub struct LoggingForwarder;

impl ForwarderAdapter for LoggingForwarder {
    fn install(&self, node_key: &NodeKey, addr: SocketAddr) {
        tracing::info!(node_key = %node_key, %addr, "forwarder: install");
    }

    fn evict(&self, node_key: &NodeKey) {
        tracing::info!(node_key = %node_key, "forwarder: evict");
    }
}
