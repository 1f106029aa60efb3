use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::forwarder::ForwarderAdapter;
use crate::ring::Ring;

/// Session identity: the remote transport endpoint as observed by the LB.
/// A reconnecting backend gets a fresh ephemeral port and therefore a fresh
/// `NodeKey` — this type never incorporates the ARP-resolved MAC, which is
/// informational only (spec requirement).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-`NodeKey` health bookkeeping. Mutated only by the owning session task.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub consecutive_healthy: u32,
    pub last_report_at: Instant,
    pub admitted: bool,
    pub failure_count: u64,
}

impl NodeState {
    fn fresh() -> Self {
        Self {
            consecutive_healthy: 0,
            last_report_at: Instant::now(),
            admitted: false,
            failure_count: 0,
        }
    }
}

/// Introspection DTO for `GET /nodes` and `GET /nodes/:id`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeSummary {
    pub key: String,
    pub admitted: bool,
    pub consecutive_healthy: u32,
    pub last_report_at: String,
    pub failure_count: u64,
}

/// Outcome of a registry mutation — used by callers (HealthSession) to log
/// and by the introspection layer; the registry itself already applied the
/// ring/forwarder side effects before returning one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Admitted,
    Evicted,
    NoChange,
}

/// Why a session is reporting a failure tick, passed to `on_failure`.
///
/// `ShuttingDown` is an orderly exit (spec §7's Protocol error kind): it
/// still evicts the node from the ring like any other failure, but must
/// not count against `failure_count` or trigger blacklist policy (spec §8
/// scenario 3). Every other path — `NotServing`, timeout, and unrecoverable
/// transport errors — is a real failure and counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    Failure,
    Shutdown,
}

struct Blacklist {
    banned_until: DashMap<NodeKey, Instant>,
}

impl Blacklist {
    fn new() -> Self {
        Self {
            banned_until: DashMap::new(),
        }
    }

    /// Entries expire lazily on lookup — an expired entry is removed and
    /// treated as not-banned.
    fn is_banned(&self, key: &NodeKey) -> bool {
        let Some(entry) = self.banned_until.get(key) else {
            return false;
        };
        let until = *entry;
        drop(entry);
        if Instant::now() < until {
            true
        } else {
            self.banned_until.remove(key);
            false
        }
    }

    fn ban(&self, key: NodeKey, until: Instant) {
        self.banned_until.insert(key, until);
    }

    fn len(&self) -> usize {
        self.banned_until.len()
    }
}

/// In-memory map of backend sessions, their health counters, and the
/// blacklist, coupled to the `Ring` and `ForwarderAdapter` it drives.
///
/// Operations are serialized through a single coarse lock — the registry is
/// not on the packet-forwarding path, so lock granularity favors simplicity
/// over throughput (spec §5).
pub struct NodeRegistry {
    nodes: Mutex<std::collections::HashMap<NodeKey, NodeState>>,
    blacklist: Blacklist,
    ring: std::sync::Arc<Ring>,
    forwarder: std::sync::Arc<dyn ForwarderAdapter>,
    checks_before_routing: u32,
    blacklist_after_fails: i64,
    blacklist_expiry: Duration,
}

impl NodeRegistry {
    pub fn new(
        ring: std::sync::Arc<Ring>,
        forwarder: std::sync::Arc<dyn ForwarderAdapter>,
        checks_before_routing: u32,
        blacklist_after_fails: i64,
        blacklist_expiry: Duration,
    ) -> Self {
        Self {
            nodes: Mutex::new(std::collections::HashMap::new()),
            blacklist: Blacklist::new(),
            ring,
            forwarder,
            checks_before_routing,
            blacklist_after_fails,
            blacklist_expiry,
        }
    }

    /// Registers a fresh session if `key` is absent and not blacklisted.
    /// Returns `true` if the caller should proceed (not blacklisted).
    pub fn register(&self, key: &NodeKey) -> bool {
        if self.blacklist.is_banned(key) {
            tracing::warn!(node_key = %key, "registry: refusing blacklisted node");
            return false;
        }
        let mut nodes = self.nodes.lock().unwrap();
        nodes.entry(key.clone()).or_insert_with(NodeState::fresh);
        true
    }

    /// Records a `Serving` report. Admits the node if `consecutive_healthy`
    /// just crossed `checks_before_routing` (edge-triggered, exactly once
    /// per contiguous healthy run).
    pub fn on_healthy(&self, key: &NodeKey, addr: SocketAddr) -> RegistryEvent {
        let mut nodes = self.nodes.lock().unwrap();
        let state = nodes.entry(key.clone()).or_insert_with(NodeState::fresh);

        state.consecutive_healthy += 1;
        state.last_report_at = Instant::now();

        if !state.admitted && state.consecutive_healthy >= self.checks_before_routing {
            state.admitted = true;
            drop(nodes);

            self.ring.add(key);
            self.forwarder.install(key, addr);
            metrics::counter!("gale_nodes_admitted_total").increment(1);
            metrics::gauge!("gale_ring_size").set(self.ring.len() as f64);
            metrics::gauge!("gale_nodes_admitted").increment(1.0);
            tracing::info!(node_key = %key, "registry: node admitted");
            return RegistryEvent::Admitted;
        }

        RegistryEvent::NoChange
    }

    /// Records a failure tick: reset `consecutive_healthy`; if the node was
    /// admitted, evict it. `cause` decides whether this counts against
    /// `failure_count`/blacklist policy: a graceful `Shutdown` evicts without
    /// counting, everything else does (spec §7, §8 scenario 3).
    pub fn on_failure(&self, key: &NodeKey, cause: EvictionCause) -> RegistryEvent {
        let mut nodes = self.nodes.lock().unwrap();
        let Some(state) = nodes.get_mut(key) else {
            // Spec §7's "internal invariant violation" kind: a session only
            // ever calls on_failure for a key it registered itself, so a
            // missing entry here means purge/registry state diverged from
            // the session's view. Log and let the caller terminate the
            // session defensively rather than panicking.
            let err = crate::error::GaleError::InvariantViolation(format!(
                "on_failure called for unregistered key {key}"
            ));
            tracing::error!(node_key = %key, error = %err, "registry: invariant violation");
            return RegistryEvent::NoChange;
        };

        state.consecutive_healthy = 0;

        if !state.admitted {
            return RegistryEvent::NoChange;
        }

        state.admitted = false;
        let failure_count = if cause == EvictionCause::Failure {
            state.failure_count += 1;
            Some(state.failure_count)
        } else {
            None
        };
        drop(nodes);

        self.ring.remove(key);
        self.forwarder.evict(key);
        metrics::counter!("gale_nodes_evicted_total").increment(1);
        metrics::gauge!("gale_ring_size").set(self.ring.len() as f64);
        metrics::gauge!("gale_nodes_admitted").decrement(1.0);
        tracing::info!(node_key = %key, ?cause, "registry: node evicted");

        if let Some(failure_count) = failure_count {
            if self.blacklist_after_fails >= 0 && failure_count as i64 >= self.blacklist_after_fails {
                let until = Instant::now() + self.blacklist_expiry;
                self.blacklist.ban(key.clone(), until);
                metrics::gauge!("gale_blacklist_size").set(self.blacklist.len() as f64);
                tracing::warn!(node_key = %key, "registry: node blacklisted");
            }
        }

        RegistryEvent::Evicted
    }

    /// Called when a session terminates; drops the `NodeState` if the node
    /// is not currently admitted (admitted nodes keep their state so the
    /// ring and the registry stay consistent until an explicit eviction).
    pub fn purge(&self, key: &NodeKey) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(state) = nodes.get(key) {
            if !state.admitted {
                nodes.remove(key);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NodeSummary> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .map(|(key, state)| to_summary(key, state))
            .collect()
    }

    pub fn get(&self, key: &NodeKey) -> Option<NodeSummary> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(key).map(|state| to_summary(key, state))
    }
}

fn to_summary(key: &NodeKey, state: &NodeState) -> NodeSummary {
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(state.last_report_at);
    let last_report_at = humantime::format_rfc3339_seconds(
        std::time::SystemTime::now() - elapsed,
    )
    .to_string();

    NodeSummary {
        key: key.as_str().to_string(),
        admitted: state.admitted,
        consecutive_healthy: state.consecutive_healthy,
        last_report_at,
        failure_count: state.failure_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::LoggingForwarder;

    fn new_registry(checks: u32, blacklist_after: i64, blacklist_expiry: Duration) -> NodeRegistry {
        let ring = std::sync::Arc::new(Ring::new());
        let forwarder = std::sync::Arc::new(LoggingForwarder::default());
        NodeRegistry::new(ring, forwarder, checks, blacklist_after, blacklist_expiry)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn admission_is_edge_triggered() {
        let registry = new_registry(3, -1, Duration::from_secs(60));
        let key = NodeKey::new(addr());
        assert!(registry.register(&key));

        assert_eq!(registry.on_healthy(&key, addr()), RegistryEvent::NoChange);
        assert_eq!(registry.on_healthy(&key, addr()), RegistryEvent::NoChange);
        assert_eq!(registry.on_healthy(&key, addr()), RegistryEvent::Admitted);
        // A fourth healthy report must not re-fire Admitted.
        assert_eq!(registry.on_healthy(&key, addr()), RegistryEvent::NoChange);
    }

    #[test]
    fn failure_evicts_an_admitted_node() {
        let registry = new_registry(1, -1, Duration::from_secs(60));
        let key = NodeKey::new(addr());
        registry.register(&key);
        registry.on_healthy(&key, addr());
        assert_eq!(
            registry.on_failure(&key, EvictionCause::Failure),
            RegistryEvent::Evicted
        );
        assert!(registry.get(&key).map(|s| !s.admitted).unwrap_or(true));
    }

    #[test]
    fn blacklist_refuses_registration_while_banned() {
        let registry = new_registry(1, 2, Duration::from_secs(60));
        let key = NodeKey::new(addr());

        for _ in 0..2 {
            registry.register(&key);
            registry.on_healthy(&key, addr());
            registry.on_failure(&key, EvictionCause::Failure);
        }

        assert!(!registry.register(&key));
    }

    #[test]
    fn graceful_shutdown_evicts_without_counting_toward_blacklist() {
        // spec §7/§8 scenario 3: ShuttingDown evicts like any failure but
        // must not increment failure_count or trigger blacklist policy.
        let registry = new_registry(1, 1, Duration::from_secs(60));
        let key = NodeKey::new(addr());
        registry.register(&key);
        registry.on_healthy(&key, addr());

        assert_eq!(
            registry.on_failure(&key, EvictionCause::Shutdown),
            RegistryEvent::Evicted
        );
        assert_eq!(registry.get(&key).unwrap().failure_count, 0);

        // Immediately re-registering must succeed — a single blacklist
        // threshold of 1 would have refused it had failure_count bumped.
        assert!(registry.register(&key));
    }

    #[test]
    fn purge_drops_unadmitted_sessions_only() {
        let registry = new_registry(3, -1, Duration::from_secs(60));
        let key = NodeKey::new(addr());
        registry.register(&key);
        registry.on_healthy(&key, addr());
        registry.purge(&key);
        assert!(registry.get(&key).is_none());
    }

    #[test]
    fn purge_keeps_admitted_sessions() {
        let registry = new_registry(1, -1, Duration::from_secs(60));
        let key = NodeKey::new(addr());
        registry.register(&key);
        registry.on_healthy(&key, addr());
        registry.purge(&key);
        assert!(registry.get(&key).is_some());
    }
}
