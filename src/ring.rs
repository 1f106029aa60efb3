use std::sync::Mutex;

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::registry::NodeKey;

/// Number of virtual-node labels contributed per `NodeKey`.
pub const VIRTUAL_NODES: usize = 5;

fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Immutable snapshot readers consult lock-free. Sorted ascending by hash.
struct RingSnapshot {
    entries: Vec<(u32, NodeKey)>,
}

impl RingSnapshot {
    fn empty() -> Self {
        Self { entries: Vec::new() }
    }
}

/// Consistent-hash ring with virtual nodes.
///
/// Writers (`add`/`remove`) serialize through `write_lock`, rebuild a fresh
/// `RingSnapshot`, and publish it with `ArcSwap::store`. Readers (`lookup`)
/// never take a lock — they load the current snapshot, which is always
/// fully formed, never partially updated.
pub struct Ring {
    snapshot: ArcSwap<RingSnapshot>,
    write_lock: Mutex<()>,
}

impl Ring {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RingSnapshot::empty()),
            write_lock: Mutex::new(()),
        }
    }

    /// Insert `V` virtual-node hashes for `key`. Idempotent: re-adding a
    /// key already present in the ring is a no-op.
    pub fn add(&self, key: &NodeKey) {
        let _guard = self.write_lock.lock().unwrap();
        let current = self.snapshot.load();

        if current.entries.iter().any(|(_, k)| k == key) {
            return;
        }

        let mut entries = current.entries.clone();
        for i in 0..VIRTUAL_NODES {
            let label = format!("{key}-{i}");
            let hash = crc32(label.as_bytes());
            // last writer wins within this add: remove any prior collision
            // before pushing, so insertion order decides the final owner.
            entries.retain(|(h, _)| *h != hash);
            entries.push((hash, key.clone()));
        }
        entries.sort_by_key(|(hash, _)| *hash);

        self.snapshot.store(Arc::new(RingSnapshot { entries }));
    }

    /// Remove all virtual-node hashes for `key`. Idempotent.
    pub fn remove(&self, key: &NodeKey) {
        let _guard = self.write_lock.lock().unwrap();
        let current = self.snapshot.load();

        if !current.entries.iter().any(|(_, k)| k == key) {
            return;
        }

        let entries: Vec<(u32, NodeKey)> = current
            .entries
            .iter()
            .filter(|(_, k)| k != key)
            .cloned()
            .collect();

        self.snapshot.store(Arc::new(RingSnapshot { entries }));
    }

    /// Hash `request_key`, binary-search for the smallest ring hash greater
    /// than or equal to it, wrapping to index 0 if none exists. `None` iff
    /// the ring is empty.
    pub fn lookup(&self, request_key: &[u8]) -> Option<NodeKey> {
        let snapshot = self.snapshot.load();
        if snapshot.entries.is_empty() {
            return None;
        }

        let hash = crc32(request_key);
        let idx = match snapshot.entries.binary_search_by_key(&hash, |(h, _)| *h) {
            Ok(i) => i,
            Err(i) => i,
        };
        let idx = if idx == snapshot.entries.len() { 0 } else { idx };
        Some(snapshot.entries[idx].1.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn empty_ring_returns_none() {
        let ring = Ring::new();
        assert_eq!(ring.lookup(b"anything"), None);
    }

    #[test]
    fn add_is_idempotent() {
        let ring = Ring::new();
        let k = key("10.0.0.1:9001");
        ring.add(&k);
        let len_after_first = ring.len();
        ring.add(&k);
        assert_eq!(ring.len(), len_after_first);
        assert_eq!(ring.len(), VIRTUAL_NODES);
    }

    #[test]
    fn remove_is_idempotent() {
        let ring = Ring::new();
        let k = key("10.0.0.1:9001");
        ring.add(&k);
        ring.remove(&k);
        assert!(ring.is_empty());
        ring.remove(&k);
        assert!(ring.is_empty());
    }

    #[test]
    fn add_then_remove_returns_to_lookup_equivalent_state() {
        let ring = Ring::new();
        let a = key("10.0.0.1:9001");
        let b = key("10.0.0.2:9002");
        ring.add(&a);
        let baseline: Vec<_> = (0..50)
            .map(|i| ring.lookup(format!("req-{i}").as_bytes()))
            .collect();

        ring.add(&b);
        ring.remove(&b);

        let after: Vec<_> = (0..50)
            .map(|i| ring.lookup(format!("req-{i}").as_bytes()))
            .collect();
        assert_eq!(baseline, after);
    }

    #[test]
    fn determinism_independent_of_insertion_order() {
        let nodes = ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"];

        let ring_a = Ring::new();
        for n in &nodes {
            ring_a.add(&key(n));
        }

        let ring_b = Ring::new();
        for n in nodes.iter().rev() {
            ring_b.add(&key(n));
        }

        for i in 10..15 {
            let req = format!("113.168.1.{i}");
            assert_eq!(
                ring_a.lookup(req.as_bytes()),
                ring_b.lookup(req.as_bytes()),
                "request key {req} mapped to different nodes"
            );
        }
    }

    #[test]
    fn monotonic_remap_bounded() {
        let base_nodes: Vec<NodeKey> = (0..20)
            .map(|i| key(&format!("10.0.{i}.1:9000")))
            .collect();

        let ring = Ring::new();
        for n in &base_nodes {
            ring.add(n);
        }

        let requests: Vec<String> = (0..2000).map(|i| format!("client-{i}")).collect();
        let before: Vec<Option<NodeKey>> = requests.iter().map(|r| ring.lookup(r.as_bytes())).collect();

        let extra = key("10.0.99.1:9000");
        ring.add(&extra);

        let after: Vec<Option<NodeKey>> = requests.iter().map(|r| ring.lookup(r.as_bytes())).collect();

        let changed = before.iter().zip(after.iter()).filter(|(a, b)| a != b).count();
        let n = base_nodes.len() as f64;
        let expected = requests.len() as f64 / (n + 1.0);
        // generous tolerance: remap should stay within ~3x the expected 1/N share
        assert!(
            (changed as f64) < expected * 3.0,
            "remapped {changed} of {}, expected around {expected}",
            requests.len()
        );
    }
}
