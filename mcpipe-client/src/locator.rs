//! # Node Locator
//!
//! Purpose: Map a key to the node that owns it, over the current working set.
//!
//! ## Design Principles
//! 1. **Rebuilt, Not Patched**: The cluster calls `initialize` with the full
//!    working set every time it changes.
//! 2. **Lock-Free Reads**: The Ketama ring is published through `ArcSwap`, so
//!    routing never waits for a rebuild.
//! 3. **Stable Hashing**: Ring points use a fixed-seed hasher; a key keeps its
//!    owner while that owner stays in the working set.

use std::hash::BuildHasher;
use std::sync::Arc;

use ahash::RandomState;
use arc_swap::ArcSwap;

use crate::node::Node;

/// Virtual points each node contributes to the ring.
pub const POINTS_PER_NODE: usize = 100;

/// Key → node routing strategy.
pub trait NodeLocator: Send + Sync {
    /// Replaces the routing state with `nodes`.
    fn initialize(&self, nodes: &[Arc<Node>]);

    /// Returns the node owning `key`, or `None` when no node is available.
    fn locate(&self, key: &[u8]) -> Option<Arc<Node>>;
}

/// Consistent-hash ring.
pub struct KetamaLocator {
    hasher: RandomState,
    ring: ArcSwap<Vec<(u64, Arc<Node>)>>,
}

impl KetamaLocator {
    pub fn new() -> Self {
        KetamaLocator {
            hasher: RandomState::with_seeds(
                0x6d63_7069_7065_0001,
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
            ),
            ring: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn hash(&self, bytes: &[u8]) -> u64 {
        self.hasher.hash_one(bytes)
    }
}

impl Default for KetamaLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLocator for KetamaLocator {
    fn initialize(&self, nodes: &[Arc<Node>]) {
        let mut ring = Vec::with_capacity(nodes.len() * POINTS_PER_NODE);
        for node in nodes {
            for point in 0..POINTS_PER_NODE {
                let label = format!("{}-{}", node.endpoint(), point);
                ring.push((self.hash(label.as_bytes()), Arc::clone(node)));
            }
        }
        ring.sort_unstable_by_key(|(hash, _)| *hash);
        self.ring.store(Arc::new(ring));
    }

    fn locate(&self, key: &[u8]) -> Option<Arc<Node>> {
        let ring = self.ring.load();
        if ring.is_empty() {
            return None;
        }

        let hash = self.hash(key);
        let index = ring.partition_point(|(point, _)| *point < hash);
        let (_, node) = &ring[index % ring.len()];
        Some(Arc::clone(node))
    }
}

/// Routes every key to the first node; for single-server clusters.
pub struct SingleNodeLocator {
    node: ArcSwap<Option<Arc<Node>>>,
}

impl SingleNodeLocator {
    pub fn new() -> Self {
        SingleNodeLocator {
            node: ArcSwap::from_pointee(None),
        }
    }
}

impl NodeLocator for SingleNodeLocator {
    fn initialize(&self, nodes: &[Arc<Node>]) {
        self.node.store(Arc::new(nodes.first().cloned()));
    }

    fn locate(&self, _key: &[u8]) -> Option<Arc<Node>> {
        let node = self.node.load();
        Option::clone(&node)
    }
}

impl Default for SingleNodeLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use super::*;
    use crate::node::tests::node_at;

    fn nodes(count: usize) -> Vec<Arc<Node>> {
        (0..count)
            .map(|i| node_at(format!("10.0.0.{}:11211", i + 1).parse().unwrap()).0)
            .collect()
    }

    #[test]
    fn empty_ring_locates_nothing() {
        let locator = KetamaLocator::new();
        assert!(locator.locate(b"key").is_none());
        locator.initialize(&[]);
        assert!(locator.locate(b"key").is_none());
    }

    #[test]
    fn locate_is_deterministic_and_spread() {
        let nodes = nodes(3);
        let locator = KetamaLocator::new();
        locator.initialize(&nodes);

        let mut owners: HashMap<SocketAddr, usize> = HashMap::new();
        for i in 0..3000 {
            let key = format!("key-{i}");
            let first = locator.locate(key.as_bytes()).unwrap();
            let second = locator.locate(key.as_bytes()).unwrap();
            assert!(Arc::ptr_eq(&first, &second));
            *owners.entry(first.endpoint()).or_default() += 1;
        }

        assert_eq!(owners.len(), 3);
        for count in owners.values() {
            assert!(*count > 300, "unbalanced ring: {owners:?}");
        }
    }

    #[test]
    fn removing_a_node_only_moves_its_keys() {
        let nodes = nodes(3);
        let locator = KetamaLocator::new();
        locator.initialize(&nodes);

        let keys: Vec<String> = (0..500).map(|i| format!("k{i}")).collect();
        let before: Vec<SocketAddr> = keys
            .iter()
            .map(|k| locator.locate(k.as_bytes()).unwrap().endpoint())
            .collect();

        let removed = nodes[1].endpoint();
        locator.initialize(&[nodes[0].clone(), nodes[2].clone()]);
        for (key, owner) in keys.iter().zip(before) {
            let now = locator.locate(key.as_bytes()).unwrap().endpoint();
            assert_ne!(now, removed);
            if owner != removed {
                assert_eq!(now, owner);
            }
        }
    }

    #[test]
    fn single_node_locator() {
        let nodes = nodes(2);
        let locator = SingleNodeLocator::new();
        assert!(locator.locate(b"a").is_none());
        locator.initialize(&nodes);
        assert!(Arc::ptr_eq(&locator.locate(b"a").unwrap(), &nodes[0]));
        assert!(Arc::ptr_eq(&locator.locate(b"zzz").unwrap(), &nodes[0]));
    }
}
