//! Consistent hash ring for graph partition placement
//!
//! Each physical partition contributes a fixed number of virtual nodes so
//! key placement stays uniform. The ring is built once at startup and is
//! immutable afterwards: rebuilding it implies rebalancing stored data,
//! which is out of scope, so readers never need a lock.
//!
//! Placement for a key walks the ring clockwise from `hash(key)` and
//! collects the first `replication` *distinct* physical partitions. The
//! walk is deterministic: the same key always resolves to the same
//! partition set.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A single placement result: the partition set owning a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    /// Key the placement was computed for
    pub key: String,
    /// Physical partition indices, primary first
    pub partitions: Vec<usize>,
    /// Logical namespaces for those partitions, same order
    pub namespaces: Vec<String>,
}

impl ShardPlacement {
    /// Primary partition index
    pub fn primary(&self) -> usize {
        self.partitions[0]
    }

    /// Quorum size for this placement (majority of assigned partitions)
    pub fn quorum(&self) -> usize {
        self.partitions.len() / 2 + 1
    }

    /// Whether another placement shares at least one partition
    pub fn overlaps(&self, other: &ShardPlacement) -> bool {
        self.partitions.iter().any(|p| other.partitions.contains(p))
    }

    /// First partition shared with another placement, if any
    pub fn shared_partition(&self, other: &ShardPlacement) -> Option<usize> {
        self.partitions
            .iter()
            .copied()
            .find(|p| other.partitions.contains(p))
    }
}

/// Immutable consistent hash ring
#[derive(Debug)]
pub struct HashRing {
    /// hash point -> physical partition index
    ring: BTreeMap<u64, usize>,
    partition_count: usize,
    replication: usize,
}

impl HashRing {
    /// Build the ring for `partition_count` physical partitions with
    /// `virtual_nodes` points each.
    pub fn new(partition_count: usize, virtual_nodes: usize, replication: usize) -> Self {
        assert!(partition_count > 0, "ring needs at least one partition");
        let replication = replication.clamp(1, partition_count);

        let mut ring = BTreeMap::new();
        for partition in 0..partition_count {
            for vnode in 0..virtual_nodes {
                let point = hash_key(&format!("partition-{partition}#vnode-{vnode}"));
                ring.insert(point, partition);
            }
        }

        Self {
            ring,
            partition_count,
            replication,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Compute the placement for a key: the first `replication` distinct
    /// partitions clockwise from `hash(key)`.
    pub fn placement(&self, key: &str) -> ShardPlacement {
        let start = hash_key(key);
        let mut partitions = Vec::with_capacity(self.replication);

        // Walk from the key's hash point, wrapping once around the ring.
        for (_, partition) in self.ring.range(start..).chain(self.ring.range(..start)) {
            if !partitions.contains(partition) {
                partitions.push(*partition);
                if partitions.len() == self.replication {
                    break;
                }
            }
        }

        let namespaces = partitions
            .iter()
            .map(|p| crate::config::Config::partition_namespace(*p))
            .collect();

        ShardPlacement {
            key: key.to_string(),
            partitions,
            namespaces,
        }
    }
}

/// Hash a key to a point on the ring (first 8 bytes of SHA-256)
fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_is_deterministic() {
        let ring = HashRing::new(4, 150, 2);
        let a = ring.placement("node-abc");
        let b = ring.placement("node-abc");
        assert_eq!(a, b);
        assert_eq!(a.partitions.len(), 2);
    }

    #[test]
    fn placement_partitions_are_distinct() {
        let ring = HashRing::new(4, 150, 3);
        for i in 0..200 {
            let placement = ring.placement(&format!("node-{i}"));
            let mut sorted = placement.partitions.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), placement.partitions.len());
        }
    }

    #[test]
    fn replication_clamped_to_partition_count() {
        let ring = HashRing::new(2, 150, 5);
        let placement = ring.placement("node-x");
        assert_eq!(placement.partitions.len(), 2);
    }

    #[test]
    fn keys_spread_across_partitions() {
        let ring = HashRing::new(4, 150, 1);
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            seen.insert(ring.placement(&format!("node-{i}")).primary());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn overlap_detection() {
        let a = ShardPlacement {
            key: "a".into(),
            partitions: vec![0, 1],
            namespaces: vec!["shard-0".into(), "shard-1".into()],
        };
        let b = ShardPlacement {
            key: "b".into(),
            partitions: vec![1, 2],
            namespaces: vec!["shard-1".into(), "shard-2".into()],
        };
        let c = ShardPlacement {
            key: "c".into(),
            partitions: vec![2, 3],
            namespaces: vec!["shard-2".into(), "shard-3".into()],
        };
        assert_eq!(a.shared_partition(&b), Some(1));
        assert!(!a.overlaps(&c));
    }
}
