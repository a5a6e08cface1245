//! A consistent hash ring mapping metadata names to their owner replicas.

use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::common::ReplicaId;

/// The default number of virtual nodes placed on the ring for each replica.
pub const DEFAULT_VIRTUAL_NODES: u32 = 100;

/// Hashes `data` onto the ring. The hash is stable across processes and platforms.
fn ring_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A hash ring with virtual nodes.
///
/// The owner of a key is the replica of the first virtual node at or after the hash of the key,
/// wrapping around at the end of the ring. Adding or removing a replica only moves the keys whose
/// nearest virtual node changes.
pub struct ConsistentHashRing {
    virtual_nodes: u32,
    ring: BTreeMap<u64, ReplicaId>,
    replicas: BTreeSet<ReplicaId>,
}

impl ConsistentHashRing {
    /// Creates an empty ring which places `virtual_nodes` virtual nodes per replica.
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
            replicas: BTreeSet::new(),
        }
    }

    /// Creates a ring holding the given `replicas`.
    pub fn with_replicas<I, R>(virtual_nodes: u32, replicas: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ReplicaId>,
    {
        let mut ring = Self::new(virtual_nodes);
        for replica in replicas {
            ring.insert(replica.into());
        }
        ring
    }

    /// Places the virtual nodes of the `replica` on the ring. Returns `false` if the replica was
    /// already on the ring.
    pub fn insert(&mut self, replica: ReplicaId) -> bool {
        if !self.replicas.insert(replica.clone()) {
            return false;
        }
        for vnode in 0..self.virtual_nodes {
            let position = ring_hash(format!("{}#{}", replica, vnode).as_bytes());
            match self.ring.entry(position) {
                Entry::Vacant(entry) => {
                    entry.insert(replica.clone());
                }
                // colliding virtual nodes go to the smallest id, whatever the insertion order
                Entry::Occupied(mut entry) => {
                    if replica < *entry.get() {
                        entry.insert(replica.clone());
                    }
                }
            }
        }
        true
    }

    /// Removes the virtual nodes of the `replica` from the ring. Returns `false` if the replica
    /// was not on the ring.
    pub fn remove(&mut self, replica: &str) -> bool {
        if !self.replicas.remove(replica) {
            return false;
        }
        // rebuild instead of removing in place, so that collisions resolve as if the replica had
        // never been inserted
        let remaining = std::mem::take(&mut self.replicas);
        self.ring.clear();
        for replica in remaining {
            self.insert(replica);
        }
        true
    }

    /// Returns the owner of the `key`, or `None` if the ring is empty.
    pub fn owner(&self, key: &str) -> Option<&ReplicaId> {
        let position = ring_hash(key.as_bytes());
        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, replica)| replica)
    }

    /// Returns the replicas on the ring, in ascending order.
    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.replicas.iter()
    }

    /// Checks whether the `replica` is on the ring.
    pub fn contains(&self, replica: &str) -> bool {
        self.replicas.contains(replica)
    }

    /// Returns the number of replicas on the ring.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Checks whether the ring holds no replica.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

/// Returns the owner of the `key` among the `replicas`, or `None` if there is no replica.
pub fn owner<R>(key: &str, replicas: &[R]) -> Option<ReplicaId>
where
    R: AsRef<str>,
{
    ConsistentHashRing::with_replicas(
        DEFAULT_VIRTUAL_NODES,
        replicas.iter().map(|replica| replica.as_ref().to_string()),
    )
    .owner(key)
    .cloned()
}
