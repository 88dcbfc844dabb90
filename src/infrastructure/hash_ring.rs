// Consistent-hash ring mapping record keys to shard group ids.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use tracing::info;

/// Number of virtual nodes each group contributes to the ring. More virtual
/// nodes give a more uniform key distribution across groups.
const VIRTUAL_NODES_PER_GROUP: u32 = 100;

/// Consistent hash ring over string group ids.
///
/// Keys are hashed onto the ring and walk clockwise to the first virtual
/// node; hash collisions between virtual nodes resolve to the
/// lexicographically smallest group id. Mutations are serialized by the
/// caller (the coordinator holds the ring behind a `RwLock`).
#[derive(Debug, Default)]
pub struct ConsistentHashRing {
    /// Hash ring: hash value -> group ids whose virtual node landed there.
    ring: BTreeMap<u64, BTreeSet<String>>,
    /// Active groups on the ring.
    groups: HashSet<String>,
}

impl ConsistentHashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group to the ring. No-op if the group is already present.
    pub fn add_group(&mut self, group_id: &str) {
        if !self.groups.insert(group_id.to_string()) {
            return;
        }

        for i in 0..VIRTUAL_NODES_PER_GROUP {
            let virtual_key = format!("{}#vnode{}", group_id, i);
            let hash_value = hash_key(&virtual_key);
            self.ring
                .entry(hash_value)
                .or_default()
                .insert(group_id.to_string());
        }

        info!(
            "Added shard group '{}' to the ring ({} groups total)",
            group_id,
            self.groups.len()
        );
    }

    /// Remove a group and all its virtual nodes. No-op if absent.
    pub fn remove_group(&mut self, group_id: &str) {
        if !self.groups.remove(group_id) {
            return;
        }

        for i in 0..VIRTUAL_NODES_PER_GROUP {
            let virtual_key = format!("{}#vnode{}", group_id, i);
            let hash_value = hash_key(&virtual_key);
            if let Some(owners) = self.ring.get_mut(&hash_value) {
                owners.remove(group_id);
                if owners.is_empty() {
                    self.ring.remove(&hash_value);
                }
            }
        }

        info!("Removed shard group '{}' from the ring", group_id);
    }

    /// Resolve the owning group for a key, or `None` iff the ring is empty.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if self.ring.is_empty() {
            return None;
        }

        let hash_value = hash_key(key);

        // First virtual node at or after the key's position, wrapping
        // around to the start of the ring.
        let owners = self
            .ring
            .range(hash_value..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, owners)| owners)?;

        owners.iter().next().cloned()
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.groups.contains(group_id)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
