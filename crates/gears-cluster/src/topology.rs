//! Cluster topology
//!
//! A topology is an immutable snapshot. Updates build a new snapshot and
//! swap it in whole, so readers never observe a partially applied change.

use crate::slots::{key_hash_slot, SLOT_COUNT};
use gears_core::{GearsError, Result, ShardId};
use serde::{Deserialize, Serialize};

/// One shard's endpoint and slot range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: ShardId,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// First owned slot, inclusive
    pub min_slot: u16,
    /// Last owned slot, inclusive
    pub max_slot: u16,
}

impl NodeInfo {
    /// Create a node owning a slot range
    pub fn new(id: impl Into<ShardId>, host: impl Into<String>, port: u16, slots: (u16, u16)) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            unix_socket: None,
            password: None,
            min_slot: slots.0,
            max_slot: slots.1,
        }
    }

    /// Address used to reach the node
    pub fn address(&self) -> String {
        match &self.unix_socket {
            Some(path) => path.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn owns_slot(&self, slot: u16) -> bool {
        (self.min_slot..=self.max_slot).contains(&slot)
    }
}

/// The set of shards forming the cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub nodes: Vec<NodeInfo>,
}

/// Incremental topology change
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopologyDelta {
    /// Nodes to add or replace by id
    pub upsert: Vec<NodeInfo>,
    /// Node ids to remove
    pub remove: Vec<ShardId>,
}

impl ClusterTopology {
    /// Create a topology from a node list
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self { nodes }
    }

    /// Split the full slot range evenly over `ids`, all on one host
    pub fn even(ids: &[ShardId], host: &str, base_port: u16) -> Self {
        let n = ids.len().max(1) as u32;
        let per = SLOT_COUNT as u32 / n;
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let min = i as u32 * per;
                let max = if i as u32 == n - 1 {
                    SLOT_COUNT as u32 - 1
                } else {
                    min + per - 1
                };
                NodeInfo::new(id.clone(), host, base_port + i as u16, (min as u16, max as u16))
            })
            .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &ShardId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn contains(&self, id: &ShardId) -> bool {
        self.node(id).is_some()
    }

    /// Ids of all shards, in topology order
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Ids of all shards except `me`
    pub fn peers_of(&self, me: &ShardId) -> Vec<ShardId> {
        self.nodes
            .iter()
            .filter(|n| &n.id != me)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn owner_of_slot(&self, slot: u16) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.owns_slot(slot))
    }

    pub fn owner_of_key(&self, key: &str) -> Option<&NodeInfo> {
        self.owner_of_slot(key_hash_slot(key))
    }

    /// Fail with a redirect when `me` does not own the key's slot
    pub fn check_key_owner(&self, me: &ShardId, key: &str) -> Result<()> {
        let slot = key_hash_slot(key);
        match self.owner_of_slot(slot) {
            Some(node) if &node.id == me => Ok(()),
            Some(node) => Err(GearsError::Moved {
                slot,
                owner: node.id.to_string(),
            }),
            None => Err(GearsError::ClusterError(format!("slot {} is not served", slot))),
        }
    }

    /// Apply an incremental change, producing a new snapshot
    pub fn apply(&self, delta: &TopologyDelta) -> ClusterTopology {
        let mut nodes: Vec<NodeInfo> = self
            .nodes
            .iter()
            .filter(|n| !delta.remove.contains(&n.id))
            .filter(|n| !delta.upsert.iter().any(|u| u.id == n.id))
            .cloned()
            .collect();
        nodes.extend(delta.upsert.iter().cloned());
        ClusterTopology { nodes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<ShardId> {
        (0..n).map(|i| ShardId::new(format!("shard-{}", i))).collect()
    }

    #[test]
    fn test_even_split_covers_all_slots() {
        let topo = ClusterTopology::even(&ids(3), "127.0.0.1", 7000);
        assert_eq!(topo.len(), 3);
        assert_eq!(topo.nodes[0].min_slot, 0);
        assert_eq!(topo.nodes[2].max_slot, SLOT_COUNT - 1);
        for slot in [0, 5000, 10000, SLOT_COUNT - 1] {
            assert!(topo.owner_of_slot(slot).is_some());
        }
        assert_eq!(topo.nodes[1].address(), "127.0.0.1:7001");
    }

    #[test]
    fn test_check_key_owner() {
        let topo = ClusterTopology::even(&ids(2), "h", 1);
        let key = "foo";
        let owner = topo.owner_of_key(key).unwrap().id.clone();
        assert!(topo.check_key_owner(&owner, key).is_ok());
        let other = topo.peers_of(&owner).pop().unwrap();
        match topo.check_key_owner(&other, key) {
            Err(GearsError::Moved { slot, owner: o }) => {
                assert_eq!(slot, key_hash_slot(key));
                assert_eq!(o, owner.to_string());
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_apply_delta() {
        let topo = ClusterTopology::even(&ids(3), "h", 1);
        let mut moved = topo.nodes[1].clone();
        moved.port = 9999;
        let delta = TopologyDelta {
            upsert: vec![moved],
            remove: vec![ShardId::from("shard-2")],
        };
        let next = topo.apply(&delta);
        assert_eq!(next.len(), 2);
        assert_eq!(next.node(&ShardId::from("shard-1")).unwrap().port, 9999);
        assert!(!next.contains(&ShardId::from("shard-2")));
        // the original snapshot is untouched
        assert_eq!(topo.len(), 3);
    }

    #[test]
    fn test_peers_of() {
        let topo = ClusterTopology::even(&ids(3), "h", 1);
        let peers = topo.peers_of(&ShardId::from("shard-0"));
        assert_eq!(peers, vec![ShardId::from("shard-1"), ShardId::from("shard-2")]);
    }
}
