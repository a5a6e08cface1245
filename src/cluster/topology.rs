//! The topology of the cluster as tracked by the membership manager.

use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::common::ReplicaId;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// The role of a process in the cluster.
pub enum Role {
    #[display(fmt = "WORKER")]
    #[serde(rename = "WORKER")]
    Worker,
    #[display(fmt = "SERVER")]
    #[serde(rename = "SERVER")]
    Server,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The state of the cluster.
pub enum ClusterState {
    /// Waiting for the expected replicas to register.
    Initializing,
    Ready,
    ScaleOut,
    ScaleIn,
    Finished,
    Failed,
}

impl ClusterState {
    /// Checks whether the cluster reached a state it never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// The state of a replica.
pub enum ReplicaState {
    Registered,
    Heartbeating,
    Stale,
    /// Leaving the cluster in a scale in.
    Deregistered,
}

#[derive(Debug, Clone)]
/// What the manager knows about a replica.
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub role: Role,
    pub rank: u32,
    pub state: ReplicaState,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A replica as announced to the cluster.
pub struct NodeInfo {
    pub node_id: ReplicaId,
    pub rank_id: u32,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The topology as announced to the cluster.
pub struct TopologySnapshot {
    pub state: ClusterState,
    pub worker_num: u32,
    pub server_num: u32,
    pub nodes: Vec<NodeInfo>,
}

impl TopologySnapshot {
    /// Returns the ids of the server replicas, ordered by rank.
    pub fn servers(&self) -> Vec<ReplicaId> {
        self.nodes
            .iter()
            .filter(|node| node.role == Role::Server)
            .map(|node| node.node_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
/// The replicas of the cluster and the numbers of replicas it expects.
pub struct ClusterTopology {
    pub(crate) replicas: BTreeMap<ReplicaId, ReplicaInfo>,
    pub(crate) worker_num: u32,
    pub(crate) server_num: u32,
    pub(crate) state: ClusterState,
}

impl ClusterTopology {
    pub fn new(worker_num: u32, server_num: u32) -> Self {
        Self {
            replicas: BTreeMap::new(),
            worker_num,
            server_num,
            state: ClusterState::Initializing,
        }
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn get(&self, replica: &str) -> Option<&ReplicaInfo> {
        self.replicas.get(replica)
    }

    /// Returns the number of replicas of the `role` the cluster expects.
    pub fn expected(&self, role: Role) -> u32 {
        match role {
            Role::Worker => self.worker_num,
            Role::Server => self.server_num,
        }
    }

    /// Returns the total number of replicas the cluster expects.
    pub fn total_expected(&self) -> u32 {
        self.worker_num + self.server_num
    }

    /// Returns the number of registered replicas of the `role`, leaving ones excluded.
    pub fn registered(&self, role: Role) -> u32 {
        self.active()
            .filter(|info| info.role == role)
            .count() as u32
    }

    /// Checks whether all the expected replicas registered.
    pub fn is_complete(&self) -> bool {
        self.registered(Role::Worker) >= self.worker_num
            && self.registered(Role::Server) >= self.server_num
    }

    /// Returns the replicas which are not leaving the cluster.
    pub fn active(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas
            .values()
            .filter(|info| info.state != ReplicaState::Deregistered)
    }

    /// Returns the smallest rank of the `role` which is not taken, if the role expects more
    /// replicas.
    pub fn next_rank(&self, role: Role) -> Option<u32> {
        (0..self.expected(role)).find(|rank| {
            !self
                .replicas
                .values()
                .any(|info| info.role == role && info.rank == *rank)
        })
    }

    /// Re-ranks the replicas densely per role, keeping their order.
    pub fn compact_ranks(&mut self) {
        for role in &[Role::Worker, Role::Server] {
            let mut ranked: Vec<_> = self
                .replicas
                .values_mut()
                .filter(|info| info.role == *role)
                .collect();
            ranked.sort_by_key(|info| info.rank);
            for (rank, info) in ranked.into_iter().enumerate() {
                info.rank = rank as u32;
            }
        }
    }

    /// Returns the snapshot announced to the cluster.
    pub fn snapshot(&self) -> TopologySnapshot {
        let mut nodes: Vec<_> = self
            .active()
            .map(|info| NodeInfo {
                node_id: info.id.clone(),
                rank_id: info.rank,
                role: info.role,
            })
            .collect();
        nodes.sort_by_key(|node| (node.role, node.rank_id));
        TopologySnapshot {
            state: self.state,
            worker_num: self.worker_num,
            server_num: self.server_num,
            nodes,
        }
    }
}
