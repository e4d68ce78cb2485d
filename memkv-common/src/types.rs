pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Node id used in status reports when no leader is known.
pub const NO_NODE: NodeId = 0;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

impl NodeAddress {
    /// `host:port`, as used by the peer transport and the listener.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_proposal_timeout_ms")]
    pub proposal_timeout_ms: u64,
    #[serde(default = "default_max_entries_per_message")]
    pub max_entries_per_message: usize,
}

fn default_election_timeout_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_proposal_timeout_ms() -> u64 {
    5000
}

fn default_max_entries_per_message() -> usize {
    64
}

impl ClusterConfig {
    /// Cluster with default timings for the given members.
    pub fn with_nodes(nodes: Vec<NodeAddress>) -> Self {
        Self {
            nodes,
            election_timeout_ms: default_election_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            proposal_timeout_ms: default_proposal_timeout_ms(),
            max_entries_per_message: default_max_entries_per_message(),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.node_id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn address_of(&self, id: NodeId) -> Option<&NodeAddress> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    /// Election timeout expressed in timer ticks (at least one).
    pub fn election_ticks(&self) -> u64 {
        (self.election_timeout_ms / self.tick_interval_ms.max(1)).max(1)
    }

    /// Heartbeat interval expressed in timer ticks (at least one).
    pub fn heartbeat_ticks(&self) -> u64 {
        (self.heartbeat_interval_ms / self.tick_interval_ms.max(1)).max(1)
    }
}
