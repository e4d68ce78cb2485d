use bincode;
use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term, NO_NODE};

#[derive(Debug, Error)]
pub enum MemkvError {
    #[error("not the leader (known leader: {leader})")]
    NotLeader { leader: NodeId },

    #[error("leadership lost before the entry was committed")]
    LeadershipLost,

    #[error("leader has not yet applied an entry of its term {term}")]
    LeaderNotReady { term: Term },

    #[error("timed out waiting for commit")]
    Timeout,

    #[error("log index conflict at {index}: {reason}")]
    IndexConflict { index: LogIndex, reason: String },

    #[error("log entry {0} not found")]
    NotFound(LogIndex),

    #[error("malformed log entry at {index}: {reason}")]
    MalformedEntry { index: LogIndex, reason: String },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("peer {peer} unreachable: {reason}")]
    NetworkUnavailable { peer: NodeId, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Consensus Error: {0}")]
    Consensus(String),
}

impl MemkvError {
    /// Errors after which a node must stop touching its log and state machine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemkvError::IndexConflict { .. } | MemkvError::MalformedEntry { .. } | MemkvError::Io(_)
        )
    }

    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            MemkvError::NotLeader { .. } => "NotLeader",
            MemkvError::LeadershipLost => "LeadershipLost",
            MemkvError::LeaderNotReady { .. } => "LeaderNotReady",
            MemkvError::Timeout => "Timeout",
            MemkvError::IndexConflict { .. } => "IndexConflict",
            MemkvError::NotFound(_) => "NotFound",
            MemkvError::MalformedEntry { .. } => "MalformedEntry",
            MemkvError::KeyNotFound(_) => "KeyNotFound",
            MemkvError::NetworkUnavailable { .. } => "NetworkUnavailable",
            MemkvError::InvalidArgument(_) => "InvalidArgument",
            MemkvError::Io(_) => "Io",
            MemkvError::Serde(_) => "Serde",
            MemkvError::Codec(_) => "Codec",
            MemkvError::Config(_) => "Config",
            MemkvError::Consensus(_) => "Consensus",
        }
    }

    pub fn not_leader(leader: Option<NodeId>) -> Self {
        MemkvError::NotLeader {
            leader: leader.unwrap_or(NO_NODE),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemkvError>;

impl From<bincode::Error> for MemkvError {
    fn from(err: bincode::Error) -> Self {
        MemkvError::Codec(format!("Bincode Error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let conflict = MemkvError::IndexConflict {
            index: 3,
            reason: "below commit".into(),
        };
        assert!(conflict.is_fatal());
        assert!(!MemkvError::Timeout.is_fatal());
        assert!(!MemkvError::not_leader(None).is_fatal());
        assert!(!MemkvError::LeaderNotReady { term: 2 }.is_fatal());
    }

    #[test]
    fn test_not_leader_defaults_to_no_node() {
        match MemkvError::not_leader(None) {
            MemkvError::NotLeader { leader } => assert_eq!(leader, NO_NODE),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(MemkvError::not_leader(Some(2)).code(), "NotLeader");
    }
}
