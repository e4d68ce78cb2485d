use super::log::LogEntry;
use memkv_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,              // Leader’s term
    pub leader_id: NodeId,       // Leader's ID
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,     // Term of that entry
    pub entries: Vec<LogEntry>,  // New log entries to store
    pub leader_commit: LogIndex, // Leader’s commit index
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
    // On success: last index now known to match the leader.
    // On rejection: the follower's hint for where to retry from.
    pub match_index: LogIndex,
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Every message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::RequestVoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) => "request_vote",
            RaftMessage::RequestVoteResponse(_) => "request_vote_response",
            RaftMessage::AppendEntries(_) => "append_entries",
            RaftMessage::AppendEntriesResponse(_) => "append_entries_response",
        }
    }
}

/// A message addressed from one node to another; the unit of the Step RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::LogEntryType;

    #[test]
    fn test_serialize_append_entries() {
        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };

        let encoded = bincode::serialize(&req).unwrap();
        let decoded: AppendEntriesRequest = bincode::deserialize(&encoded).unwrap();

        assert_eq!(decoded.term, 1);
        assert_eq!(decoded.leader_id, 1);
    }

    #[test]
    fn test_envelope_json_is_tagged() {
        let env = Envelope {
            from: 2,
            to: 1,
            message: RaftMessage::AppendEntries(AppendEntriesRequest {
                term: 3,
                leader_id: 2,
                prev_log_index: 4,
                prev_log_term: 2,
                entries: vec![LogEntry {
                    term: 3,
                    index: 5,
                    entry_type: LogEntryType::Noop,
                    data: vec![],
                }],
                leader_commit: 4,
            }),
        };

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["message"]["type"], "append_entries");

        let decoded: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.message.term(), 3);
    }
}
