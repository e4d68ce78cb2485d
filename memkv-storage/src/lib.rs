//! Replicated log, durable node state and the Raft consensus core.

pub mod raft;

pub use raft::hard_state::{FileHardStateStorage, HardStateStorage, MemHardStateStorage, VoteRecord};
pub use raft::log::{LogEntry, LogEntryType, RaftLog};
pub use raft::node::{ApplyReport, NodeRole, NodeStatus, RaftConfig, RaftNode};
pub use raft::rpc::{Envelope, RaftMessage};
pub use raft::state_machine::{KeyValueStore, KvCommand, KvResponse, StateMachine};
pub use raft::wal::{FileLogStorage, LogStorage, MemLogStorage};
