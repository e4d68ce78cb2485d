// Raft log, durable state, and the consensus state machine
pub mod hard_state;
pub mod log;
pub mod node;
pub mod rpc;
pub mod state_machine;
pub mod wal;
