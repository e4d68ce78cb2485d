//! Types, errors and configuration shared by the memkv crates.

pub mod config;
pub mod error;
pub mod types;

pub use error::{MemkvError, Result};
pub use types::{ClusterConfig, LogIndex, NodeAddress, NodeId, Term, NO_NODE};
