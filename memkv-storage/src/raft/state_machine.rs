use bincode::Options;
use memkv_common::error::{MemkvError, Result};
use memkv_common::types::LogIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trait for any Raft-compatible state machine.
/// Only committed commands reach `apply`, and always in log order.
pub trait StateMachine: Send {
    type Command: Send;
    type Response: Send;

    fn get(&self, key: &str) -> Option<String>;

    /// Applies a command and returns a response
    fn apply(&mut self, command: Self::Command) -> Self::Response;

    /// Number of live keys
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes the payload of the command entry at `index`. Anything that is
    /// not exactly one command is a `MalformedEntry`.
    pub fn decode(index: LogIndex, bytes: &[u8]) -> Result<Self> {
        bincode::options()
            .with_fixint_encoding()
            .deserialize(bytes)
            .map_err(|err| MemkvError::MalformedEntry {
                index,
                reason: err.to_string(),
            })
    }

    pub fn key(&self) -> &str {
        match self {
            KvCommand::Put { key, .. } | KvCommand::Delete { key } => key,
        }
    }
}

/// Response type returned by the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvResponse {
    Ack,
    Removed(bool), // whether the key existed
}

/// The in-memory key-value store with Raft StateMachine trait
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyValueStore {
    data: BTreeMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the whole mapping.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}

impl StateMachine for KeyValueStore {
    type Command = KvCommand;
    type Response = KvResponse;

    fn apply(&mut self, command: Self::Command) -> Self::Response {
        match command {
            KvCommand::Put { key, value } => {
                self.data.insert(key, value);
                KvResponse::Ack
            }
            KvCommand::Delete { key } => KvResponse::Removed(self.data.remove(&key).is_some()),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

//
// Tests
//
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let mut kv = KeyValueStore::default();

        let resp = kv.apply(KvCommand::Put {
            key: "foo".into(),
            value: "bar".into(),
        });
        assert_eq!(resp, KvResponse::Ack);
        assert_eq!(kv.get("foo"), Some("bar".into()));

        // overwrite
        kv.apply(KvCommand::Put {
            key: "foo".into(),
            value: "baz".into(),
        });
        assert_eq!(kv.get("foo"), Some("baz".into()));

        let resp = kv.apply(KvCommand::Delete { key: "foo".into() });
        assert_eq!(resp, KvResponse::Removed(true));
        assert_eq!(kv.get("foo"), None);

        let resp = kv.apply(KvCommand::Delete { key: "foo".into() });
        assert_eq!(resp, KvResponse::Removed(false));
        assert!(kv.is_empty());
    }

    #[test]
    fn test_decode_command() {
        let cmd = KvCommand::Put {
            key: "a".into(),
            value: "1".into(),
        };
        let bytes = cmd.encode().unwrap();
        assert_eq!(KvCommand::decode(7, &bytes).unwrap(), cmd);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = KvCommand::decode(3, &[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, MemkvError::MalformedEntry { index: 3, .. }));

        // trailing bytes after a valid command are corruption too
        let mut bytes = KvCommand::Delete { key: "a".into() }.encode().unwrap();
        bytes.push(0);
        assert!(KvCommand::decode(4, &bytes).is_err());
    }
}
