use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use memkv_common::error::Result;
use memkv_common::types::{NodeId, Term};
use serde::{Deserialize, Serialize};

/// The term/vote pair that must survive restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Defines the behavior for any vote storage backend.
pub trait HardStateStorage: Send {
    fn save(&mut self, record: &VoteRecord) -> Result<()>;
    fn load(&self) -> Result<VoteRecord>;
}

/// Saves the vote record as a small JSON file, replaced atomically.
pub struct FileHardStateStorage {
    pub path: PathBuf,
}

impl FileHardStateStorage {
    pub const FILE_NAME: &'static str = "vote.json";

    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            path: dir.as_ref().join(Self::FILE_NAME),
        })
    }
}

impl HardStateStorage for FileHardStateStorage {
    fn save(&mut self, record: &VoteRecord) -> Result<()> {
        let encoded = serde_json::to_vec(record)?;
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<VoteRecord> {
        if !self.path.exists() {
            return Ok(VoteRecord::default());
        }

        let bytes = fs::read(&self.path)?;
        let record = serde_json::from_slice(&bytes)?;
        Ok(record)
    }
}

/// Volatile backend; clones share the record.
#[derive(Clone, Default)]
pub struct MemHardStateStorage {
    record: Arc<Mutex<VoteRecord>>,
}

impl MemHardStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HardStateStorage for MemHardStateStorage {
    fn save(&mut self, record: &VoteRecord) -> Result<()> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = *record;
        Ok(())
    }

    fn load(&self) -> Result<VoteRecord> {
        Ok(*self.record.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_record_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileHardStateStorage::new(dir.path()).unwrap();

        assert_eq!(store.load().unwrap(), VoteRecord::default());

        let record = VoteRecord {
            term: 42,
            voted_for: Some(3),
        };
        store.save(&record).expect("Failed to save vote");

        let reopened = FileHardStateStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap(), record);
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileHardStateStorage::new(dir.path()).unwrap();
        store
            .save(&VoteRecord {
                term: 1,
                voted_for: Some(1),
            })
            .unwrap();
        store
            .save(&VoteRecord {
                term: 2,
                voted_for: None,
            })
            .unwrap();

        assert_eq!(store.load().unwrap().term, 2);
        assert_eq!(store.load().unwrap().voted_for, None);
        assert!(!dir.path().join("vote.json.tmp").exists());
    }
}
