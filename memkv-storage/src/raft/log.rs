use memkv_common::error::{MemkvError, Result};
use memkv_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

use super::wal::{LogStorage, MemLogStorage};

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,               // Term number when entry was received by leader
    pub index: LogIndex,          // Index of the log entry in the log
    pub entry_type: LogEntryType, // Type of entry (Command/Noop)
    pub data: Vec<u8>,            // Payload (usually a command)
}

/// Type of log entry, decides how the state machine interprets it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogEntryType {
    Command, // Actual command to apply to the state machine
    Noop,    // Empty entry to assert leadership
}

/// A complete log for one Raft node, backed by durable storage.
///
/// Entries are dense and 1-based, so entry `i` lives at `entries[i - 1]`.
pub struct RaftLog {
    entries: Vec<LogEntry>,         // Ordered log entries
    pub commit_index: LogIndex,     // Index of last committed entry
    pub last_applied: LogIndex,     // Index of last entry applied to state machine
    storage: Box<dyn LogStorage>,   // Where appends and truncations are persisted
}

impl RaftLog {
    /// Create an empty, volatile Raft log
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            storage: Box::new(MemLogStorage::new()),
        }
    }

    /// Open a log over `storage`, replaying whatever it already holds.
    /// Commit and apply positions always start at zero.
    pub fn open(mut storage: Box<dyn LogStorage>) -> Result<Self> {
        let entries = storage.load()?;
        for (pos, entry) in entries.iter().enumerate() {
            let expected = pos as LogIndex + 1;
            if entry.index != expected {
                return Err(MemkvError::IndexConflict {
                    index: entry.index,
                    reason: format!("persisted log has a gap, expected index {expected}"),
                });
            }
        }
        Ok(Self {
            entries,
            commit_index: 0,
            last_applied: 0,
            storage,
        })
    }

    /// Append a new log entry right after `(prev_index, prev_term)`.
    ///
    /// Fails with `IndexConflict` when the caller's view of the tail does not
    /// match the stored one.
    pub fn append(&mut self, prev_index: LogIndex, prev_term: Term, entry: LogEntry) -> Result<()> {
        if prev_index != self.last_index() || prev_term != self.last_term() {
            return Err(MemkvError::IndexConflict {
                index: entry.index,
                reason: format!(
                    "expected tail ({prev_index}, {prev_term}), found ({}, {})",
                    self.last_index(),
                    self.last_term()
                ),
            });
        }
        self.extend(vec![entry])
    }

    /// Append entries that continue the current tail.
    pub fn extend(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(MemkvError::IndexConflict {
                    index: entry.index,
                    reason: format!("next index must be {expected}"),
                });
            }
            expected += 1;
        }
        self.storage.append(&entries)?;
        self.entries.extend(entries);
        Ok(())
    }

    /// Discard entries at and after `index`. Committed entries are never
    /// discarded.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.commit_index {
            return Err(MemkvError::IndexConflict {
                index,
                reason: format!("cannot truncate at or below commit index {}", self.commit_index),
            });
        }
        if index > self.last_index() {
            return Ok(());
        }
        let keep = (index - 1) as usize;
        self.storage.truncate_from(index, &self.entries[..keep])?;
        self.entries.truncate(keep);
        Ok(())
    }

    /// Get a specific log entry by index (not array index, Raft log index)
    pub fn get(&self, index: LogIndex) -> Result<&LogEntry> {
        self.entry(index).ok_or(MemkvError::NotFound(index))
    }

    fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; 0 for the empty prefix, `None` past the tail.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `index`.
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        let start = (index - 1) as usize;
        let end = start.saturating_add(max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Returns the last log index, or 0 if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Returns the term of the last entry, or 0 if empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Raft's "at least as up-to-date" comparison against a candidate's tail.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
