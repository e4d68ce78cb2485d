//! Durable backends for the raft log.
//!
//! The on-disk log is a single append-only file of records:
//!
//! ```text
//! Record := Length Crc32 Payload
//! Length  -> u32 LE, byte length of Payload
//! Crc32   -> u32 LE, checksum of Payload
//! Payload -> bincode(LogEntry)
//! ```
//!
//! Every mutation is fsynced before it returns.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, BufMut, BytesMut};
use memkv_common::error::{MemkvError, Result};
use memkv_common::types::LogIndex;
use tracing::{debug, warn};

use super::log::LogEntry;

const RECORD_HEADER_SIZE: usize = 4 + 4;

/// Persistence behind a [`RaftLog`](super::log::RaftLog).
pub trait LogStorage: Send {
    /// Reads back every persisted entry, in index order.
    fn load(&mut self) -> Result<Vec<LogEntry>>;

    /// Durably appends entries after the current tail.
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Durably drops every entry at or after `index`. `retained` is the
    /// log content that must survive.
    fn truncate_from(&mut self, index: LogIndex, retained: &[LogEntry]) -> Result<()>;
}

/// Append-only file in a node's data directory.
pub struct FileLogStorage {
    path: PathBuf,
    file: File,
}

impl FileLogStorage {
    pub const FILE_NAME: &'static str = "log.wal";

    /// Opens (creating if needed) the log file inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = Self::open_append(&path)?;
        Ok(Self { path, file })
    }

    fn open_append(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStorage for FileLogStorage {
    fn load(&mut self) -> Result<Vec<LogEntry>> {
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;

        let (entries, valid_len) = decode_records(&bytes)?;
        if valid_len < bytes.len() {
            warn!(
                path = %self.path.display(),
                discarded = bytes.len() - valid_len,
                "discarding torn record at the tail of the log"
            );
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
            self.file = Self::open_append(&self.path)?;
        }
        debug!(path = %self.path.display(), entries = entries.len(), "loaded log");
        Ok(entries)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let buf = encode_records(entries)?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex, retained: &[LogEntry]) -> Result<()> {
        // rewrite the surviving prefix, then atomically swap it in
        let temp_path = self.path.with_extension("wal.tmp");
        let mut temp = File::create(&temp_path)?;
        temp.write_all(&encode_records(retained)?)?;
        temp.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            File::open(dir)?.sync_all()?;
        }
        self.file = Self::open_append(&self.path)?;
        debug!(path = %self.path.display(), from = index, "truncated log");
        Ok(())
    }
}

fn encode_records(entries: &[LogEntry]) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    for entry in entries {
        let payload = bincode::serialize(entry)?;
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(crc32fast::hash(&payload));
        buf.put_slice(&payload);
    }
    Ok(buf)
}

/// Decodes records until the end of the buffer or a torn tail record.
/// Returns the entries and the length of the valid prefix.
fn decode_records(bytes: &[u8]) -> Result<(Vec<LogEntry>, usize)> {
    let mut entries = Vec::new();
    let mut cursor = bytes;
    let mut offset = 0usize;

    while cursor.remaining() >= RECORD_HEADER_SIZE {
        let mut header = &cursor[..RECORD_HEADER_SIZE];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();

        let record_end = RECORD_HEADER_SIZE + len;
        if cursor.remaining() < record_end {
            break; // torn write
        }
        let payload = &cursor[RECORD_HEADER_SIZE..record_end];
        if crc32fast::hash(payload) != crc {
            if cursor.remaining() == record_end {
                break; // torn write of the last record
            }
            return Err(MemkvError::MalformedEntry {
                index: entries.len() as LogIndex + 1,
                reason: format!("checksum mismatch at byte offset {offset}"),
            });
        }

        let entry: LogEntry = bincode::deserialize(payload)?;
        entries.push(entry);
        cursor.advance(record_end);
        offset += record_end;
    }

    Ok((entries, offset))
}

/// Volatile backend. Clones share the same entries, so a "restarted" node in
/// tests can be handed the storage of its previous incarnation.
#[derive(Clone, Default)]
pub struct MemLogStorage {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStorage for MemLogStorage {
    fn load(&mut self) -> Result<Vec<LogEntry>> {
        Ok(self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex, _retained: &[LogEntry]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| e.index < index);
        Ok(())
    }
}
