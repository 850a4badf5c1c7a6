//! Compressed working memory shared across drill-down iterations of one run.
//!
//! Notes are zstd-compressed on write and decompressed on read. An entry is
//! never mutated: a write inserts a fresh entry, replacing any entry with the
//! same iteration id. When more than `max_entries` ids are held, the oldest
//! write is evicted.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ScratchpadConfig;

#[derive(Debug, thiserror::Error)]
pub enum ScratchpadError {
    #[error("failed to compress note: {0}")]
    Compress(#[source] std::io::Error),

    #[error("failed to decompress note: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("note is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchpadEntry {
    pub iteration_id: String,
    pub compressed_content: Vec<u8>,
    pub created_at_ms: u64,
    /// Write order within the run
    pub sequence: u64,
}

#[derive(Debug)]
pub struct Scratchpad {
    entries: DashMap<String, Arc<ScratchpadEntry>>,
    sequence: AtomicU64,
    level: i32,
    max_entries: usize,
}

impl Default for Scratchpad {
    fn default() -> Self {
        Self::new(&ScratchpadConfig::default())
    }
}

impl Scratchpad {
    pub fn new(config: &ScratchpadConfig) -> Self {
        Self {
            entries: DashMap::new(),
            sequence: AtomicU64::new(0),
            level: config.compression_level,
            max_entries: config.max_entries.max(1),
        }
    }

    pub fn write(&self, iteration_id: &str, note: &str) -> Result<(), ScratchpadError> {
        let compressed =
            zstd::encode_all(note.as_bytes(), self.level).map_err(ScratchpadError::Compress)?;
        let entry = ScratchpadEntry {
            iteration_id: iteration_id.to_string(),
            compressed_content: compressed,
            created_at_ms: now_ms(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.entries.insert(iteration_id.to_string(), Arc::new(entry));
        self.evict();
        Ok(())
    }

    /// `Ok(None)` when nothing was written for `iteration_id`.
    pub fn read(&self, iteration_id: &str) -> Result<Option<String>, ScratchpadError> {
        let entry = match self.entries.get(iteration_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(None),
        };
        decompress(&entry).map(Some)
    }

    /// Most recently written note.
    pub fn latest(&self) -> Result<Option<String>, ScratchpadError> {
        match self.entries().last() {
            Some(entry) => decompress(entry).map(Some),
            None => Ok(None),
        }
    }

    /// All notes in write order, each under its iteration id.
    pub fn read_all(&self) -> Result<String, ScratchpadError> {
        let mut notes = Vec::new();
        for entry in self.entries() {
            notes.push(format!("[{}]\n{}", entry.iteration_id, decompress(&entry)?));
        }
        Ok(notes.join("\n\n"))
    }

    /// Snapshot of the entries, oldest first.
    pub fn entries(&self) -> Vec<ScratchpadEntry> {
        let mut entries: Vec<ScratchpadEntry> = self
            .entries
            .iter()
            .map(|e| e.value().as_ref().clone())
            .collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().sequence)
                .map(|e| e.key().clone());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

fn decompress(entry: &ScratchpadEntry) -> Result<String, ScratchpadError> {
    let bytes = zstd::decode_all(entry.compressed_content.as_slice())
        .map_err(ScratchpadError::Decompress)?;
    Ok(String::from_utf8(bytes)?)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
