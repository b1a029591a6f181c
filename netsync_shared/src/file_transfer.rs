//! File transfer.
//!
//! A file is cut into fixed-size chunks tagged with the content hash, the
//! total chunk count and the chunk index. The sender paces chunks (one per
//! send interval); the receiver buffers by hash and writes the file once the
//! final chunk (`index == total - 1`) has arrived and nothing is missing.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    hash::Hasher,
    path::{Component, Path, PathBuf},
    time::{Duration, Instant},
};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::generic_codec;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("chunk {index} out of range for {total} chunks")]
    BadIndex { index: u32, total: u32 },
    #[error("chunk count changed for {hash}: {expected} then {found}")]
    TotalMismatch {
        hash: String,
        expected: u32,
        found: u32,
    },
    #[error("destination `{0}` escapes the receive directory")]
    BadPath(String),
    #[error("content hash mismatch: expected {expected}, got {found}")]
    HashMismatch { expected: String, found: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One piece of a file on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub hash: String,
    pub total: u32,
    pub index: u32,
    /// Destination path, relative to the receiver's directory.
    pub dest_path: String,
    pub bytes: Vec<u8>,
}

generic_codec!(FileChunk);

/// Hex FNV-1a 64 of the content.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    format!("{:016x}", hasher.finish())
}

/// Cuts `data` into chunks of at most `chunk_size` bytes. An empty file
/// still produces one (empty) chunk.
pub fn split_file(data: &[u8], dest_path: &str, chunk_size: usize) -> Vec<FileChunk> {
    let hash = content_hash(data);
    let pieces: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(chunk_size.max(1)).collect()
    };
    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| FileChunk {
            hash: hash.clone(),
            total,
            index: i as u32,
            dest_path: dest_path.to_string(),
            bytes: piece.to_vec(),
        })
        .collect()
}

struct PartialFile {
    total: u32,
    dest_path: String,
    final_seen: bool,
    chunks: BTreeMap<u32, Vec<u8>>,
}

/// Receiver-side reassembly, keyed by content hash.
pub struct FileAssembler {
    root: PathBuf,
    pending: HashMap<String, PartialFile>,
}

impl FileAssembler {
    /// Files are written below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: HashMap::new(),
        }
    }

    pub fn pending_files(&self) -> usize {
        self.pending.len()
    }

    /// Buffers one chunk. Returns the written path once the file is complete.
    pub fn accept(&mut self, chunk: FileChunk) -> Result<Option<PathBuf>, FileError> {
        if chunk.index >= chunk.total {
            return Err(FileError::BadIndex {
                index: chunk.index,
                total: chunk.total,
            });
        }
        let entry = self
            .pending
            .entry(chunk.hash.clone())
            .or_insert_with(|| PartialFile {
                total: chunk.total,
                dest_path: chunk.dest_path.clone(),
                final_seen: false,
                chunks: BTreeMap::new(),
            });
        if entry.total != chunk.total {
            return Err(FileError::TotalMismatch {
                hash: chunk.hash,
                expected: entry.total,
                found: chunk.total,
            });
        }
        if chunk.index == chunk.total - 1 {
            entry.final_seen = true;
        }
        entry.chunks.insert(chunk.index, chunk.bytes);
        debug!(hash = %chunk.hash, index = chunk.index, total = chunk.total, "File chunk buffered");

        if !entry.final_seen || entry.chunks.len() as u32 != entry.total {
            if entry.final_seen {
                warn!(
                    hash = %chunk.hash,
                    have = entry.chunks.len(),
                    total = entry.total,
                    "Final chunk arrived before the rest"
                );
            }
            return Ok(None);
        }

        let Some(file) = self.pending.remove(&chunk.hash) else {
            return Ok(None);
        };
        let data: Vec<u8> = file.chunks.into_values().flatten().collect();
        let found = content_hash(&data);
        if found != chunk.hash {
            return Err(FileError::HashMismatch {
                expected: chunk.hash,
                found,
            });
        }
        let path = self.resolve(&file.dest_path)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, &data)?;
        info!(path = %path.display(), bytes = data.len(), "File received");
        Ok(Some(path))
    }

    fn resolve(&self, dest: &str) -> Result<PathBuf, FileError> {
        let rel = Path::new(dest);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean || dest.is_empty() {
            return Err(FileError::BadPath(dest.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

/// Sender-side pacing: hands out at most one chunk per interval.
pub struct FilePump<T> {
    interval: Duration,
    last_sent: Option<Instant>,
    queue: VecDeque<(T, FileChunk)>,
}

impl<T> FilePump<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, target: T, chunks: Vec<FileChunk>)
    where
        T: Clone,
    {
        self.queue
            .extend(chunks.into_iter().map(|c| (target.clone(), c)));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Next chunk if the interval has elapsed since the previous one.
    pub fn next_due(&mut self, now: Instant) -> Option<(T, FileChunk)> {
        if let Some(last) = self.last_sent {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        let next = self.queue.pop_front()?;
        self.last_sent = Some(now);
        Some(next)
    }

    /// Drops every queued chunk for `target`.
    pub fn drop_target(&mut self, target: &T) -> usize
    where
        T: PartialEq,
    {
        let before = self.queue.len();
        self.queue.retain(|(t, _)| t != target);
        before - self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_sent = None;
    }
}
