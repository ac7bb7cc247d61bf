//! Id-keyed block file backing the disk cache
//!
//! One data file per dataset. Each box's payload is written as a framed
//! block at a stable offset; a block that outgrows its reserved capacity
//! is relocated and its old span goes onto a best-fit free list.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (32 bytes)                       │
//! │   magic: [u8; 4] = "GSEV"               │
//! │   version: u16                          │
//! │   nd: u16                               │
//! │   reserved: [u8; 20]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ BLOCKS (variable, unordered)            │
//! │   For each block:                       │
//! │     payload_len: u32                    │
//! │     payload: [u8; payload_len]          │
//! │     crc: u32                            │
//! │   (a block may reserve slack capacity   │
//! │    beyond payload_len)                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The id → offset index and the free list are volatile here; the engine
//! persists them in the dataset manifest.

use crate::error::{BoxId, EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for block file identification
const BLOCK_MAGIC: [u8; 4] = *b"GSEV";

/// Current block file format version
const BLOCK_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 32;

/// Per-block framing overhead: payload_len (4) + crc (4)
const FRAME_OVERHEAD: u64 = 8;

/// Location and shape of one box's block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Offset of the frame from the start of the file
    pub offset: u64,
    /// Current payload length in bytes
    pub len: u32,
    /// Reserved payload capacity at this offset (>= len)
    pub capacity: u32,
    /// Number of events in the payload, for integrity checks on reload
    pub n_events: u64,
}

/// A reusable hole left by a freed or relocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpan {
    /// Offset of the hole
    pub offset: u64,
    /// Total bytes in the hole, framing included
    pub bytes: u64,
}

/// Snapshot of the store's volatile state, persisted in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreManifest {
    /// File length (next append offset)
    pub end: u64,
    /// Free spans available for reuse
    pub free: Vec<FreeSpan>,
    /// Block index
    pub blocks: Vec<(BoxId, BlockMeta)>,
}

/// The block file plus its in-memory index and free list
pub struct BlockFile {
    path: PathBuf,
    file: File,
    index: HashMap<BoxId, BlockMeta>,
    free: Vec<FreeSpan>,
    /// Next append offset
    end: u64,
    /// Blocks read since open
    reads: u64,
    /// Blocks written since open
    writes: u64,
}

impl BlockFile {
    /// Create a new block file, truncating any existing one
    pub fn create(path: impl AsRef<Path>, nd: u16) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&Self::header_bytes(nd))?;
        file.flush()?;

        Ok(Self {
            path,
            file,
            index: HashMap::new(),
            free: Vec::new(),
            end: HEADER_SIZE as u64,
            reads: 0,
            writes: 0,
        })
    }

    /// Open an existing block file, restoring index and free list from a
    /// manifest snapshot
    pub fn open(path: impl AsRef<Path>, nd: u16, manifest: StoreManifest) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        Self::check_header(&header, nd)?;

        let file_len = file.metadata()?.len();
        if manifest.end > file_len {
            return Err(EngineError::CorruptedCache(format!(
                "Manifest claims {} bytes but file has {}",
                manifest.end, file_len
            )));
        }

        Ok(Self {
            path,
            file,
            index: manifest.blocks.into_iter().collect(),
            free: manifest.free,
            end: manifest.end,
            reads: 0,
            writes: 0,
        })
    }

    fn header_bytes(nd: u16) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&BLOCK_MAGIC);
        buf[4..6].copy_from_slice(&BLOCK_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&nd.to_le_bytes());
        // bytes 8-27 reserved
        let checksum = crc32fast::hash(&buf[0..28]);
        buf[28..32].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    fn check_header(buf: &[u8; HEADER_SIZE], nd: u16) -> EngineResult<()> {
        let stored_checksum = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        let computed = crc32fast::hash(&buf[0..28]);
        if stored_checksum != computed {
            return Err(EngineError::CorruptedCache(
                "Block file header checksum mismatch".to_string(),
            ));
        }

        if buf[0..4] != BLOCK_MAGIC {
            return Err(EngineError::CorruptedCache(format!(
                "Invalid block file magic: {:?}",
                &buf[0..4]
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > BLOCK_VERSION {
            return Err(EngineError::CorruptedCache(format!(
                "Unsupported block file version: {}",
                version
            )));
        }

        let stored_nd = u16::from_le_bytes([buf[6], buf[7]]);
        if stored_nd != nd {
            return Err(EngineError::Config(format!(
                "Block file has dimensionality {}, engine expects {}",
                stored_nd, nd
            )));
        }

        Ok(())
    }

    /// Write a box's payload, reusing its existing block when the new
    /// payload still fits the reserved capacity
    pub fn write_block(
        &mut self,
        id: BoxId,
        payload: &[u8],
        n_events: u64,
    ) -> EngineResult<BlockMeta> {
        let len = payload.len() as u32;

        let meta = match self.index.get(&id) {
            Some(old) if old.capacity >= len => BlockMeta {
                offset: old.offset,
                len,
                capacity: old.capacity,
                n_events,
            },
            Some(old) => {
                let old = *old;
                self.release_span(FreeSpan {
                    offset: old.offset,
                    bytes: FRAME_OVERHEAD + u64::from(old.capacity),
                });
                self.allocate(len, n_events)
            }
            None => self.allocate(len, n_events),
        };

        self.file.seek(SeekFrom::Start(meta.offset))?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        self.file.flush()?;

        self.index.insert(id, meta);
        self.writes += 1;

        Ok(meta)
    }

    /// Find space for a new block: best-fit free span, else append
    fn allocate(&mut self, len: u32, n_events: u64) -> BlockMeta {
        let needed = FRAME_OVERHEAD + u64::from(len);

        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, s)| s.bytes >= needed)
            .min_by_key(|(_, s)| s.bytes)
            .map(|(i, _)| i);

        if let Some(i) = best {
            let span = self.free.swap_remove(i);
            let leftover = span.bytes - needed;
            // Too small to frame another block: absorb as slack capacity,
            // unless the slack would not fit the u32 capacity field
            if leftover < FRAME_OVERHEAD + 8 {
                if let Ok(capacity) = u32::try_from(span.bytes - FRAME_OVERHEAD) {
                    return BlockMeta {
                        offset: span.offset,
                        len,
                        capacity,
                        n_events,
                    };
                }
            }
            if leftover > 0 {
                self.free.push(FreeSpan {
                    offset: span.offset + needed,
                    bytes: leftover,
                });
            }
            return BlockMeta {
                offset: span.offset,
                len,
                capacity: len,
                n_events,
            };
        }

        let offset = self.end;
        self.end += needed;
        BlockMeta {
            offset,
            len,
            capacity: len,
            n_events,
        }
    }

    /// Return a span to the free list, merging with adjacent spans
    fn release_span(&mut self, span: FreeSpan) {
        let mut merged = span;
        self.free.retain(|s| {
            if s.offset + s.bytes == merged.offset {
                merged = FreeSpan {
                    offset: s.offset,
                    bytes: s.bytes + merged.bytes,
                };
                false
            } else if merged.offset + merged.bytes == s.offset {
                merged.bytes += s.bytes;
                false
            } else {
                true
            }
        });
        // A span ending at EOF shrinks the file logically
        if merged.offset + merged.bytes == self.end {
            self.end = merged.offset;
        } else {
            self.free.push(merged);
        }
    }

    /// Read and verify a box's payload
    pub fn read_block(&mut self, id: BoxId) -> EngineResult<Vec<u8>> {
        let meta = *self.index.get(&id).ok_or_else(|| {
            EngineError::CorruptedCache(format!("No block recorded for box {}", id))
        })?;

        self.file.seek(SeekFrom::Start(meta.offset))?;

        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len != meta.len {
            return Err(EngineError::CorruptedCache(format!(
                "Block for box {} has length {} on disk, index says {}",
                id, len, meta.len
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;

        let mut crc_buf = [0u8; 4];
        self.file.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);
        if stored_crc != crc32fast::hash(&payload) {
            return Err(EngineError::CorruptedCache(format!(
                "Block checksum mismatch for box {}",
                id
            )));
        }

        self.reads += 1;
        Ok(payload)
    }

    /// Drop a box's block and recycle its space (used when a leaf splits)
    pub fn free_block(&mut self, id: BoxId) {
        if let Some(meta) = self.index.remove(&id) {
            self.release_span(FreeSpan {
                offset: meta.offset,
                bytes: FRAME_OVERHEAD + u64::from(meta.capacity),
            });
        }
    }

    /// File offset of a box's block: the write-coalescing sort key
    pub fn position_of(&self, id: BoxId) -> Option<u64> {
        self.index.get(&id).map(|m| m.offset)
    }

    /// Block metadata for a box
    pub fn meta_of(&self, id: BoxId) -> Option<BlockMeta> {
        self.index.get(&id).copied()
    }

    /// Number of indexed blocks
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Bytes spanned by the file contents
    pub fn byte_size(&self) -> u64 {
        self.end
    }

    /// Blocks read since open
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Blocks written since open
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Sync file contents to disk
    pub fn sync(&mut self) -> EngineResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Snapshot index and free list for the manifest
    pub fn snapshot(&self) -> StoreManifest {
        let mut blocks: Vec<(BoxId, BlockMeta)> =
            self.index.iter().map(|(&id, &m)| (id, m)).collect();
        blocks.sort_by_key(|(id, _)| *id);
        StoreManifest {
            end: self.end,
            free: self.free.clone(),
            blocks,
        }
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
