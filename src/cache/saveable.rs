//! The contract between the cache layer and anything it pages to disk
//!
//! Implemented by box nodes; consumed by the engine's eviction and flush
//! paths. Keeping the seam behind a trait means the cache machinery never
//! needs to know what a payload is, only what it costs and where it lives.

use crate::error::{BoxId, EngineResult};
use crate::store::BlockFile;

/// A unit of data the disk cache can page in and out
pub trait Saveable {
    /// Process-unique id; doubles as the on-disk block key.
    fn id(&self) -> BoxId;

    /// Current in-memory cost in abstract units (event count). Zero when
    /// the payload is not resident.
    fn memory_cost(&self) -> u64;

    /// Whether the payload currently occupies memory.
    fn is_resident(&self) -> bool;

    /// Ordering key for write coalescing: the block's file offset, or
    /// `None` if never written. Flushes sort by this so writes to adjacent
    /// disk regions happen back to back.
    fn file_position(&self) -> Option<u64>;

    /// Write the current payload to the backing block keyed by `id`.
    fn save(&mut self, store: &mut BlockFile) -> EngineResult<()>;

    /// Reconstruct the payload from the backing block. Must verify the
    /// loaded payload against the saved aggregates and fail with
    /// `CorruptedCache` on mismatch.
    fn load(&mut self, store: &mut BlockFile) -> EngineResult<()>;

    /// Discard the in-memory payload. Aggregate statistics survive.
    fn release(&mut self);
}
