//! Disk-backed residency cache
//!
//! - **mru**: MRU-ordered residency and pending-write bookkeeping
//! - **saveable**: The contract between the cache and anything it pages
//!
//! The cache tracks ids and costs only; the engine owns the nodes and
//! performs the actual saves, loads, and releases through [`Saveable`].

pub mod mru;
pub mod saveable;

pub use mru::MruCache;
pub use saveable::Saveable;
