//! # Gridstore
//!
//! Out-of-core storage engine for N-dimensional event datasets. Events are
//! organized in an adaptive spatial box tree whose leaf payloads page in
//! and out of memory through a disk-backed MRU cache, so datasets much
//! larger than RAM stay queryable with bounded memory.
//!
//! ## Features
//!
//! - **Adaptive box tree**: leaves split into grids as events accumulate,
//!   so resolution follows data density
//! - **Bounded memory**: an MRU cache evicts least-recently-used payloads;
//!   aggregates (signal, error, counts) stay valid without touching disk
//! - **Coalesced writes**: dirty payloads buffer up and flush sorted by
//!   file position
//! - **Checksummed blocks**: every payload carries a CRC, verified on load
//! - **Region queries**: the cursor prunes whole subtrees by extent before
//!   any disk I/O
//!
//! ## Modules
//!
//! - [`tree`]: Box tree, event engine, and cursor
//! - [`cache`]: MRU residency bookkeeping and the paging contract
//! - [`store`]: Block file and event encoding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gridstore::{EngineConfig, EventStore, Extent, MdEvent};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new("./data")
//!         .split_threshold(1000)
//!         .cache_budget(1_000_000);
//!
//!     let extents = [Extent::new(0.0, 10.0), Extent::new(0.0, 10.0)];
//!     let mut store = EventStore::<2>::create(config, extents)?;
//!
//!     store.add_event(MdEvent::new([2.5, 7.0], 1.0, 1.0))?;
//!     println!("total signal: {}", store.signal());
//!
//!     let mut cursor = store.cursor();
//!     while let Some(id) = cursor.next_box()? {
//!         println!("box {} signal {}", id, cursor.signal()?);
//!     }
//!
//!     store.close()?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod store;
pub mod tree;

// Re-export top-level types for convenience
pub use error::{BoxId, EngineError, EngineResult};

pub use tree::{
    BoundsPolicy, BoxCursor, BoxNode, DimStats, EngineConfig, EngineStats, EventStore,
    Extent, IterOptions, MdEvent, NoSkip, Region, SkipPolicy, StrideSkip,
};

pub use cache::{MruCache, Saveable};

pub use store::{BlockFile, BlockMeta, StoreManifest};

pub use config::{init_logging, Config, ConfigError, LoggingConfig};
