//! Adaptive spatial box tree
//!
//! This module provides the N-dimensional event tree:
//!
//! - **types**: Core data structures (MdEvent, Extent, DimStats, BoundsPolicy)
//! - **node**: Leaf/grid box nodes and split geometry
//! - **engine**: Main event engine orchestrating tree, cache, and block store
//! - **iter**: Depth-first cursor with region pruning and skip policies
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   MdEvent → descend by coordinates → leaf append → pending buffer
//!           → coalesced block write (on flush)
//!
//! Read Path:
//!   Cursor → region pruning → ensure-loaded (cache) → events
//! ```

pub mod engine;
pub mod iter;
pub mod node;
pub mod types;

// Re-export commonly used types
pub use engine::{EngineConfig, EngineStats, EventStore};
pub use iter::{BoxCursor, IterOptions, NoSkip, Region, SkipPolicy, StrideSkip};
pub use node::{BoxKind, BoxNode};
pub use types::{BoundsPolicy, DimStats, Extent, MdEvent};
