//! On-disk block store
//!
//! - **encoding**: Column-major event encoding + LZ4 compression
//! - **blocks**: Checksummed block file with in-place rewrite and a free list
//!
//! One block file per dataset; each leaf box owns at most one block, keyed
//! by its box id.

pub mod blocks;
pub mod encoding;

pub use blocks::{BlockFile, BlockMeta, FreeSpan, StoreManifest};
pub use encoding::{decode_events, encode_events, encoding_stats, EncodingStats};
