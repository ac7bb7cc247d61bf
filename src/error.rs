//! Engine error types
//!
//! Defines all errors that can occur in the storage engine. Three families:
//! contract violations (`WrongVariant`, `InvalidIteratorState`) which are
//! programming errors, bounds errors (`OutOfRange`) whose handling is
//! policy-defined, and fatal I/O or integrity failures (`CorruptedCache`)
//! which abort the affected dataset and are never retried.

use thiserror::Error;

/// Identifier of a box node; also the key for its on-disk block.
pub type BoxId = u64;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Leaf operation on a grid box, or grid operation on a leaf box
    #[error("Wrong box variant: expected {expected} for box {box_id}")]
    WrongVariant {
        expected: &'static str,
        box_id: BoxId,
    },

    /// Cursor accessor called before the first advance or after exhaustion
    #[error("Invalid iterator state: {0}")]
    InvalidIteratorState(&'static str),

    /// Event coordinate outside the root extent (Reject bounds policy only)
    #[error("Coordinate {value} out of range [{min}, {max}] in dimension {dim}")]
    OutOfRange {
        dim: usize,
        value: f32,
        min: f32,
        max: f32,
    },

    /// Backing store unreadable or inconsistent with the tree; fatal for
    /// the dataset, since lost event payload cannot be reconstructed
    #[error("Corrupted cache: {0}")]
    CorruptedCache(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
