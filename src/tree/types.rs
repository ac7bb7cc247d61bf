//! Core data types for the gridstore engine
//!
//! This module defines the fundamental types used throughout the tree layer:
//! - `MdEvent`: a single N-dimensional event record
//! - `Extent`: one `[min, max)` interval per dimension
//! - `DimStats`: optional per-dimension running mean/variance
//! - `BoundsPolicy`: how out-of-extent coordinates are handled on insertion

use serde::{Deserialize, Serialize};

/// A single N-dimensional event record
///
/// Fixed-size value type: `ND` coordinates plus signal, squared error, and
/// run/detector tags. Immutable once written; copied by value into leaf
/// boxes. Typically 16 + 4*ND bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MdEvent<const ND: usize> {
    /// Coordinates in the dataset's N-dimensional space
    pub center: [f32; ND],
    /// Signal (weight) of the event
    pub signal: f32,
    /// Squared error of the signal
    pub error_sq: f32,
    /// Index of the run this event came from
    pub run_index: u16,
    /// Detector that recorded the event
    pub detector_id: u32,
}

impl<const ND: usize> MdEvent<ND> {
    /// Create an event with unit signal and error
    pub fn at(center: [f32; ND]) -> Self {
        Self {
            center,
            signal: 1.0,
            error_sq: 1.0,
            run_index: 0,
            detector_id: 0,
        }
    }

    /// Create an event with explicit signal and squared error
    pub fn new(center: [f32; ND], signal: f32, error_sq: f32) -> Self {
        Self {
            center,
            signal,
            error_sq,
            run_index: 0,
            detector_id: 0,
        }
    }

    /// Builder method: set run/detector tags
    pub fn tagged(mut self, run_index: u16, detector_id: u32) -> Self {
        self.run_index = run_index;
        self.detector_id = detector_id;
        self
    }
}

/// One dimension's `[min, max)` interval
///
/// Events exactly on `max` belong to the extent (they land in the last
/// grid cell), so a parent's children tile it with no gaps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min: f32,
    pub max: f32,
}

impl Extent {
    /// Create an extent
    ///
    /// # Panics
    /// Panics if min >= max
    pub fn new(min: f32, max: f32) -> Self {
        assert!(min < max, "Extent: min must be less than max");
        Self { min, max }
    }

    /// Width of the interval
    pub fn width(&self) -> f32 {
        self.max - self.min
    }

    /// Whether a coordinate falls inside (max inclusive)
    pub fn contains(&self, x: f32) -> bool {
        x >= self.min && x <= self.max
    }

    /// Whether two extents overlap (touching edges do not count)
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.min < other.max && self.max > other.min
    }

    /// Clamp a coordinate onto the interval
    pub fn clamp(&self, x: f32) -> f32 {
        x.clamp(self.min, self.max)
    }
}

/// How insertion treats coordinates outside the root extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsPolicy {
    /// Clamp the coordinate onto the nearest extent face; the event lands
    /// in an edge cell. Default.
    Clamp,
    /// Reject with `OutOfRange`; batch insertion pre-validates every event
    /// so a rejected batch applies nothing.
    Reject,
}

impl Default for BoundsPolicy {
    fn default() -> Self {
        BoundsPolicy::Clamp
    }
}

/// Running mean/variance for one dimension (Welford's method)
///
/// Maintained eagerly alongside the signal aggregates when enabled, so it
/// survives payload eviction without rescanning events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DimStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl DimStats {
    /// Fold one coordinate into the statistics
    pub fn push(&mut self, x: f32) {
        self.count += 1;
        let delta = f64::from(x) - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (f64::from(x) - self.mean);
    }

    /// Number of samples folded in
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Running mean, or None before the first sample
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Population variance, or None before the first sample
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.m2 / self.count as f64)
    }
}
