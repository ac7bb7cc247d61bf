//! Box nodes of the spatial tree
//!
//! A `BoxNode` is either a leaf (owns an event payload, possibly evicted to
//! disk) or a grid (owns child box ids that tile its extent). Nodes live in
//! an id-indexed arena owned by the engine; children refer to each other by
//! `BoxId`, never by pointer, so destruction is trivial and splitting never
//! moves a node.
//!
//! Aggregate statistics (signal, squared error, event count, optional
//! per-dimension running moments) are folded in on every insertion along
//! the descent path, so they are always valid without touching payload and
//! survive eviction.

use crate::cache::Saveable;
use crate::error::{BoxId, EngineError, EngineResult};
use crate::store::{decode_events, encode_events, BlockFile, BlockMeta};
use crate::tree::types::{DimStats, Extent, MdEvent};

/// Leaf payload state
#[derive(Debug)]
pub struct LeafState<const ND: usize> {
    /// Resident events, or `None` when evicted
    pub(crate) events: Option<Vec<MdEvent<ND>>>,
    /// Location of the last saved payload, if any
    pub(crate) block: Option<BlockMeta>,
}

/// Grid subdivision state
#[derive(Debug)]
pub struct GridState<const ND: usize> {
    /// Cells per dimension
    pub(crate) splits: [usize; ND],
    /// Child box ids, row-major (dimension 0 fastest)
    pub(crate) children: Vec<BoxId>,
}

/// The two box variants
#[derive(Debug)]
pub enum BoxKind<const ND: usize> {
    Leaf(LeafState<ND>),
    Grid(GridState<ND>),
}

/// One node of the box tree
#[derive(Debug)]
pub struct BoxNode<const ND: usize> {
    pub(crate) id: BoxId,
    pub(crate) depth: usize,
    pub(crate) extents: [Extent; ND],
    pub(crate) signal_sum: f64,
    pub(crate) error_sq_sum: f64,
    /// Events in this subtree; for a leaf, its own payload size whether or
    /// not the payload is resident
    pub(crate) n_events: u64,
    /// Per-dimension running moments, when the engine tracks them
    pub(crate) dim_stats: Option<Vec<DimStats>>,
    pub(crate) kind: BoxKind<ND>,
}

impl<const ND: usize> BoxNode<ND> {
    /// Create an empty resident leaf
    pub fn new_leaf(id: BoxId, depth: usize, extents: [Extent; ND], track_stats: bool) -> Self {
        Self {
            id,
            depth,
            extents,
            signal_sum: 0.0,
            error_sq_sum: 0.0,
            n_events: 0,
            dim_stats: track_stats.then(|| vec![DimStats::default(); ND]),
            kind: BoxKind::Leaf(LeafState {
                events: Some(Vec::new()),
                block: None,
            }),
        }
    }

    pub fn id(&self) -> BoxId {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn extents(&self) -> &[Extent; ND] {
        &self.extents
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, BoxKind::Leaf(_))
    }

    /// Cached total signal; O(1), valid regardless of residency
    pub fn signal(&self) -> f64 {
        self.signal_sum
    }

    /// Cached total squared error; O(1), valid regardless of residency
    pub fn error_squared(&self) -> f64 {
        self.error_sq_sum
    }

    /// Events in this subtree
    pub fn n_events(&self) -> u64 {
        self.n_events
    }

    /// Per-dimension running moments, if tracked
    pub fn dim_stats(&self) -> Option<&[DimStats]> {
        self.dim_stats.as_deref()
    }

    /// Fold one event into the aggregates (descent path bookkeeping)
    pub(crate) fn record_event(&mut self, ev: &MdEvent<ND>) {
        self.signal_sum += f64::from(ev.signal);
        self.error_sq_sum += f64::from(ev.error_sq);
        self.n_events += 1;
        if let Some(stats) = &mut self.dim_stats {
            for (d, s) in stats.iter_mut().enumerate() {
                s.push(ev.center[d]);
            }
        }
    }

    /// Child ids of a grid box
    pub fn children(&self) -> EngineResult<&[BoxId]> {
        match &self.kind {
            BoxKind::Grid(grid) => Ok(&grid.children),
            BoxKind::Leaf(_) => Err(EngineError::WrongVariant {
                expected: "grid",
                box_id: self.id,
            }),
        }
    }

    /// Resident events of a leaf box
    ///
    /// The engine is responsible for `ensure_loaded` first; an evicted
    /// payload here means the cache was bypassed.
    pub fn loaded_events(&self) -> EngineResult<&[MdEvent<ND>]> {
        match &self.kind {
            BoxKind::Leaf(leaf) => leaf.events.as_deref().ok_or_else(|| {
                EngineError::CorruptedCache(format!("Payload for box {} is not resident", self.id))
            }),
            BoxKind::Grid(_) => Err(EngineError::WrongVariant {
                expected: "leaf",
                box_id: self.id,
            }),
        }
    }

    /// Append an event to a resident leaf payload; returns the new length
    pub(crate) fn push_event(&mut self, ev: MdEvent<ND>) -> EngineResult<usize> {
        match &mut self.kind {
            BoxKind::Leaf(leaf) => {
                let events = leaf.events.as_mut().ok_or_else(|| {
                    EngineError::CorruptedCache(format!(
                        "Payload for box {} is not resident",
                        self.id
                    ))
                })?;
                events.push(ev);
                Ok(events.len())
            }
            BoxKind::Grid(_) => Err(EngineError::WrongVariant {
                expected: "leaf",
                box_id: self.id,
            }),
        }
    }

    /// Child id containing the given coordinates
    ///
    /// Constant-time index computation from coordinates and extents; no
    /// search. Coordinates exactly on the upper extent face land in the
    /// last cell.
    pub fn child_id_for(&self, center: &[f32; ND]) -> EngineResult<BoxId> {
        match &self.kind {
            BoxKind::Grid(grid) => {
                let cell = cell_index(&self.extents, &grid.splits, center);
                Ok(grid.children[cell])
            }
            BoxKind::Leaf(_) => Err(EngineError::WrongVariant {
                expected: "grid",
                box_id: self.id,
            }),
        }
    }

    /// Convert a leaf into a grid, taking its payload for redistribution
    ///
    /// The caller (engine) allocates the children and hands their ids in;
    /// this node only changes variant. Returns the payload that must be
    /// redistributed and the old block, which the caller frees.
    pub(crate) fn into_grid(
        &mut self,
        splits: [usize; ND],
        children: Vec<BoxId>,
    ) -> EngineResult<(Vec<MdEvent<ND>>, Option<BlockMeta>)> {
        match &mut self.kind {
            BoxKind::Leaf(leaf) => {
                let events = leaf.events.take().ok_or_else(|| {
                    EngineError::CorruptedCache(format!(
                        "Cannot split box {}: payload not resident",
                        self.id
                    ))
                })?;
                let block = leaf.block.take();
                self.kind = BoxKind::Grid(GridState { splits, children });
                Ok((events, block))
            }
            BoxKind::Grid(_) => Err(EngineError::WrongVariant {
                expected: "leaf",
                box_id: self.id,
            }),
        }
    }

    fn leaf(&self) -> EngineResult<&LeafState<ND>> {
        match &self.kind {
            BoxKind::Leaf(leaf) => Ok(leaf),
            BoxKind::Grid(_) => Err(EngineError::WrongVariant {
                expected: "leaf",
                box_id: self.id,
            }),
        }
    }

    fn leaf_mut(&mut self) -> EngineResult<&mut LeafState<ND>> {
        match &mut self.kind {
            BoxKind::Leaf(leaf) => Ok(leaf),
            BoxKind::Grid(_) => Err(EngineError::WrongVariant {
                expected: "leaf",
                box_id: self.id,
            }),
        }
    }
}

impl<const ND: usize> Saveable for BoxNode<ND> {
    fn id(&self) -> BoxId {
        self.id
    }

    fn memory_cost(&self) -> u64 {
        match &self.kind {
            BoxKind::Leaf(leaf) => leaf.events.as_ref().map(|e| e.len() as u64).unwrap_or(0),
            BoxKind::Grid(_) => 0,
        }
    }

    fn is_resident(&self) -> bool {
        matches!(&self.kind, BoxKind::Leaf(leaf) if leaf.events.is_some())
    }

    fn file_position(&self) -> Option<u64> {
        match &self.kind {
            BoxKind::Leaf(leaf) => leaf.block.map(|b| b.offset),
            BoxKind::Grid(_) => None,
        }
    }

    fn save(&mut self, store: &mut BlockFile) -> EngineResult<()> {
        let id = self.id;
        let leaf = self.leaf_mut()?;
        let events = leaf.events.as_deref().ok_or_else(|| {
            EngineError::CorruptedCache(format!("Cannot save box {}: payload not resident", id))
        })?;

        let payload = encode_events(events)?;
        let meta = store.write_block(id, &payload, events.len() as u64)?;
        self.leaf_mut()?.block = Some(meta);
        Ok(())
    }

    fn load(&mut self, store: &mut BlockFile) -> EngineResult<()> {
        let id = self.id;
        let expected = self.n_events;
        let block = self.leaf()?.block;

        let events = match block {
            // Never written: only valid for a leaf whose aggregates agree
            None => {
                if expected != 0 {
                    return Err(EngineError::CorruptedCache(format!(
                        "Box {} has {} events on record but no saved block",
                        id, expected
                    )));
                }
                Vec::new()
            }
            Some(block) => {
                let payload = store.read_block(id)?;
                let events: Vec<MdEvent<ND>> = decode_events(&payload)?;
                if events.len() as u64 != block.n_events || events.len() as u64 != expected {
                    return Err(EngineError::CorruptedCache(format!(
                        "Box {} loaded {} events, aggregates say {}",
                        id,
                        events.len(),
                        expected
                    )));
                }
                events
            }
        };

        self.leaf_mut()?.events = Some(events);
        Ok(())
    }

    fn release(&mut self) {
        if let BoxKind::Leaf(leaf) = &mut self.kind {
            leaf.events = None;
        }
    }
}

/// Exact cell boundaries for one dimension
///
/// `edges(e, n)[j]` is the lower face of cell `j`; the first and last
/// entries are the parent's own faces, so adjacent children share bit-equal
/// boundary values and the union of cells tiles the parent exactly.
pub fn edges(extent: Extent, n: usize) -> Vec<f32> {
    let width = extent.width();
    let mut out = Vec::with_capacity(n + 1);
    out.push(extent.min);
    for j in 1..n {
        out.push(extent.min + width * (j as f32 / n as f32));
    }
    out.push(extent.max);
    out
}

/// Extents of the grid cell at the given per-dimension indices
pub fn cell_extents<const ND: usize>(
    parent: &[Extent; ND],
    splits: &[usize; ND],
    cell: &[usize; ND],
) -> [Extent; ND] {
    let mut out = *parent;
    for d in 0..ND {
        let e = edges(parent[d], splits[d]);
        out[d] = Extent {
            min: e[cell[d]],
            max: e[cell[d] + 1],
        };
    }
    out
}

/// Row-major linear index of a cell (dimension 0 fastest)
pub fn linear_index<const ND: usize>(splits: &[usize; ND], cell: &[usize; ND]) -> usize {
    let mut idx = 0;
    let mut stride = 1;
    for d in 0..ND {
        idx += cell[d] * stride;
        stride *= splits[d];
    }
    idx
}

/// Per-dimension cell indices for the given linear index
pub fn cell_of_linear<const ND: usize>(splits: &[usize; ND], mut idx: usize) -> [usize; ND] {
    let mut cell = [0usize; ND];
    for d in 0..ND {
        cell[d] = idx % splits[d];
        idx /= splits[d];
    }
    cell
}

/// Linear cell index for a coordinate inside the parent extents
///
/// Coordinates are assumed in-extent (the bounds policy runs at the root);
/// the per-dimension index is still clamped so float rounding at the upper
/// face cannot escape the grid.
pub fn cell_index<const ND: usize>(
    extents: &[Extent; ND],
    splits: &[usize; ND],
    center: &[f32; ND],
) -> usize {
    let mut cell = [0usize; ND];
    for d in 0..ND {
        let frac = (center[d] - extents[d].min) / extents[d].width();
        let i = (frac * splits[d] as f32).floor() as isize;
        cell[d] = i.clamp(0, splits[d] as isize - 1) as usize;
    }
    linear_index(splits, &cell)
}
