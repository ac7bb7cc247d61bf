//! Depth-first cursor over the box tree
//!
//! The cursor borrows the engine mutably for its whole lifetime, so the
//! tree cannot change shape underneath it and each leaf visit can reload
//! evicted payload through the cache. Traversal order is deterministic:
//! depth-first, children in cell order (dimension 0 fastest).
//!
//! Region filtering prunes whole subtrees by extent overlap before any
//! disk I/O happens for them, which is what makes windowed scans over a
//! mostly-evicted dataset cheap.

use crate::error::{BoxId, EngineError, EngineResult};
use crate::tree::engine::EventStore;
use crate::tree::node::BoxNode;
use crate::tree::types::{Extent, MdEvent};

/// Axis-aligned query window
#[derive(Debug, Clone, Copy)]
pub struct Region<const ND: usize> {
    extents: [Extent; ND],
}

impl<const ND: usize> Region<ND> {
    pub fn new(extents: [Extent; ND]) -> Self {
        Self { extents }
    }

    /// Whether the window overlaps a box extent (touching faces do not
    /// count; an event exactly on a shared face belongs to the upper box)
    pub fn intersects(&self, extents: &[Extent; ND]) -> bool {
        (0..ND).all(|d| self.extents[d].overlaps(&extents[d]))
    }
}

/// Per-box and per-event filtering hooks for a traversal
///
/// `skip_box` vetoes a box and its entire subtree; `event_stride` samples
/// every n-th event within each visited leaf.
pub trait SkipPolicy<const ND: usize> {
    fn skip_box(&self, _node: &BoxNode<ND>) -> bool {
        false
    }

    fn event_stride(&self) -> usize {
        1
    }
}

/// The trivial policy: visit everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSkip;

impl<const ND: usize> SkipPolicy<ND> for NoSkip {}

/// Sample every `stride`-th event of each visited leaf
#[derive(Debug, Clone, Copy)]
pub struct StrideSkip {
    pub stride: usize,
}

impl<const ND: usize> SkipPolicy<ND> for StrideSkip {
    fn event_stride(&self) -> usize {
        self.stride.max(1)
    }
}

/// Traversal options
#[derive(Debug, Clone, Copy, Default)]
pub struct IterOptions<const ND: usize> {
    /// Yield only terminal boxes (leaves, or grids cut off by `max_depth`)
    pub leaves_only: bool,
    /// Do not descend below this depth; a grid at the limit is terminal
    pub max_depth: Option<usize>,
    /// Prune subtrees whose extents do not overlap this window
    pub region: Option<Region<ND>>,
}

impl<const ND: usize> IterOptions<ND> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaves_only(mut self) -> Self {
        self.leaves_only = true;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn region(mut self, region: Region<ND>) -> Self {
        self.region = Some(region);
        self
    }
}

/// Stateful depth-first cursor over one engine's box tree
///
/// Invalid between construction and the first `next_box`, and again after
/// exhaustion; accessors return `InvalidIteratorState` in those windows.
pub struct BoxCursor<'a, const ND: usize, P: SkipPolicy<ND> = NoSkip> {
    store: &'a mut EventStore<ND>,
    policy: P,
    options: IterOptions<ND>,
    /// Pending subtree roots, top of stack visited next
    stack: Vec<BoxId>,
    current: Option<BoxId>,
    started: bool,
    /// Index of the next event within the current leaf
    event_pos: usize,
}

impl<const ND: usize> EventStore<ND> {
    /// Depth-first cursor over every box
    pub fn cursor(&mut self) -> BoxCursor<'_, ND, NoSkip> {
        self.cursor_with(IterOptions::default(), NoSkip)
    }

    /// Cursor with traversal options and a skip policy
    pub fn cursor_with<P: SkipPolicy<ND>>(
        &mut self,
        options: IterOptions<ND>,
        policy: P,
    ) -> BoxCursor<'_, ND, P> {
        let stack = vec![self.root_id()];
        BoxCursor {
            store: self,
            policy,
            options,
            stack,
            current: None,
            started: false,
            event_pos: 0,
        }
    }
}

impl<'a, const ND: usize, P: SkipPolicy<ND>> BoxCursor<'a, ND, P> {
    /// Advance to the next box in depth-first order
    ///
    /// Returns `None` once the traversal is exhausted. Visiting a leaf
    /// makes its payload resident (a cache touch plus, if evicted, one
    /// block read); pruned subtrees cost no I/O at all.
    pub fn next_box(&mut self) -> EngineResult<Option<BoxId>> {
        self.started = true;
        loop {
            let Some(id) = self.stack.pop() else {
                self.current = None;
                return Ok(None);
            };

            let node = self.store.node(id);
            if let Some(region) = &self.options.region {
                if !region.intersects(node.extents()) {
                    continue;
                }
            }
            if self.policy.skip_box(node) {
                continue;
            }

            let is_leaf = node.is_leaf();
            let below_limit = self.options.max_depth.map_or(true, |m| node.depth() < m);
            if !is_leaf && below_limit {
                let children = node.children()?;
                for &child in children.iter().rev() {
                    self.stack.push(child);
                }
            }

            // A grid cut off by max_depth counts as terminal
            let terminal = is_leaf || !below_limit;
            if self.options.leaves_only && !terminal {
                continue;
            }

            if is_leaf {
                self.store.ensure_loaded(id)?;
            }
            self.current = Some(id);
            self.event_pos = 0;
            return Ok(Some(id));
        }
    }

    /// Next event, crossing leaf boundaries transparently
    ///
    /// Applies the policy's event stride within each leaf. Returns `None`
    /// once every visited leaf is consumed.
    pub fn next_event(&mut self) -> EngineResult<Option<MdEvent<ND>>> {
        let stride = self.policy.event_stride().max(1);
        loop {
            if let Some(id) = self.current {
                if self.store.node(id).is_leaf() {
                    let events = self.store.leaf_events(id)?;
                    if self.event_pos < events.len() {
                        let ev = events[self.event_pos];
                        self.event_pos += stride;
                        return Ok(Some(ev));
                    }
                }
            }
            if self.next_box()?.is_none() {
                return Ok(None);
            }
        }
    }

    /// Id of the box the cursor points at
    pub fn current(&self) -> EngineResult<BoxId> {
        self.current.ok_or(EngineError::InvalidIteratorState(
            if self.started {
                "cursor is exhausted"
            } else {
                "cursor has not been advanced"
            },
        ))
    }

    /// Cached signal of the current box; O(1), no I/O
    pub fn signal(&self) -> EngineResult<f64> {
        Ok(self.store.node(self.current()?).signal())
    }

    /// Cached squared error of the current box
    pub fn error_squared(&self) -> EngineResult<f64> {
        Ok(self.store.node(self.current()?).error_squared())
    }

    /// Event count of the current box's subtree
    pub fn n_events(&self) -> EngineResult<u64> {
        Ok(self.store.node(self.current()?).n_events())
    }

    /// Depth of the current box
    pub fn depth(&self) -> EngineResult<usize> {
        Ok(self.store.node(self.current()?).depth())
    }

    /// Extents of the current box
    pub fn extents(&self) -> EngineResult<&[Extent; ND]> {
        Ok(self.store.node(self.current()?).extents())
    }

    /// Events of the current box; `WrongVariant` on a grid box
    ///
    /// The payload was made resident when the cursor arrived here, but a
    /// reload can still happen if it was evicted by a later visit.
    pub fn events(&mut self) -> EngineResult<&[MdEvent<ND>]> {
        let id = self.current()?;
        if !self.store.node(id).is_leaf() {
            return Err(EngineError::WrongVariant {
                expected: "leaf",
                box_id: id,
            });
        }
        self.store.leaf_events(id)
    }
}
