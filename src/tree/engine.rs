//! Gridstore event engine
//!
//! The engine orchestrates all components:
//! - Write path: MdEvent → descend tree → leaf append → pending buffer → coalesced block write
//! - Read path: cursor → region pruning → ensure-loaded → events
//!
//! The engine owns the node arena, the MRU residency cache, and the block
//! file; every eviction, reload, and flush goes through its methods. The
//! core is single-threaded; `ensure_loaded` is the one operation that
//! blocks on disk I/O.

use crate::cache::{MruCache, Saveable};
use crate::error::{BoxId, EngineError, EngineResult};
use crate::store::{BlockFile, BlockMeta, StoreManifest};
use crate::tree::node::{cell_extents, cell_of_linear, BoxKind, BoxNode, GridState, LeafState};
use crate::tree::types::{BoundsPolicy, DimStats, Extent, MdEvent};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Manifest format version
const MANIFEST_VERSION: u32 = 1;

/// Configuration for the event engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for all data
    pub data_dir: PathBuf,
    /// Leaf event count above which the leaf splits into a grid
    pub split_threshold: usize,
    /// Cells per dimension on split, when `split_per_dim` is empty
    pub split_factor: usize,
    /// Per-dimension split factors; overrides `split_factor` when non-empty
    pub split_per_dim: Vec<usize>,
    /// Memory budget for resident payloads, in cost units (events)
    pub cache_budget: u64,
    /// Pending-write cost that triggers an automatic flush
    pub flush_threshold: u64,
    /// How out-of-extent coordinates are handled
    pub bounds_policy: BoundsPolicy,
    /// Maintain per-dimension running mean/variance
    pub track_dim_stats: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("gridstore_data"),
            split_threshold: 1000,
            split_factor: 2,
            split_per_dim: Vec::new(),
            cache_budget: 1_000_000,
            flush_threshold: 50_000,
            bounds_policy: BoundsPolicy::default(),
            track_dim_stats: false,
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Builder method: leaf split threshold
    pub fn split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Builder method: uniform split factor
    pub fn split_factor(mut self, factor: usize) -> Self {
        self.split_factor = factor;
        self
    }

    /// Builder method: per-dimension split factors
    pub fn split_per_dim(mut self, splits: Vec<usize>) -> Self {
        self.split_per_dim = splits;
        self
    }

    /// Builder method: cache budget in cost units
    pub fn cache_budget(mut self, budget: u64) -> Self {
        self.cache_budget = budget;
        self
    }

    /// Builder method: automatic flush threshold
    pub fn flush_threshold(mut self, threshold: u64) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Builder method: bounds policy
    pub fn bounds_policy(mut self, policy: BoundsPolicy) -> Self {
        self.bounds_policy = policy;
        self
    }

    /// Builder method: per-dimension statistics
    pub fn track_dim_stats(mut self, enable: bool) -> Self {
        self.track_dim_stats = enable;
        self
    }

    /// Path to the block file
    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.dat")
    }

    /// Path to the dataset manifest
    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("manifest.json")
    }

    fn splits_for<const ND: usize>(&self) -> EngineResult<[usize; ND]> {
        if self.split_threshold == 0 {
            return Err(EngineError::Config(
                "split_threshold must be at least 1".to_string(),
            ));
        }
        let splits = if self.split_per_dim.is_empty() {
            [self.split_factor; ND]
        } else {
            to_array::<usize, ND>(self.split_per_dim.clone()).map_err(|_| {
                EngineError::Config(format!(
                    "split_per_dim has {} entries, engine has {} dimensions",
                    self.split_per_dim.len(),
                    ND
                ))
            })?
        };
        if splits.iter().any(|&s| s < 2) {
            return Err(EngineError::Config(
                "split factors must be at least 2".to_string(),
            ));
        }
        Ok(splits)
    }
}

/// Persisted structural state of a dataset
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    nd: u32,
    extents: Vec<Extent>,
    splits: Vec<usize>,
    root: BoxId,
    nodes: Vec<NodeRecord>,
    store: StoreManifest,
}

/// One node's structural state in the manifest
#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: BoxId,
    depth: usize,
    extents: Vec<Extent>,
    signal: f64,
    error_sq: f64,
    n_events: u64,
    #[serde(default)]
    dim_stats: Option<Vec<DimStats>>,
    /// Present for grid boxes
    #[serde(default)]
    children: Option<Vec<BoxId>>,
    /// Present for leaf boxes that have been written
    #[serde(default)]
    block: Option<BlockMeta>,
}

/// The gridstore event engine
pub struct EventStore<const ND: usize> {
    config: EngineConfig,
    splits: [usize; ND],
    /// Node arena; a box's id is its slot index
    nodes: Vec<BoxNode<ND>>,
    root: BoxId,
    cache: MruCache,
    store: BlockFile,
}

impl<const ND: usize> EventStore<ND> {
    /// Create a new dataset with the given root extents
    pub fn create(config: EngineConfig, extents: [Extent; ND]) -> EngineResult<Self> {
        let splits = config.splits_for::<ND>()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = BlockFile::create(config.events_path(), ND as u16)?;
        let root_node = BoxNode::new_leaf(0, 0, extents, config.track_dim_stats);

        let mut cache = MruCache::new();
        cache.insert(0, 0);

        tracing::info!(data_dir = ?config.data_dir, nd = ND, "Created dataset");

        Ok(Self {
            config,
            splits,
            nodes: vec![root_node],
            root: 0,
            cache,
            store,
        })
    }

    /// Open an existing dataset from its manifest
    ///
    /// Every leaf starts `Unloaded`; payloads are reloaded on access.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let content = std::fs::read_to_string(config.manifest_path())?;
        let manifest: Manifest = serde_json::from_str(&content)?;

        if manifest.version > MANIFEST_VERSION {
            return Err(EngineError::Config(format!(
                "Unsupported manifest version: {}",
                manifest.version
            )));
        }
        if manifest.nd != ND as u32 {
            return Err(EngineError::Config(format!(
                "Dataset has dimensionality {}, engine expects {}",
                manifest.nd, ND
            )));
        }

        let splits = to_array::<usize, ND>(manifest.splits)
            .map_err(|_| EngineError::CorruptedCache("Manifest splits malformed".to_string()))?;

        let mut nodes = Vec::with_capacity(manifest.nodes.len());
        for (idx, record) in manifest.nodes.into_iter().enumerate() {
            if record.id != idx as BoxId {
                return Err(EngineError::CorruptedCache(format!(
                    "Manifest node {} recorded with id {}",
                    idx, record.id
                )));
            }
            let extents = to_array::<Extent, ND>(record.extents).map_err(|_| {
                EngineError::CorruptedCache(format!("Manifest extents malformed for box {}", idx))
            })?;
            let kind = match record.children {
                Some(children) => BoxKind::Grid(GridState { splits, children }),
                None => BoxKind::Leaf(LeafState {
                    events: None,
                    block: record.block,
                }),
            };
            nodes.push(BoxNode {
                id: record.id,
                depth: record.depth,
                extents,
                signal_sum: record.signal,
                error_sq_sum: record.error_sq,
                n_events: record.n_events,
                dim_stats: record.dim_stats,
                kind,
            });
        }
        if nodes.is_empty() {
            return Err(EngineError::CorruptedCache(
                "Manifest contains no nodes".to_string(),
            ));
        }
        let root = manifest.root;
        if root as usize >= nodes.len() {
            return Err(EngineError::CorruptedCache(format!(
                "Manifest root {} out of range",
                root
            )));
        }
        let extents = to_array::<Extent, ND>(manifest.extents)
            .map_err(|_| EngineError::CorruptedCache("Manifest extents malformed".to_string()))?;
        if nodes[root as usize].extents() != &extents {
            return Err(EngineError::CorruptedCache(
                "Manifest extents disagree with the root box".to_string(),
            ));
        }

        let store = BlockFile::open(config.events_path(), ND as u16, manifest.store)?;

        tracing::info!(
            data_dir = ?config.data_dir,
            boxes = nodes.len(),
            "Opened dataset"
        );

        Ok(Self {
            config,
            splits,
            nodes,
            root,
            cache: MruCache::new(),
            store,
        })
    }

    /// Flush, sync, and persist the manifest, consuming the engine
    pub fn close(mut self) -> EngineResult<()> {
        self.checkpoint()?;
        tracing::info!(data_dir = ?self.config.data_dir, "Closed dataset");
        Ok(())
    }

    /// Flush pending writes and persist the manifest without closing
    pub fn checkpoint(&mut self) -> EngineResult<()> {
        self.flush()?;
        self.store.sync()?;
        self.write_manifest()
    }

    fn write_manifest(&self) -> EngineResult<()> {
        let records: Vec<NodeRecord> = self
            .nodes
            .iter()
            .map(|n| {
                let (children, block) = match &n.kind {
                    BoxKind::Grid(grid) => (Some(grid.children.clone()), None),
                    BoxKind::Leaf(leaf) => (None, leaf.block),
                };
                NodeRecord {
                    id: n.id,
                    depth: n.depth,
                    extents: n.extents.to_vec(),
                    signal: n.signal_sum,
                    error_sq: n.error_sq_sum,
                    n_events: n.n_events,
                    dim_stats: n.dim_stats.clone(),
                    children,
                    block,
                }
            })
            .collect();

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            nd: ND as u32,
            extents: self.node(self.root).extents().to_vec(),
            splits: self.splits.to_vec(),
            root: self.root,
            nodes: records,
            store: self.store.snapshot(),
        };

        let content = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(self.config.manifest_path(), content)?;
        Ok(())
    }

    /// Insert a single event
    pub fn add_event(&mut self, event: MdEvent<ND>) -> EngineResult<()> {
        let event = self.apply_bounds_policy(event)?;
        self.add_event_inner(event)
    }

    /// Insert a batch of events
    ///
    /// Under the `Reject` policy the whole batch is validated before any
    /// event is applied, so `OutOfRange` aborts with nothing inserted. A
    /// fatal error (`CorruptedCache`) aborts the batch at the failing
    /// event; everything already applied is consistent (each event updates
    /// payload and aggregates together).
    pub fn add_events(&mut self, events: &[MdEvent<ND>]) -> EngineResult<()> {
        if self.config.bounds_policy == BoundsPolicy::Reject {
            for ev in events {
                self.validate_bounds(ev)?;
            }
        }
        for ev in events {
            let ev = self.apply_bounds_policy(*ev)?;
            self.add_event_inner(ev)?;
        }
        Ok(())
    }

    fn validate_bounds(&self, ev: &MdEvent<ND>) -> EngineResult<()> {
        let extents = self.node(self.root).extents();
        for d in 0..ND {
            if !extents[d].contains(ev.center[d]) {
                return Err(EngineError::OutOfRange {
                    dim: d,
                    value: ev.center[d],
                    min: extents[d].min,
                    max: extents[d].max,
                });
            }
        }
        Ok(())
    }

    fn apply_bounds_policy(&self, mut ev: MdEvent<ND>) -> EngineResult<MdEvent<ND>> {
        match self.config.bounds_policy {
            BoundsPolicy::Clamp => {
                let extents = self.node(self.root).extents();
                for d in 0..ND {
                    ev.center[d] = extents[d].clamp(ev.center[d]);
                }
                Ok(ev)
            }
            BoundsPolicy::Reject => {
                self.validate_bounds(&ev)?;
                Ok(ev)
            }
        }
    }

    /// Insert one in-extent event: descend, load, append, maybe split
    fn add_event_inner(&mut self, ev: MdEvent<ND>) -> EngineResult<()> {
        // Record the descent path; aggregates along it update only after
        // the payload is known to be loadable, so a reload failure leaves
        // statistics consistent with payload.
        let mut path: Vec<BoxId> = Vec::with_capacity(8);
        let mut id = self.root;
        loop {
            path.push(id);
            let node = self.node(id);
            if node.is_leaf() {
                break;
            }
            id = node.child_id_for(&ev.center)?;
        }

        self.ensure_loaded(id)?;

        for &p in &path {
            self.nodes[p as usize].record_event(&ev);
        }
        let len = self.nodes[id as usize].push_event(ev)?;
        self.cache.set_cost(id, len as u64);
        self.cache.mark_dirty(id);

        if len > self.config.split_threshold {
            self.split_leaf(id)?;
        }
        if self.cache.pending_cost() >= self.config.flush_threshold {
            self.flush()?;
        }
        self.enforce_budget(None)
    }

    /// Convert an over-full leaf into a grid of fresh leaf children
    ///
    /// Children tile the parent extent exactly and take over the payload
    /// by the same coordinate-to-cell rule used on descent. Splitting does
    /// not cascade; a child splits on its own later if it overflows.
    fn split_leaf(&mut self, id: BoxId) -> EngineResult<()> {
        let (extents, depth) = {
            let n = self.node(id);
            (*n.extents(), n.depth())
        };
        let splits = self.splits;
        let total: usize = splits.iter().product();

        let first = self.nodes.len() as BoxId;
        let mut children = Vec::with_capacity(total);
        for linear in 0..total {
            let cell = cell_of_linear(&splits, linear);
            let child_extents = cell_extents(&extents, &splits, &cell);
            let child_id = first + linear as BoxId;
            self.nodes.push(BoxNode::new_leaf(
                child_id,
                depth + 1,
                child_extents,
                self.config.track_dim_stats,
            ));
            children.push(child_id);
        }

        let (events, old_block) = self.nodes[id as usize].into_grid(splits, children.clone())?;
        let n_redistributed = events.len();

        // The parent is no longer a payload holder
        self.cache.remove(id);
        if old_block.is_some() {
            self.store.free_block(id);
        }

        for ev in events {
            let child_id = self.nodes[id as usize].child_id_for(&ev.center)?;
            let child = &mut self.nodes[child_id as usize];
            child.record_event(&ev);
            child.push_event(ev)?;
        }

        for &child_id in &children {
            let cost = self.nodes[child_id as usize].memory_cost();
            self.cache.insert(child_id, cost);
            if cost > 0 {
                self.cache.mark_dirty(child_id);
            }
        }

        tracing::debug!(
            box_id = id,
            depth,
            children = total,
            events = n_redistributed,
            "Split leaf into grid"
        );
        Ok(())
    }

    /// Make a leaf's payload resident, evicting others if needed
    ///
    /// The sole blocking point of the engine. Reload failure is fatal
    /// (`CorruptedCache`): a lost payload cannot be reconstructed. The
    /// eviction scan protects the box just loaded and skips anything in
    /// the pending-write buffer.
    pub fn ensure_loaded(&mut self, id: BoxId) -> EngineResult<()> {
        if !self.nodes[id as usize].is_leaf() {
            return Ok(());
        }
        if self.nodes[id as usize].is_resident() {
            self.cache.touch(id);
            return Ok(());
        }

        self.nodes[id as usize].load(&mut self.store)?;
        let cost = self.nodes[id as usize].memory_cost();
        self.cache.insert(id, cost);
        tracing::trace!(box_id = id, cost, "Reloaded payload");

        self.enforce_budget(Some(id))
    }

    /// Evict least-recently-used clean payloads until under budget
    ///
    /// Dirty boxes are pinned by the pending buffer; when only dirty boxes
    /// remain, flush first and retry.
    fn enforce_budget(&mut self, protect: Option<BoxId>) -> EngineResult<()> {
        while self.cache.resident_cost() > self.config.cache_budget {
            if let Some(victim) = self.cache.lru_clean_victim(protect) {
                self.cache.remove(victim);
                self.nodes[victim as usize].release();
                tracing::trace!(box_id = victim, "Evicted payload");
            } else if self.cache.pending_len() > 0 {
                self.flush()?;
            } else {
                // Only the protected box remains; a single oversized
                // payload may transiently exceed the budget.
                break;
            }
        }
        Ok(())
    }

    /// Write all pending dirty boxes, ordered by on-disk position
    ///
    /// Sorting by block offset coalesces writes to adjacent disk regions;
    /// never-written boxes append at the end in id order. Boxes stay
    /// resident after the write. Idempotent: with nothing pending this
    /// performs zero writes.
    ///
    /// A box leaves the pending buffer only once its write succeeds, so a
    /// failed flush keeps every unwritten box pinned against eviction.
    pub fn flush(&mut self) -> EngineResult<()> {
        let mut ids = self.cache.pending_ids();
        if ids.is_empty() {
            return Ok(());
        }

        ids.sort_by_key(|&id| (self.nodes[id as usize].file_position().unwrap_or(u64::MAX), id));

        let count = ids.len();
        for id in ids {
            self.nodes[id as usize].save(&mut self.store)?;
            self.cache.clear_dirty(id);
        }

        tracing::debug!(blocks = count, "Flushed pending writes");
        Ok(())
    }

    /// Total signal of the dataset; O(1)
    pub fn signal(&self) -> f64 {
        self.node(self.root).signal()
    }

    /// Total squared error of the dataset; O(1)
    pub fn error_squared(&self) -> f64 {
        self.node(self.root).error_squared()
    }

    /// Total event count
    pub fn n_events(&self) -> u64 {
        self.node(self.root).n_events()
    }

    /// Root box id
    pub fn root_id(&self) -> BoxId {
        self.root
    }

    /// Extents of the dataset
    pub fn extents(&self) -> &[Extent; ND] {
        self.node(self.root).extents()
    }

    /// Borrow a node by id
    ///
    /// # Panics
    /// Panics if `id` was not produced by this store.
    pub fn node(&self, id: BoxId) -> &BoxNode<ND> {
        &self.nodes[id as usize]
    }

    /// Whether a box's payload currently occupies memory
    pub fn is_resident(&self, id: BoxId) -> bool {
        self.nodes[id as usize].is_resident()
    }

    /// Events of a leaf box, reloading through the cache if evicted
    ///
    /// The only accessor that can block on I/O.
    pub fn leaf_events(&mut self, id: BoxId) -> EngineResult<&[MdEvent<ND>]> {
        self.ensure_loaded(id)?;
        self.nodes[id as usize].loaded_events()
    }

    /// Number of boxes in the tree
    pub fn n_boxes(&self) -> usize {
        self.nodes.len()
    }

    /// Engine statistics snapshot
    pub fn stats(&self) -> EngineStats {
        let leaves = self.nodes.iter().filter(|n| n.is_leaf()).count();
        EngineStats {
            boxes: self.nodes.len(),
            leaves,
            events: self.n_events(),
            resident_cost: self.cache.resident_cost(),
            resident_boxes: self.cache.len(),
            pending_writes: self.cache.pending_len(),
            disk_blocks: self.store.block_count(),
            disk_bytes: self.store.byte_size(),
            block_reads: self.store.reads(),
            block_writes: self.store.writes(),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub boxes: usize,
    pub leaves: usize,
    pub events: u64,
    pub resident_cost: u64,
    pub resident_boxes: usize,
    pub pending_writes: usize,
    pub disk_blocks: usize,
    pub disk_bytes: u64,
    pub block_reads: u64,
    pub block_writes: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Boxes: {} ({} leaves), Events: {}, Resident: {} units in {} boxes, Pending: {}, Disk: {} blocks / {:.2} MB, I/O: {}r/{}w",
            self.boxes,
            self.leaves,
            self.events,
            self.resident_cost,
            self.resident_boxes,
            self.pending_writes,
            self.disk_blocks,
            self.disk_bytes as f64 / (1024.0 * 1024.0),
            self.block_reads,
            self.block_writes,
        )
    }
}

fn to_array<T: Copy, const N: usize>(v: Vec<T>) -> Result<[T; N], ()> {
    if v.len() != N {
        return Err(());
    }
    let mut out = [v[0]; N];
    out.copy_from_slice(&v);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn unit_extents() -> [Extent; 2] {
        [Extent::new(0.0, 1.0), Extent::new(0.0, 1.0)]
    }

    fn create_test_store(config: EngineConfig) -> EventStore<2> {
        EventStore::create(config, unit_extents()).unwrap()
    }

    /// Sum of leaf-level aggregates, for invariant checks against the root
    fn leaf_sums(store: &EventStore<2>) -> (f64, u64) {
        let mut signal = 0.0;
        let mut events = 0;
        for id in 0..store.n_boxes() as BoxId {
            let node = store.node(id);
            if node.is_leaf() {
                signal += node.signal();
                events += node.n_events();
            }
        }
        (signal, events)
    }

    #[test]
    fn test_create_empty() {
        let dir = tempdir().unwrap();
        let store = create_test_store(EngineConfig::new(dir.path()));

        let stats = store.stats();
        assert_eq!(stats.boxes, 1);
        assert_eq!(stats.events, 0);
        assert_eq!(store.signal(), 0.0);
    }

    #[test]
    fn test_split_boundary() {
        let dir = tempdir().unwrap();
        let mut store =
            create_test_store(EngineConfig::new(dir.path()).split_threshold(100));

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            store
                .add_event(MdEvent::at([rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)]))
                .unwrap();
        }
        // exactly at threshold: still a single leaf
        assert_eq!(store.n_boxes(), 1);
        assert!(store.node(store.root_id()).is_leaf());

        store
            .add_event(MdEvent::at([0.5, 0.5]))
            .unwrap();
        // one over: exactly one split into a 2x2 grid
        assert_eq!(store.n_boxes(), 5);
        assert!(!store.node(store.root_id()).is_leaf());

        let children = store.node(store.root_id()).children().unwrap().to_vec();
        assert_eq!(children.len(), 4);
        let total: u64 = children.iter().map(|&c| store.node(c).n_events()).sum();
        assert_eq!(total, 101);

        // children tile the parent: shared boundary values, corners exact
        let c0 = *store.node(children[0]).extents();
        let c1 = *store.node(children[1]).extents();
        let c3 = *store.node(children[3]).extents();
        assert_eq!(c0[0].min, 0.0);
        assert_eq!(c0[0].max, c1[0].min);
        assert_eq!(c3[0].max, 1.0);
        assert_eq!(c3[1].max, 1.0);
    }

    #[test]
    fn test_aggregate_invariant_across_splits_and_evictions() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(
            EngineConfig::new(dir.path())
                .split_threshold(100)
                .cache_budget(500)
                .flush_threshold(300),
        );

        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..10_000u32 {
            let ev = MdEvent::new(
                [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)],
                1.0 + (i % 5) as f32,
                1.0,
            );
            store.add_event(ev).unwrap();

            if i % 2500 == 0 {
                let (leaf_signal, leaf_events) = leaf_sums(&store);
                assert!((leaf_signal - store.signal()).abs() < 1e-6);
                assert_eq!(leaf_events, store.n_events());
            }
        }

        assert_eq!(store.n_events(), 10_000);
        let (leaf_signal, leaf_events) = leaf_sums(&store);
        assert!((leaf_signal - store.signal()).abs() < 1e-6);
        assert_eq!(leaf_events, 10_000);

        // every leaf respects the threshold
        for id in 0..store.n_boxes() as BoxId {
            let node = store.node(id);
            if node.is_leaf() {
                assert!(
                    node.n_events() <= 100,
                    "leaf {} holds {} events",
                    id,
                    node.n_events()
                );
            }
        }

        // memory stayed bounded
        assert!(store.stats().resident_cost <= 500);
    }

    #[test]
    fn test_lru_eviction_order() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(
            EngineConfig::new(dir.path())
                .split_threshold(2)
                .cache_budget(3),
        );

        // Four events, one per quadrant: the third add splits the root
        store.add_event(MdEvent::at([0.25, 0.25])).unwrap();
        store.add_event(MdEvent::at([0.75, 0.25])).unwrap();
        store.add_event(MdEvent::at([0.25, 0.75])).unwrap();
        store.add_event(MdEvent::at([0.75, 0.75])).unwrap();

        let children = store.node(store.root_id()).children().unwrap().to_vec();
        let (a, b, c, d) = (children[0], children[1], children[2], children[3]);
        store.flush().unwrap();

        // Touch in order A, B, C, D with budget 3: A must be the evictee
        store.leaf_events(a).unwrap();
        store.leaf_events(b).unwrap();
        store.leaf_events(c).unwrap();
        store.leaf_events(d).unwrap();

        assert!(!store.is_resident(a));
        assert!(store.is_resident(b));
        assert!(store.is_resident(c));
        assert!(store.is_resident(d));
        assert!(store.stats().resident_cost <= 3);
    }

    #[test]
    fn test_flush_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(EngineConfig::new(dir.path()));

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            store
                .add_event(MdEvent::at([rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)]))
                .unwrap();
        }

        store.flush().unwrap();
        let writes_after_first = store.stats().block_writes;
        assert!(writes_after_first > 0);

        store.flush().unwrap();
        assert_eq!(store.stats().block_writes, writes_after_first);
    }

    #[test]
    fn test_reload_after_eviction_roundtrip() {
        let dir = tempdir().unwrap();
        // Budget 0: every clean payload is evicted immediately, so each
        // access exercises the full save/evict/reload cycle
        let mut store = create_test_store(
            EngineConfig::new(dir.path())
                .split_threshold(1000)
                .cache_budget(0),
        );

        let mut rng = StdRng::seed_from_u64(11);
        let mut expected: Vec<MdEvent<2>> = (0..50)
            .map(|i| {
                MdEvent::new(
                    [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)],
                    2.0,
                    4.0,
                )
                .tagged(0, i)
            })
            .collect();
        store.add_events(&expected).unwrap();

        let root = store.root_id();
        assert!(!store.is_resident(root));

        let mut loaded = store.leaf_events(root).unwrap().to_vec();
        loaded.sort_by_key(|ev| ev.detector_id);
        expected.sort_by_key(|ev| ev.detector_id);
        assert_eq!(loaded, expected);
        assert!((store.signal() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_reject_policy_aborts_whole_batch() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(
            EngineConfig::new(dir.path()).bounds_policy(BoundsPolicy::Reject),
        );

        let batch = vec![
            MdEvent::at([0.5, 0.5]),
            MdEvent::at([0.1, 0.9]),
            MdEvent::at([1.5, 0.5]), // out of range
        ];

        let result = store.add_events(&batch);
        assert!(matches!(result, Err(EngineError::OutOfRange { dim: 0, .. })));
        // nothing applied
        assert_eq!(store.n_events(), 0);
        assert_eq!(store.signal(), 0.0);
    }

    #[test]
    fn test_clamp_policy_lands_in_edge_cell() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(EngineConfig::new(dir.path()));

        store.add_event(MdEvent::at([2.0, -1.0])).unwrap();
        assert_eq!(store.n_events(), 1);

        let events = store.leaf_events(store.root_id()).unwrap();
        assert_eq!(events[0].center, [1.0, 0.0]);
    }

    #[test]
    fn test_dim_stats_tracked_when_enabled() {
        let dir = tempdir().unwrap();
        let mut store =
            create_test_store(EngineConfig::new(dir.path()).track_dim_stats(true));

        for i in 0..4 {
            store.add_event(MdEvent::at([0.25 * i as f32, 0.5])).unwrap();
        }

        let stats = store.node(store.root_id()).dim_stats().unwrap();
        assert!((stats[0].mean().unwrap() - 0.375).abs() < 1e-6);
        assert!((stats[1].mean().unwrap() - 0.5).abs() < 1e-6);

        // disabled by default
        let dir2 = tempdir().unwrap();
        let store2 = create_test_store(EngineConfig::new(dir2.path()));
        assert!(store2.node(store2.root_id()).dim_stats().is_none());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path()).split_threshold(100);

        let (signal, n_events, n_boxes);
        {
            let mut store = EventStore::<2>::create(config.clone(), unit_extents()).unwrap();
            let mut rng = StdRng::seed_from_u64(5);
            for _ in 0..1000 {
                store
                    .add_event(MdEvent::new(
                        [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)],
                        1.5,
                        2.25,
                    ))
                    .unwrap();
            }
            signal = store.signal();
            n_events = store.n_events();
            n_boxes = store.n_boxes();
            store.close().unwrap();
        }

        {
            let mut store = EventStore::<2>::open(config.clone()).unwrap();
            assert_eq!(store.signal(), signal);
            assert_eq!(store.n_events(), n_events);
            assert_eq!(store.n_boxes(), n_boxes);

            // leaves reload on access and the invariant still holds
            let (leaf_signal, leaf_events) = leaf_sums(&store);
            assert!((leaf_signal - signal).abs() < 1e-6);
            assert_eq!(leaf_events, n_events);

            // the dataset accepts further events
            store.add_event(MdEvent::at([0.5, 0.5])).unwrap();
            assert_eq!(store.n_events(), n_events + 1);

            // payloads are really there
            let mut seen = 0;
            for id in 0..store.n_boxes() as BoxId {
                if store.node(id).is_leaf() && store.node(id).n_events() > 0 {
                    seen += store.leaf_events(id).unwrap().len();
                }
            }
            assert_eq!(seen as u64, n_events + 1);
        }
    }

    #[test]
    fn test_open_rejects_wrong_dimensionality() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path());
        {
            let store = EventStore::<2>::create(config.clone(), unit_extents()).unwrap();
            store.close().unwrap();
        }

        let result = EventStore::<3>::open(config);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_corrupted_payload_is_fatal() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path());
        {
            let mut store = EventStore::<2>::create(config.clone(), unit_extents()).unwrap();
            for i in 0..20 {
                store.add_event(MdEvent::at([0.05 * i as f32, 0.5])).unwrap();
            }
            store.close().unwrap();
        }

        // Damage the payload region of the block file
        {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(config.events_path())
                .unwrap();
            f.seek(SeekFrom::Start(40)).unwrap();
            f.write_all(&[0xAA; 8]).unwrap();
        }

        let mut store = EventStore::<2>::open(config).unwrap();
        let result = store.leaf_events(store.root_id());
        assert!(matches!(result, Err(EngineError::CorruptedCache(_))));
    }

    #[test]
    fn test_invalid_split_config() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path()).split_factor(1);
        assert!(matches!(
            EventStore::<2>::create(config, unit_extents()),
            Err(EngineError::Config(_))
        ));

        let dir2 = tempdir().unwrap();
        let config = EngineConfig::new(dir2.path()).split_per_dim(vec![2, 2, 2]);
        assert!(matches!(
            EventStore::<2>::create(config, unit_extents()),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_stats_display() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(EngineConfig::new(dir.path()));
        store.add_event(MdEvent::at([0.5, 0.5])).unwrap();

        let rendered = store.stats().to_string();
        assert!(rendered.contains("Events: 1"));
    }
}
