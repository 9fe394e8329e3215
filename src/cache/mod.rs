//! Device-resident LRU cache of kernel matrix columns
//!
//! Each SMO iteration touches at most two columns, `Q_i` and `Q_j`. The cache
//! keeps a fixed number of column buffers carved out of one contiguous device
//! region and recycles them in least-recently-used order.
//!
//! Access follows a stage/commit protocol driven by the solver controller:
//!
//! 1. `STAGE_I`: [`ColumnCache::lookup_or_reserve`] for column `i` in slot I
//! 2. `STAGE_J`: the same for column `j` in slot J
//! 3. `COMMIT`: [`ColumnCache::commit`] publishes both columns
//!
//! A staged node is unlinked from the LRU list until it is committed, so the
//! eviction walk never hands out a buffer that is being read or written.
//! Every mutation runs inside a device single-writer section (see
//! [`ColumnCache::stage`] and [`ColumnCache::commit_staged`]).

pub mod lru;

pub use self::lru::{CacheNode, LruList, NodeId};

use crate::core::{CValue, Result, SVMError};
use crate::device::{Device, DeviceBuffer};
use log::{debug, info};

/// Lower bound on the number of cached columns
pub const MIN_CACHE_COLUMNS: usize = 5;

/// One of the two staging slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSlot {
    I,
    J,
}

impl StageSlot {
    fn index(self) -> usize {
        match self {
            StageSlot::I => 0,
            StageSlot::J => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            StageSlot::I => StageSlot::J,
            StageSlot::J => StageSlot::I,
        }
    }
}

/// Outcome of staging a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staged {
    pub node: NodeId,
    /// `false` means the buffer must be filled before it is read
    pub hit: bool,
}

/// Position in the per-iteration protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    StageI,
    StageJ,
    Commit,
}

/// LRU column cache
pub struct ColumnCache {
    nodes: Vec<CacheNode>,
    lru: LruList,
    /// column -> node holding it
    table: DeviceBuffer<Option<NodeId>>,
    staging: [Option<NodeId>; 2],
    space: DeviceBuffer<CValue>,
    column_len: usize,
    state: CacheState,
    hits: u64,
    misses: u64,
}

impl ColumnCache {
    /// Number of columns a `cache_size_mb` budget buys for columns of
    /// `active_size` entries
    ///
    /// At least [`MIN_CACHE_COLUMNS`], and at most `active_size` (or the
    /// minimum, if larger): a problem has only `active_size` distinct
    /// columns, so buffers beyond that would never be filled and the rest
    /// of the budget is left unallocated.
    pub fn capacity_for(cache_size_mb: f64, active_size: usize) -> usize {
        let active_size = active_size.max(1);
        let budget_bytes = (cache_size_mb.max(0.0) * (1u64 << 20) as f64) as usize;
        let elements = budget_bytes / std::mem::size_of::<CValue>();
        let columns = elements.div_ceil(active_size).max(MIN_CACHE_COLUMNS);
        columns.min(active_size.max(MIN_CACHE_COLUMNS))
    }

    /// Allocate the column region and column table on `device`
    pub fn new(device: &Device, cache_size_mb: f64, active_size: usize) -> Result<Self> {
        if active_size == 0 {
            return Err(SVMError::InvalidParameter(
                "column cache needs a non-empty problem".to_string(),
            ));
        }

        let num_columns = Self::capacity_for(cache_size_mb, active_size);
        let elements = num_columns
            .checked_mul(active_size)
            .ok_or(SVMError::DeviceAllocation {
                requested: usize::MAX,
                available: device.properties().memory_bytes,
            })?;
        let space = device.alloc::<CValue>(elements)?;
        let table = device.alloc::<Option<NodeId>>(active_size)?;

        let mut nodes: Vec<CacheNode> = (0..num_columns)
            .map(|k| CacheNode::new(k * active_size))
            .collect();
        let mut lru = LruList::new();
        for k in 0..num_columns {
            lru.push_back(&mut nodes, NodeId(k));
        }

        info!(
            "column cache: {} columns of {} entries ({} bytes)",
            num_columns,
            active_size,
            space.size_bytes()
        );

        Ok(Self {
            nodes,
            lru,
            table,
            staging: [None, None],
            space,
            column_len: active_size,
            state: CacheState::StageI,
            hits: 0,
            misses: 0,
        })
    }

    /// Number of column buffers
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Entries per column
    pub fn column_len(&self) -> usize {
        self.column_len
    }

    /// Position in the stage I, stage J, commit cycle
    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Bookkeeping of one column buffer
    pub fn node(&self, id: NodeId) -> &CacheNode {
        &self.nodes[id.0]
    }

    /// Published nodes, most recently committed first
    pub fn lru(&self) -> &LruList {
        &self.lru
    }

    /// Node currently holding `column`, if published
    pub fn lookup(&self, column: usize) -> Option<NodeId> {
        self.table.get(column).copied().flatten()
    }

    /// Node held by `slot`
    pub fn staged(&self, slot: StageSlot) -> Option<NodeId> {
        self.staging[slot.index()]
    }

    /// Stage `column` in `slot` from the elected lane of `device`
    pub fn stage(&mut self, device: &Device, column: usize, slot: StageSlot) -> Result<Staged> {
        let operation = match slot {
            StageSlot::I => "cache_stage_i",
            StageSlot::J => "cache_stage_j",
        };
        device.single_writer(operation, || self.lookup_or_reserve(column, slot))?
    }

    /// Commit both slots from the elected lane of `device`
    pub fn commit_staged(&mut self, device: &Device, i: usize, j: usize) -> Result<usize> {
        device.single_writer("cache_commit", || self.commit(i, j))
    }

    /// Find `column` in the cache or reserve a buffer for it
    ///
    /// On a hit the cached buffer is placed in `slot` unchanged. On a miss a
    /// victim buffer is claimed for `column` and must be filled before use.
    pub fn lookup_or_reserve(&mut self, column: usize, slot: StageSlot) -> Result<Staged> {
        if column >= self.column_len {
            return Err(SVMError::InvalidParameter(format!(
                "column {column} outside a problem of {} columns",
                self.column_len
            )));
        }
        self.release_slot(slot);
        self.state = match slot {
            StageSlot::I => CacheState::StageJ,
            StageSlot::J => CacheState::Commit,
        };

        if let Some(id) = self.table[column] {
            if self.nodes[id.0].staging_owner.is_none() {
                self.nodes[id.0].in_use = true;
                if self.lru.contains(&self.nodes, id) {
                    self.lru.remove(&mut self.nodes, id);
                }
                self.staging[slot.index()] = Some(id);
                self.hits += 1;
                return Ok(Staged { node: id, hit: true });
            }
        }

        let victim = match slot {
            StageSlot::I => self.lru.tail(),
            StageSlot::J => self.lru.iter_from_tail(&self.nodes).find(|&id| {
                let node = &self.nodes[id.0];
                let claimed_elsewhere = node.staging_owner.is_some_and(|owner| owner != column);
                !claimed_elsewhere && !node.in_use
            }),
        };
        let id = victim.ok_or(SVMError::CacheExhausted { column })?;

        if let Some(old) = self.nodes[id.0].column_index {
            if self.table[old] == Some(id) {
                self.table[old] = None;
            }
        }
        let node = &mut self.nodes[id.0];
        node.staging_owner = Some(column);
        node.column_index = Some(column);
        self.lru.remove(&mut self.nodes, id);
        self.staging[slot.index()] = Some(id);
        self.misses += 1;
        Ok(Staged { node: id, hit: false })
    }

    /// Publish the columns staged for `i` (slot I) and `j` (slot J)
    ///
    /// Slots whose node no longer carries the expected column are left
    /// alone. Returns the number of slots committed.
    pub fn commit(&mut self, i: usize, j: usize) -> usize {
        let mut committed = 0;
        for (slot, column) in [(StageSlot::I, i), (StageSlot::J, j)] {
            let Some(id) = self.staging[slot.index()] else {
                continue;
            };
            if self.nodes[id.0].column_index != Some(column) {
                continue;
            }

            let node = &mut self.nodes[id.0];
            node.in_use = false;
            node.staging_owner = None;
            if self.lru.contains(&self.nodes, id) {
                self.lru.remove(&mut self.nodes, id);
            }
            self.table[column] = Some(id);
            self.lru.push_front(&mut self.nodes, id);
            self.staging[slot.index()] = None;
            committed += 1;
        }
        self.state = CacheState::StageI;
        committed
    }

    /// Buffer of the node staged in `slot`, if it holds `column`
    pub fn staged_column(&self, slot: StageSlot, column: usize) -> Option<&[CValue]> {
        let id = self.staging[slot.index()]?;
        if self.nodes[id.0].column_index != Some(column) {
            return None;
        }
        Some(self.column(id))
    }

    /// Column buffer of node `id`
    pub fn column(&self, id: NodeId) -> &[CValue] {
        let offset = self.nodes[id.0].offset;
        &self.space[offset..offset + self.column_len]
    }

    /// Mutable column buffer of node `id`, for fill passes
    pub fn column_mut(&mut self, id: NodeId) -> &mut [CValue] {
        let offset = self.nodes[id.0].offset;
        &mut self.space[offset..offset + self.column_len]
    }

    /// Fraction of stage requests served without a fill
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Hit, miss and occupancy counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            capacity: self.nodes.len(),
            size: self.table.iter().filter(|entry| entry.is_some()).count(),
        }
    }

    /// Panics if the list, the table and the staging slots disagree
    pub fn debug_validate_invariants(&self) {
        let linked: Vec<NodeId> = self.lru.iter_from_head(&self.nodes).collect();
        assert_eq!(linked.len(), self.lru.len(), "list length out of sync");
        if let Some(&first) = linked.first() {
            assert_eq!(self.nodes[first.0].prev, None, "head has a predecessor");
        }
        assert_eq!(linked.last().copied(), self.lru.tail(), "tail out of sync");

        for (k, node) in self.nodes.iter().enumerate() {
            let id = NodeId(k);
            let in_list = linked.contains(&id);
            let held = self.staging.contains(&Some(id));
            assert!(in_list != held, "node {k} linked={in_list} staged={held}");
            if in_list {
                assert!(!node.in_use && node.staging_owner.is_none(), "node {k} claimed in list");
            }
        }

        let mut seen = vec![false; self.nodes.len()];
        for (column, entry) in self.table.iter().enumerate() {
            if let Some(id) = entry {
                assert!(!seen[id.0], "node {} mapped twice", id.0);
                seen[id.0] = true;
                assert_eq!(self.nodes[id.0].column_index, Some(column), "table entry {column} stale");
            }
        }
    }

    /// Give back a node left in `slot` by an iteration that never committed
    fn release_slot(&mut self, slot: StageSlot) {
        let Some(id) = self.staging[slot.index()].take() else {
            return;
        };
        if self.staging[slot.other().index()] == Some(id) {
            return;
        }

        let node = &mut self.nodes[id.0];
        let unfilled = node.staging_owner.take().is_some();
        if unfilled {
            node.column_index = None;
        }
        node.in_use = false;
        debug!("releasing uncommitted {:?} slot (node {})", slot, id.0);
        if self.lru.contains(&self.nodes, id) {
            return;
        }
        // an unfilled buffer is the first to go; a hit was just read
        if unfilled {
            self.lru.push_back(&mut self.nodes, id);
        } else {
            self.lru.push_front(&mut self.nodes, id);
        }
    }

    #[cfg(test)]
    fn lru_order(&self) -> Vec<usize> {
        self.lru.iter_from_head(&self.nodes).map(NodeId::index).collect()
    }
}

impl std::fmt::Debug for ColumnCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnCache")
            .field("capacity", &self.nodes.len())
            .field("column_len", &self.column_len)
            .field("state", &self.state)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Column buffers
    pub capacity: usize,
    /// Columns currently published
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;

    fn device(memory_bytes: usize) -> Device {
        Device::new(&DeviceConfig {
            memory_bytes,
            threads: Some(1),
            ..DeviceConfig::default()
        })
        .expect("device")
    }

    fn small_cache(active_size: usize) -> (Device, ColumnCache) {
        let dev = device(1 << 20);
        // zero budget -> minimum capacity
        let cache = ColumnCache::new(&dev, 0.0, active_size).expect("cache");
        (dev, cache)
    }

    fn fill(cache: &mut ColumnCache, staged: Staged, column: usize) {
        for (t, v) in cache.column_mut(staged.node).iter_mut().enumerate() {
            *v = (column * 1000 + t) as CValue;
        }
    }

    /// One full iteration: stage i, stage j, fill misses, commit
    fn cycle(cache: &mut ColumnCache, i: usize, j: usize) -> (Staged, Staged) {
        let si = cache.lookup_or_reserve(i, StageSlot::I).expect("stage i");
        if !si.hit {
            fill(cache, si, i);
        }
        let sj = cache.lookup_or_reserve(j, StageSlot::J).expect("stage j");
        if !sj.hit {
            fill(cache, sj, j);
        }
        assert_eq!(cache.commit(i, j), 2);
        cache.debug_validate_invariants();
        (si, sj)
    }

    #[test]
    fn test_capacity_has_a_floor_and_a_ceiling() {
        assert_eq!(ColumnCache::capacity_for(0.0, 100), MIN_CACHE_COLUMNS);
        // 1 MiB of f32 = 262144 elements, 1000-entry columns -> 263 columns
        assert_eq!(ColumnCache::capacity_for(1.0, 1000), 263);
        // never more columns than the problem has
        assert_eq!(ColumnCache::capacity_for(100.0, 20), 20);
        assert_eq!(ColumnCache::capacity_for(100.0, 3), MIN_CACHE_COLUMNS);
    }

    #[test]
    fn test_setup_builds_full_list_and_empty_table() {
        let (dev, cache) = small_cache(16);
        assert_eq!(cache.capacity(), MIN_CACHE_COLUMNS);
        assert_eq!(cache.lru_order(), vec![0, 1, 2, 3, 4]);
        assert!((0..16).all(|c| cache.lookup(c).is_none()));
        assert_eq!(cache.state(), CacheState::StageI);
        assert!(dev.allocated_bytes() >= 5 * 16 * std::mem::size_of::<CValue>());
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let dev = device(256);
        let err = ColumnCache::new(&dev, 1.0, 1000).unwrap_err();
        assert!(matches!(err, SVMError::DeviceAllocation { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_miss_then_hit() {
        let (_dev, mut cache) = small_cache(10);
        let (si, sj) = cycle(&mut cache, 3, 7);
        assert!(!si.hit && !sj.hit);
        assert_eq!(cache.lookup(3), Some(si.node));
        assert_eq!(cache.lookup(7), Some(sj.node));

        let (si2, sj2) = cycle(&mut cache, 7, 3);
        assert!(si2.hit && sj2.hit);
        assert_eq!(si2.node, sj.node);
        assert_eq!(cache.column(si2.node)[4], 7004.0);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (2, 2, 2));
        assert!((cache.hit_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_slots_never_alias() {
        let (_dev, mut cache) = small_cache(10);
        for (i, j) in [(0, 1), (2, 3), (4, 0), (1, 5), (6, 7), (8, 9), (0, 9)] {
            let si = cache.lookup_or_reserve(i, StageSlot::I).expect("i");
            let sj = cache.lookup_or_reserve(j, StageSlot::J).expect("j");
            assert_ne!(si.node, sj.node, "i={i} j={j}");
            cache.debug_validate_invariants();
            cache.commit(i, j);
        }
    }

    #[test]
    fn test_eviction_follows_commit_order() {
        let (_dev, mut cache) = small_cache(10);
        cycle(&mut cache, 0, 1);
        cycle(&mut cache, 2, 3);
        // 4 is published last, 0 is now the oldest published column
        cycle(&mut cache, 4, 2);

        let si = cache.lookup_or_reserve(5, StageSlot::I).expect("stage");
        assert!(!si.hit);
        assert_eq!(cache.lookup(0), None, "oldest column evicted");
        assert!(cache.lookup(1).is_some());
        assert!(cache.lookup(4).is_some());
    }

    #[test]
    fn test_commit_moves_nodes_to_head() {
        let (_dev, mut cache) = small_cache(10);
        let (si, sj) = cycle(&mut cache, 0, 1);
        let order = cache.lru_order();
        assert_eq!(order[0], sj.node.index());
        assert_eq!(order[1], si.node.index());
        assert_eq!(cache.lru().tail().map(NodeId::index), order.last().copied());
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (_dev, mut cache) = small_cache(10);
        cycle(&mut cache, 1, 2);
        let order = cache.lru_order();
        assert_eq!(cache.commit(1, 2), 0);
        assert_eq!(cache.lru_order(), order);
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_commit_skips_mismatched_slots() {
        let (_dev, mut cache) = small_cache(10);
        let si = cache.lookup_or_reserve(1, StageSlot::I).expect("i");
        let sj = cache.lookup_or_reserve(2, StageSlot::J).expect("j");
        assert_eq!(cache.commit(1, 9), 1);
        assert_eq!(cache.lookup(1), Some(si.node));
        assert_eq!(cache.lookup(2), None);
        assert_eq!(cache.staged(StageSlot::J), Some(sj.node));
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_abandoned_slot_is_released_on_restage() {
        let (_dev, mut cache) = small_cache(10);
        let first = cache.lookup_or_reserve(4, StageSlot::I).expect("i");
        assert_eq!(cache.lru().len(), MIN_CACHE_COLUMNS - 1);

        // the iteration stops before commit; restaging slot I returns the
        // unfilled buffer to the tail, where the miss picks it up again
        let second = cache.lookup_or_reserve(6, StageSlot::I).expect("i again");
        assert_eq!(first.node, second.node);
        assert_eq!(cache.node(second.node).column_index(), Some(6));
        assert_eq!(cache.lookup(4), None);
        assert_eq!(cache.lru().len(), MIN_CACHE_COLUMNS - 1);
        cache.debug_validate_invariants();

        let sj = cache.lookup_or_reserve(7, StageSlot::J).expect("j");
        cache.lookup_or_reserve(8, StageSlot::J).expect("j again");
        assert_eq!(cache.node(sj.node).column_index(), Some(8));
        assert_eq!(cache.commit(6, 8), 2);
        assert_eq!(cache.lookup(7), None);
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_abandoned_hit_keeps_its_column() {
        let (_dev, mut cache) = small_cache(10);
        cycle(&mut cache, 1, 2);
        let hit = cache.lookup_or_reserve(1, StageSlot::I).expect("hit");
        assert!(hit.hit);
        cache.lookup_or_reserve(3, StageSlot::I).expect("restage");
        assert_eq!(cache.lookup(1), Some(hit.node));
        assert_eq!(cache.node(hit.node).column_index(), Some(1));
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_staged_column_checks_the_column() {
        let (_dev, mut cache) = small_cache(6);
        let si = cache.lookup_or_reserve(2, StageSlot::I).expect("i");
        fill(&mut cache, si, 2);
        assert_eq!(cache.staged_column(StageSlot::I, 2).map(|c| c[1]), Some(2001.0));
        assert!(cache.staged_column(StageSlot::I, 3).is_none());
        assert!(cache.staged_column(StageSlot::J, 2).is_none());
    }

    #[test]
    fn test_same_column_in_both_slots() {
        let (_dev, mut cache) = small_cache(6);
        cycle(&mut cache, 2, 3);
        let si = cache.lookup_or_reserve(2, StageSlot::I).expect("i");
        let sj = cache.lookup_or_reserve(2, StageSlot::J).expect("j");
        assert!(si.hit && sj.hit);
        assert_eq!(si.node, sj.node);
        assert_eq!(cache.commit(2, 2), 2);
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_out_of_range_column_is_rejected() {
        let (_dev, mut cache) = small_cache(4);
        assert!(cache.lookup_or_reserve(4, StageSlot::I).is_err());
    }

    #[test]
    fn test_stage_runs_in_single_writer_sections() {
        let (dev, mut cache) = small_cache(8);
        cache.stage(&dev, 1, StageSlot::I).expect("i");
        cache.stage(&dev, 2, StageSlot::J).expect("j");
        assert_eq!(cache.commit_staged(&dev, 1, 2).expect("commit"), 2);
        assert_eq!(dev.pass_count("cache_stage_i"), 1);
        assert_eq!(dev.pass_count("cache_stage_j"), 1);
        assert_eq!(dev.pass_count("cache_commit"), 1);
    }

    #[test]
    fn test_state_machine_advances() {
        let (_dev, mut cache) = small_cache(8);
        cache.lookup_or_reserve(0, StageSlot::I).expect("i");
        assert_eq!(cache.state(), CacheState::StageJ);
        cache.lookup_or_reserve(1, StageSlot::J).expect("j");
        assert_eq!(cache.state(), CacheState::Commit);
        cache.commit(0, 1);
        assert_eq!(cache.state(), CacheState::StageI);
    }
}
