//! Arena-backed aggregation tree for pivoted views.
//!
//! Node 0 is the root ("Total"). Every node keeps, per column slot, the set
//! of live keys grouped under it and one [`AggCell`] per aggregate. A row is
//! added to or retracted from every node on its root path, so restoring the
//! aggregate invariant after a change only touches those paths.

use super::aggregate::{AggCell, BoundAgg};
use super::symbol::Symbol;
use super::types::{FastHashSet, FastIndexMap, FastMap, Scalar};
use smallvec::SmallVec;
use std::cmp::Ordering;

pub type NodeId = usize;
pub type GroupPath = SmallVec<[Scalar; 4]>;

pub const ROOT: NodeId = 0;
/// Slot holding aggregates over every column path.
pub const TOTAL_SLOT: usize = 0;

#[derive(Clone, Debug, Default)]
pub struct SlotState {
    pub rows: FastHashSet<Symbol>,
    pub cells: Vec<AggCell>,
}

#[derive(Clone, Debug, Default)]
pub struct Node {
    pub value: Scalar,
    pub depth: usize,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    child_index: FastMap<Scalar, NodeId>,
    pub seq: u64,
    pub expanded: bool,
    /// Primary key of a per-row leaf (grouped-by-primary-key views only).
    pub leaf_key: Option<Symbol>,
    slots: Vec<SlotState>,
    alive: bool,
}

impl Node {
    pub fn rows(&self, slot: usize) -> Option<&FastHashSet<Symbol>> {
        self.slots.get(slot).map(|s| &s.rows)
    }

    pub fn row_count(&self) -> usize {
        self.rows(TOTAL_SLOT).map(|r| r.len()).unwrap_or(0)
    }

    pub fn cell(&self, slot: usize, agg: usize) -> Option<&AggCell> {
        self.slots.get(slot).and_then(|s| s.cells.get(agg))
    }
}

/// Outcome of [`AggTree::finalize`].
#[derive(Debug, Default)]
pub struct Finalized {
    pub pruned: usize,
    /// Parents whose child list gained, lost or reordered members.
    pub relayout: Vec<NodeId>,
}

#[derive(Debug)]
pub struct AggTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    slot_paths: FastIndexMap<GroupPath, ()>,
    num_aggs: usize,
    expand_depth: Option<usize>,
    next_seq: u64,
    touched: FastHashSet<NodeId>,
    resort: FastHashSet<NodeId>,
    relayout: FastHashSet<NodeId>,
}

impl AggTree {
    pub fn new(num_aggs: usize, expand_depth: Option<usize>) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            slot_paths: FastIndexMap::default(),
            num_aggs,
            expand_depth,
            next_seq: 0,
            touched: FastHashSet::default(),
            resort: FastHashSet::default(),
            relayout: FastHashSet::default(),
        };
        tree.slot_paths.insert(GroupPath::new(), ());
        let root = tree.alloc(Scalar::str("Total"), 0, None, None);
        debug_assert_eq!(root, ROOT);
        tree
    }

    fn alloc(
        &mut self,
        value: Scalar,
        depth: usize,
        parent: Option<NodeId>,
        leaf_key: Option<Symbol>,
    ) -> NodeId {
        let node = Node {
            value,
            depth,
            parent,
            seq: self.next_seq,
            expanded: self.expand_depth.map_or(true, |d| depth < d),
            leaf_key,
            alive: true,
            ..Node::default()
        };
        self.next_seq += 1;
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).filter(|n| n.alive)
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].row_count() == 0
    }

    pub fn slot_path(&self, slot: usize) -> Option<&GroupPath> {
        self.slot_paths.get_index(slot).map(|(p, _)| p)
    }

    /// Slot id for a column path, registering it on first use.
    pub fn slot_for(&mut self, path: GroupPath) -> usize {
        self.slot_paths.insert_full(path, ()).0
    }

    pub fn slot_of(&self, path: &GroupPath) -> Option<usize> {
        self.slot_paths.get_index_of(path)
    }

    /// Column slots (total excluded) that hold at least one row, ordered by path.
    pub fn live_slots(&self) -> Vec<usize> {
        let root = &self.nodes[ROOT];
        let mut slots: Vec<usize> = (1..self.slot_paths.len())
            .filter(|s| root.rows(*s).map_or(false, |r| !r.is_empty()))
            .collect();
        slots.sort_by(|a, b| self.slot_path(*a).cmp(&self.slot_path(*b)));
        slots
    }

    pub fn child(&self, parent: NodeId, value: &Scalar) -> Option<NodeId> {
        self.nodes[parent].child_index.get(value).copied()
    }

    /// Node for a row path, if every level exists.
    pub fn find(&self, path: &[Scalar]) -> Option<NodeId> {
        let mut id = ROOT;
        for v in path {
            id = self.child(id, v)?;
        }
        Some(id)
    }

    /// Group values from the root down to `id`, root excluded.
    pub fn path_of(&self, id: NodeId) -> GroupPath {
        let mut path = GroupPath::new();
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            path.push(self.nodes[cur].value.clone());
            cur = parent;
        }
        path.reverse();
        path
    }

    /// Add a row under `path`, creating missing groups.
    ///
    /// `leaf_key` marks the last level as a per-row leaf. Returns the nodes
    /// on the root path, root first.
    pub fn add_row(
        &mut self,
        key: Symbol,
        path: &[Scalar],
        leaf_key: Option<Symbol>,
        slot: usize,
        row: &[Scalar],
        aggs: &[BoundAgg],
    ) -> SmallVec<[NodeId; 8]> {
        let mut visited = SmallVec::new();
        let mut id = ROOT;
        self.add_to_node(id, key, slot, row, aggs);
        visited.push(id);
        for (depth, v) in path.iter().enumerate() {
            id = match self.child(id, v) {
                Some(child) => child,
                None => {
                    let leaf = if depth + 1 == path.len() { leaf_key } else { None };
                    let child = self.alloc(v.clone(), depth + 1, Some(id), leaf);
                    let parent = &mut self.nodes[id];
                    parent.children.push(child);
                    parent.child_index.insert(v.clone(), child);
                    self.resort.insert(id);
                    self.relayout.insert(id);
                    child
                }
            };
            self.add_to_node(id, key, slot, row, aggs);
            visited.push(id);
        }
        visited
    }

    /// Retract a row from the groups on `path`. Levels that do not exist are
    /// skipped, so retracting a row that was never added is a no-op.
    pub fn retract_row(
        &mut self,
        key: Symbol,
        path: &[Scalar],
        slot: usize,
        row: &[Scalar],
        aggs: &[BoundAgg],
    ) -> SmallVec<[NodeId; 8]> {
        let mut visited = SmallVec::new();
        let mut id = ROOT;
        if !self.retract_from_node(id, key, slot, row, aggs) {
            return visited;
        }
        visited.push(id);
        for v in path {
            id = match self.child(id, v) {
                Some(child) => child,
                None => break,
            };
            if !self.retract_from_node(id, key, slot, row, aggs) {
                break;
            }
            visited.push(id);
        }
        visited
    }

    fn ensure_slot(&mut self, id: NodeId, slot: usize) {
        let num_aggs = self.num_aggs;
        let node = &mut self.nodes[id];
        while node.slots.len() <= slot {
            node.slots.push(SlotState {
                rows: FastHashSet::default(),
                cells: vec![AggCell::default(); num_aggs],
            });
        }
    }

    fn add_to_node(&mut self, id: NodeId, key: Symbol, slot: usize, row: &[Scalar], aggs: &[BoundAgg]) {
        self.ensure_slot(id, slot);
        let node = &mut self.nodes[id];
        for s in slot_pair(slot) {
            let state = &mut node.slots[s];
            if state.rows.insert(key) {
                for (cell, agg) in state.cells.iter_mut().zip(aggs) {
                    cell.add(agg.func, agg.cell(row));
                }
            }
        }
        self.mark_touched(id);
    }

    fn retract_from_node(
        &mut self,
        id: NodeId,
        key: Symbol,
        slot: usize,
        row: &[Scalar],
        aggs: &[BoundAgg],
    ) -> bool {
        let node = &mut self.nodes[id];
        let mut found = false;
        for s in slot_pair(slot) {
            let Some(state) = node.slots.get_mut(s) else {
                continue;
            };
            if state.rows.remove(&key) {
                found = true;
                for (cell, agg) in state.cells.iter_mut().zip(aggs) {
                    cell.retract(agg.func, agg.cell(row));
                }
            }
        }
        if found {
            self.mark_touched(id);
        }
        found
    }

    fn mark_touched(&mut self, id: NodeId) {
        self.touched.insert(id);
        if let Some(parent) = self.nodes[id].parent {
            self.resort.insert(parent);
        }
    }

    /// Prune emptied groups, recompute dirty cells and re-sort the siblings
    /// whose membership or sort keys changed.
    ///
    /// `read` fetches one cell of a live key in the view's row layout.
    pub fn finalize<R, C>(&mut self, aggs: &[BoundAgg], read: R, cmp: C) -> Finalized
    where
        R: Fn(Symbol, usize) -> Scalar,
        C: Fn(&AggTree, &Node, &Node) -> Ordering,
    {
        let mut touched: Vec<NodeId> = self.touched.drain().collect();
        // deepest first so children go before their parents
        touched.sort_by(|a, b| self.nodes[*b].depth.cmp(&self.nodes[*a].depth));

        let mut pruned = 0;
        for &id in &touched {
            let node = &self.nodes[id];
            if id != ROOT && node.alive && node.row_count() == 0 {
                pruned += self.prune(id);
            }
        }

        for &id in &touched {
            if !self.nodes[id].alive {
                continue;
            }
            self.recompute_dirty(id, aggs, &read);
        }

        let resort: Vec<NodeId> = self.resort.drain().collect();
        for id in resort {
            if self.nodes[id].alive && self.nodes[id].children.len() > 1 {
                let mut kids = self.nodes[id].children.clone();
                let this: &AggTree = self;
                kids.sort_by(|a, b| {
                    let (na, nb) = (&this.nodes[*a], &this.nodes[*b]);
                    cmp(this, na, nb).then(na.seq.cmp(&nb.seq))
                });
                if kids != self.nodes[id].children {
                    self.nodes[id].children = kids;
                    self.relayout.insert(id);
                }
            }
        }
        Finalized {
            pruned,
            relayout: self.relayout.drain().collect(),
        }
    }

    fn recompute_dirty<R>(&mut self, id: NodeId, aggs: &[BoundAgg], read: &R)
    where
        R: Fn(Symbol, usize) -> Scalar,
    {
        let mut values = Vec::new();
        for state in self.nodes[id].slots.iter_mut() {
            for (cell, agg) in state.cells.iter_mut().zip(aggs) {
                if !cell.is_dirty() {
                    continue;
                }
                values.clear();
                if let Some(col) = agg.column {
                    values.extend(state.rows.iter().map(|k| read(*k, col)));
                }
                cell.rescan(agg.func, &values);
            }
        }
    }

    fn prune(&mut self, id: NodeId) -> usize {
        if let Some(parent) = self.nodes[id].parent {
            let value = self.nodes[id].value.clone();
            let p = &mut self.nodes[parent];
            p.children.retain(|c| *c != id);
            p.child_index.remove(&value);
            self.relayout.insert(parent);
        }
        let mut stack = vec![id];
        let mut count = 0;
        while let Some(n) = stack.pop() {
            let node = std::mem::take(&mut self.nodes[n]);
            stack.extend(node.children);
            self.touched.remove(&n);
            self.resort.remove(&n);
            self.relayout.remove(&n);
            self.free.push(n);
            count += 1;
        }
        count
    }

    pub fn expand(&mut self, id: NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(n) if n.alive && !n.expanded && !n.children.is_empty() => {
                n.expanded = true;
                true
            }
            _ => false,
        }
    }

    pub fn collapse(&mut self, id: NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(n) if n.alive && n.expanded => {
                n.expanded = false;
                true
            }
            _ => false,
        }
    }

    /// Expand every node shallower than `depth`, collapse the rest.
    pub fn set_depth(&mut self, depth: usize) -> bool {
        self.expand_depth = Some(depth);
        let mut changed = false;
        for n in self.nodes.iter_mut().filter(|n| n.alive) {
            let want = n.depth < depth;
            if n.expanded != want {
                n.expanded = want;
                changed = true;
            }
        }
        changed
    }

    /// Depth-first visit of `start` and its descendants in sibling order.
    /// Children are skipped when `visit` returns false.
    pub fn walk_from(&self, start: NodeId, mut visit: impl FnMut(NodeId, &Node) -> bool) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if visit(id, node) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
    }
}

#[inline]
fn slot_pair(slot: usize) -> SmallVec<[usize; 2]> {
    if slot == TOTAL_SLOT {
        SmallVec::from_slice(&[TOTAL_SLOT])
    } else {
        SmallVec::from_slice(&[TOTAL_SLOT, slot])
    }
}
