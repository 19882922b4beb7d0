use super::{classify, ContextOps, DeltaTracker, TraversalRow};
use crate::engine::aggregate::BoundAgg;
use crate::engine::extents::Extent;
use crate::engine::operators::{passes_all, Predicate};
use crate::engine::state::{MasterState, StepDelta};
use crate::engine::symbol::Symbol;
use crate::engine::traversal::TreeTraversal;
use crate::engine::tree::{AggTree, Finalized, GroupPath, Node, NodeId, TOTAL_SLOT};
use crate::engine::types::{compare_scalars, DType, FastHashSet, Operation, Scalar, Schema, Transition};
use crate::engine::view_config::{ContextConfig, ContextKind, RowLayout, SortDirection};
use crate::error::EngineError;
use smol_str::SmolStr;
use std::cmp::Ordering;
use tracing::{debug, trace};

pub const ROW_PATH_COLUMN: &str = "__ROW_PATH__";

#[derive(Clone, Copy, Debug)]
enum SortTarget {
    Aggregate(usize),
    /// Group value at every level.
    Label,
    /// Group value of the nodes at one depth.
    Level(usize),
}

#[derive(Clone, Debug)]
struct OutputColumn {
    name: SmolStr,
    slot: usize,
    /// `None` for the row-path label column.
    agg: Option<usize>,
}

/// Row-pivoted view, optionally column-pivoted or grouped down to each
/// primary key.
#[derive(Debug)]
pub struct PivotContext {
    config: ContextConfig,
    kind: ContextKind,
    layout: RowLayout,
    predicates: Vec<Predicate>,
    row_pivots: Vec<usize>,
    column_pivots: Vec<usize>,
    aggs: Vec<BoundAgg>,
    sort: Vec<(SortTarget, SortDirection)>,
    tree: AggTree,
    traversal: TreeTraversal,
    outputs: Vec<OutputColumn>,
    /// Column slots the outputs were last built from.
    output_slots: Vec<usize>,
    deltas: DeltaTracker,
    changed_nodes: FastHashSet<NodeId>,
    initialized: bool,
}

impl PivotContext {
    pub fn new(config: ContextConfig, kind: ContextKind, schema: &Schema) -> Result<Self, EngineError> {
        let layout = RowLayout::new(schema, &config.computed_columns)?;
        let resolve_pivot = |name: &SmolStr| {
            layout
                .resolve(name)
                .ok_or_else(|| EngineError::UnknownColumn(name.clone()))
        };
        let row_pivots = config
            .row_pivots
            .iter()
            .map(resolve_pivot)
            .collect::<Result<Vec<_>, _>>()?;
        let column_pivots = config
            .column_pivots
            .iter()
            .map(resolve_pivot)
            .collect::<Result<Vec<_>, _>>()?;
        let predicates = config
            .filters
            .iter()
            .map(|f| Predicate::new(layout.resolve(&f.column), f.op, &f.value))
            .collect();
        let aggs: Vec<BoundAgg> = config
            .aggregates
            .iter()
            .map(|a| BoundAgg::bind(a, &layout))
            .collect();
        let sort = config
            .sort
            .iter()
            .map(|s| {
                let target = if let Some(i) = aggs.iter().position(|a| a.name == s.column) {
                    SortTarget::Aggregate(i)
                } else if s.column == ROW_PATH_COLUMN {
                    SortTarget::Label
                } else if let Some(level) = config.row_pivots.iter().position(|p| *p == s.column) {
                    SortTarget::Level(level + 1)
                } else if kind == ContextKind::GroupedByPrimaryKey
                    && layout.resolve(&s.column) == Some(schema.index_column())
                {
                    SortTarget::Level(config.row_pivots.len() + 1)
                } else {
                    return Err(EngineError::UnknownColumn(s.column.clone()));
                };
                Ok((target, s.direction))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let tree = AggTree::new(aggs.len(), config.expand_depth);

        let mut ctx = Self {
            config,
            kind,
            layout,
            predicates,
            row_pivots,
            column_pivots,
            aggs,
            sort,
            tree,
            traversal: TreeTraversal::default(),
            outputs: Vec::new(),
            output_slots: Vec::new(),
            deltas: DeltaTracker::default(),
            changed_nodes: FastHashSet::default(),
            initialized: false,
        };
        ctx.traversal.rebuild(&ctx.tree);
        ctx.refresh_outputs();
        Ok(ctx)
    }

    fn row_path(&self, row: &[Scalar]) -> GroupPath {
        let mut path: GroupPath = self
            .row_pivots
            .iter()
            .map(|c| row.get(*c).cloned().unwrap_or_default().normalized())
            .collect();
        if self.kind == ContextKind::GroupedByPrimaryKey {
            let index = self.layout.schema().index_column();
            path.push(row.get(index).cloned().unwrap_or_default());
        }
        path
    }

    fn column_path(&self, row: &[Scalar]) -> GroupPath {
        self.column_pivots
            .iter()
            .map(|c| row.get(*c).cloned().unwrap_or_default().normalized())
            .collect()
    }

    fn add(&mut self, key: Symbol, row: &[Scalar]) {
        let path = self.row_path(row);
        let slot = if self.column_pivots.is_empty() {
            TOTAL_SLOT
        } else {
            let cpath = self.column_path(row);
            self.tree.slot_for(cpath)
        };
        let leaf = (self.kind == ContextKind::GroupedByPrimaryKey).then_some(key);
        let visited = self.tree.add_row(key, &path, leaf, slot, row, &self.aggs);
        self.changed_nodes.extend(visited);
    }

    fn retract(&mut self, key: Symbol, row: &[Scalar]) {
        let path = self.row_path(row);
        let slot = if self.column_pivots.is_empty() {
            Some(TOTAL_SLOT)
        } else {
            self.tree.slot_of(&self.column_path(row))
        };
        let Some(slot) = slot else {
            return;
        };
        let visited = self.tree.retract_row(key, &path, slot, row, &self.aggs);
        self.changed_nodes.extend(visited);
    }

    fn finalize(&mut self, state: &MasterState) -> Finalized {
        let layout = &self.layout;
        let aggs = &self.aggs;
        let sort = &self.sort;
        let read = |key: Symbol, col: usize| layout.read_cell(state, key, col);
        let cmp = |_: &AggTree, a: &Node, b: &Node| -> Ordering {
            for (target, dir) in sort {
                let ord = match target {
                    SortTarget::Aggregate(i) => {
                        let va = a.cell(TOTAL_SLOT, *i).map(|c| c.value(&aggs[*i])).unwrap_or_default();
                        let vb = b.cell(TOTAL_SLOT, *i).map(|c| c.value(&aggs[*i])).unwrap_or_default();
                        compare_scalars(&va, &vb)
                    }
                    SortTarget::Label => compare_scalars(&a.value, &b.value),
                    SortTarget::Level(depth) if a.depth == *depth => compare_scalars(&a.value, &b.value),
                    SortTarget::Level(_) => Ordering::Equal,
                };
                let ord = match dir {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        };
        self.tree.finalize(aggs, read, cmp)
    }

    /// Rebuild the output columns when the set of live column groups changed.
    fn refresh_outputs(&mut self) {
        let slots = if self.column_pivots.is_empty() {
            vec![TOTAL_SLOT]
        } else {
            self.tree.live_slots()
        };
        if !self.outputs.is_empty() && slots == self.output_slots {
            return;
        }
        self.outputs.clear();
        self.outputs.push(OutputColumn {
            name: SmolStr::new(ROW_PATH_COLUMN),
            slot: TOTAL_SLOT,
            agg: None,
        });
        for &slot in &slots {
            let prefix = self.tree.slot_path(slot).map(|p| {
                p.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("|")
            });
            for (i, agg) in self.aggs.iter().enumerate() {
                let name = match &prefix {
                    Some(p) if slot != TOTAL_SLOT => SmolStr::from(format!("{}|{}", p, agg.name)),
                    _ => agg.name.clone(),
                };
                self.outputs.push(OutputColumn {
                    name,
                    slot,
                    agg: Some(i),
                });
            }
        }
        self.output_slots = slots;
    }

    /// Expand the node shown at `row`.
    pub fn expand(&mut self, row: usize) -> bool {
        let Some(id) = self.traversal.node_at(row) else {
            return false;
        };
        let changed = self.tree.expand(id);
        if changed {
            self.traversal.relayout(&self.tree, [id]);
        }
        changed
    }

    pub fn collapse(&mut self, row: usize) -> bool {
        let Some(id) = self.traversal.node_at(row) else {
            return false;
        };
        let changed = self.tree.collapse(id);
        if changed {
            self.traversal.relayout(&self.tree, [id]);
        }
        changed
    }

    /// Expand every level shallower than `depth` and collapse the rest.
    pub fn set_depth(&mut self, depth: usize) -> bool {
        let changed = self.tree.set_depth(depth);
        if changed {
            self.traversal.rebuild(&self.tree);
        }
        changed
    }

    /// Group values from the root to the node at `row`.
    pub fn row_path_at(&self, row: usize) -> Option<GroupPath> {
        self.traversal.node_at(row).map(|id| self.tree.path_of(id))
    }

    fn render_node(&self, state: &MasterState, node: &Node, cols: Extent, out: &mut Vec<Scalar>) {
        for col in &self.outputs[cols.start..cols.end] {
            let value = match col.agg {
                None => node.value.clone(),
                Some(i) => match node.leaf_key {
                    Some(key) => self.aggs[i]
                        .column
                        .map(|c| self.layout.read_cell(state, key, c))
                        .unwrap_or_default(),
                    None => match node.rows(col.slot) {
                        Some(rows) if !rows.is_empty() => node
                            .cell(col.slot, i)
                            .map(|c| c.value(&self.aggs[i]))
                            .unwrap_or_default(),
                        _ => Scalar::None,
                    },
                },
            };
            out.push(value);
        }
    }
}

impl ContextOps for PivotContext {
    fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn init(&mut self, state: &MasterState) {
        for key in state.keys() {
            if let Some(row) = self.layout.read(state, key) {
                if passes_all(&self.predicates, &row) {
                    self.add(key, &row);
                }
            }
        }
        self.finalize(state);
        self.changed_nodes.clear();
        self.traversal.rebuild(&self.tree);
        self.refresh_outputs();
        self.initialized = true;
    }

    fn deltas(&self) -> &DeltaTracker {
        &self.deltas
    }

    fn deltas_mut(&mut self) -> &mut DeltaTracker {
        &mut self.deltas
    }

    fn step_begin(&mut self) {
        if self.initialized {
            self.deltas.clear();
            self.changed_nodes.clear();
        }
    }

    fn notify(&mut self, step: &StepDelta, _state: &MasterState) {
        for (i, flat) in step.flattened.iter().enumerate() {
            let op = classify(flat.op);
            if op == Operation::Delete {
                self.deltas.force();
            }
            let prev = step.prev[i].clone().map(|r| self.layout.extend(r));
            let curr = step.curr[i].clone().map(|r| self.layout.extend(r));
            let prev_pass = prev.as_deref().map_or(false, |r| passes_all(&self.predicates, r));
            let curr_pass = curr.as_deref().map_or(false, |r| passes_all(&self.predicates, r));
            if !prev_pass && !curr_pass {
                continue;
            }
            self.deltas.track(flat.pkey);
            if step.transitions[i] == Transition::Unchanged {
                continue;
            }
            trace!(key = flat.pkey.id(), ?op, "Pivot notify");
            if let (true, Some(row)) = (prev_pass, prev.as_deref()) {
                self.retract(flat.pkey, row);
            }
            if let (true, Some(row)) = (curr_pass, curr.as_deref()) {
                self.add(flat.pkey, row);
            }
        }
    }

    fn step_end(&mut self, state: &MasterState) {
        let Finalized { pruned, relayout } = self.finalize(state);
        self.traversal.relayout(&self.tree, relayout);
        self.refresh_outputs();
        debug!(
            kind = ?self.kind,
            nodes = self.tree.len(),
            pruned,
            walked = self.traversal.last_walked(),
            rows = self.traversal.len(),
            changed = self.deltas.len(),
            "Pivot context step_end"
        );
    }

    fn get_row_count(&self) -> usize {
        self.traversal.len()
    }

    fn get_column_count(&self) -> usize {
        self.outputs.len()
    }

    fn get_column_names(&self) -> Vec<SmolStr> {
        self.outputs.iter().map(|c| c.name.clone()).collect()
    }

    fn get_column_dtype(&self, col: usize) -> DType {
        match self.outputs.get(col) {
            Some(OutputColumn { agg: None, .. }) => DType::Str,
            Some(OutputColumn { agg: Some(i), .. }) => self.aggs[*i].output_dtype(),
            None => DType::None,
        }
    }

    fn render_cells(
        &self,
        state: &MasterState,
        row: usize,
        cols: Extent,
        out: &mut Vec<Scalar>,
    ) -> bool {
        match self.traversal.node_at(row) {
            Some(id) => {
                self.render_node(state, self.tree.node(id), cols, out);
                true
            }
            None => false,
        }
    }

    fn row_of_key(&self, state: &MasterState, key: Symbol) -> Option<usize> {
        let row = self.layout.read(state, key)?;
        if !passes_all(&self.predicates, &row) {
            return None;
        }
        let node = self.tree.find(&self.row_path(&row))?;
        self.traversal.position(node)
    }

    fn traversal_row(&self, _state: &MasterState, row: usize) -> Option<TraversalRow> {
        let node = self.tree.node(self.traversal.node_at(row)?);
        Some(TraversalRow {
            depth: node.depth,
            expanded: node.expanded,
            has_children: !node.children.is_empty(),
            key: node.leaf_key,
        })
    }

    fn changed_rows(&mut self, _state: &MasterState, _keys: Vec<Symbol>) -> Vec<usize> {
        let mut rows: Vec<usize> = self
            .changed_nodes
            .drain()
            .filter(|id| self.tree.get(*id).is_some())
            .filter_map(|id| self.traversal.position(id))
            .collect();
        rows.sort_unstable();
        rows
    }

    fn get_pkeys(
        &self,
        state: &MasterState,
        cells: &[(usize, usize)],
    ) -> Result<Vec<Scalar>, EngineError> {
        let index = self.layout.schema().index_column();
        let mut keys: FastHashSet<Symbol> = FastHashSet::default();
        for &(row, col) in cells {
            let Some(id) = self.traversal.node_at(row) else {
                continue;
            };
            let slot = self.outputs.get(col).map_or(TOTAL_SLOT, |c| c.slot);
            if let Some(rows) = self.tree.node(id).rows(slot) {
                keys.extend(rows.iter().copied());
            }
        }
        let mut keys: Vec<Symbol> = keys.into_iter().collect();
        keys.sort_by_key(|k| state.position_of(*k).unwrap_or(usize::MAX));
        Ok(keys
            .into_iter()
            .map(|k| state.read_value(k, index).cloned().unwrap_or_default())
            .collect())
    }

    fn sidedness(&self) -> u8 {
        match self.kind {
            ContextKind::GroupedByTwo => 2,
            _ => 1,
        }
    }

    fn reset(&mut self) {
        self.deltas.clear();
        self.changed_nodes.clear();
        self.tree = AggTree::new(self.aggs.len(), self.config.expand_depth);
        self.traversal.rebuild(&self.tree);
        // slot ids are per tree
        self.outputs.clear();
        self.refresh_outputs();
        self.initialized = false;
    }
}
