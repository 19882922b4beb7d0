use super::{classify, ContextOps, DeltaTracker, TraversalRow};
use crate::engine::extents::Extent;
use crate::engine::operators::{passes_all, Predicate};
use crate::engine::state::{MasterState, StepDelta};
use crate::engine::symbol::Symbol;
use crate::engine::traversal::{FlatTraversal, SortKey};
use crate::engine::types::{DType, Operation, Scalar, Schema};
use crate::engine::view_config::{ContextConfig, ContextKind, RowLayout};
use crate::error::EngineError;
use smol_str::SmolStr;
use tracing::debug;

/// Unpivoted view with filters, sort, projection and computed columns.
#[derive(Debug)]
pub struct FlatContext {
    config: ContextConfig,
    layout: RowLayout,
    predicates: Vec<Predicate>,
    /// Output column name and its position in the row layout.
    outputs: Vec<(SmolStr, Option<usize>)>,
    sort_columns: Vec<Option<usize>>,
    traversal: FlatTraversal,
    deltas: DeltaTracker,
    initialized: bool,
}

impl FlatContext {
    pub fn new(config: ContextConfig, schema: &Schema) -> Result<Self, EngineError> {
        let layout = RowLayout::new(schema, &config.computed_columns)?;
        let predicates = config
            .filters
            .iter()
            .map(|f| Predicate::new(layout.resolve(&f.column), f.op, &f.value))
            .collect();

        let mut outputs: Vec<(SmolStr, Option<usize>)> = if config.columns.is_empty() {
            schema
                .column_names()
                .into_iter()
                .enumerate()
                .map(|(i, n)| (n, Some(i)))
                .collect()
        } else {
            config
                .columns
                .iter()
                .map(|n| (n.clone(), layout.resolve(n)))
                .collect()
        };
        for c in &config.computed_columns {
            if !outputs.iter().any(|(n, _)| *n == c.name) {
                outputs.push((c.name.clone(), layout.resolve(&c.name)));
            }
        }

        let sort_columns = config.sort.iter().map(|s| layout.resolve(&s.column)).collect();
        let traversal = FlatTraversal::new(config.sort.iter().map(|s| s.direction));

        Ok(Self {
            config,
            layout,
            predicates,
            outputs,
            sort_columns,
            traversal,
            deltas: DeltaTracker::default(),
            initialized: false,
        })
    }

    fn sort_key(&self, row: &[Scalar]) -> SortKey {
        self.sort_columns
            .iter()
            .map(|c| c.and_then(|c| row.get(c)).cloned().unwrap_or_default())
            .collect()
    }

    fn passes(&self, row: &[Scalar]) -> bool {
        passes_all(&self.predicates, row)
    }

    fn place(&mut self, key: Symbol, row: &[Scalar], state: &MasterState) {
        let ordinal = state.ordinal(key).unwrap_or(u64::MAX);
        let sort = self.sort_key(row);
        self.traversal.upsert(key, sort, ordinal);
    }
}

impl ContextOps for FlatContext {
    fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn kind(&self) -> ContextKind {
        ContextKind::Flat
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn init(&mut self, state: &MasterState) {
        self.traversal.clear();
        for key in state.keys() {
            if let Some(row) = self.layout.read(state, key) {
                if self.passes(&row) {
                    self.place(key, &row, state);
                }
            }
        }
        self.initialized = true;
    }

    fn deltas(&self) -> &DeltaTracker {
        &self.deltas
    }

    fn deltas_mut(&mut self) -> &mut DeltaTracker {
        &mut self.deltas
    }

    fn notify(&mut self, step: &StepDelta, state: &MasterState) {
        for (i, flat) in step.flattened.iter().enumerate() {
            let op = classify(flat.op);
            let prev = step.prev[i].clone().map(|r| self.layout.extend(r));
            let curr = step.curr[i].clone().map(|r| self.layout.extend(r));
            let prev_pass = prev.as_deref().map_or(false, |r| self.passes(r));
            let curr_pass = curr.as_deref().map_or(false, |r| self.passes(r));

            if op == Operation::Delete {
                self.deltas.force();
            }
            if !prev_pass && !curr_pass {
                continue;
            }
            self.deltas.track(flat.pkey);

            match curr {
                Some(row) if curr_pass => self.place(flat.pkey, &row, state),
                _ => {
                    self.traversal.remove(flat.pkey);
                }
            }
        }
    }

    fn step_end(&mut self, _state: &MasterState) {
        debug!(
            rows = self.traversal.len(),
            changed = self.deltas.len(),
            "Flat context step_end"
        );
    }

    fn get_row_count(&self) -> usize {
        self.traversal.len()
    }

    fn get_column_count(&self) -> usize {
        self.outputs.len()
    }

    fn get_column_names(&self) -> Vec<SmolStr> {
        self.outputs.iter().map(|(n, _)| n.clone()).collect()
    }

    fn get_column_dtype(&self, col: usize) -> DType {
        match self.outputs.get(col) {
            Some((_, Some(pos))) => self.layout.dtype(*pos),
            _ => DType::None,
        }
    }

    fn render_cells(
        &self,
        state: &MasterState,
        row: usize,
        cols: Extent,
        out: &mut Vec<Scalar>,
    ) -> bool {
        let Some(key) = self.traversal.key_at(row) else {
            return false;
        };
        let Some(values) = self.layout.read(state, key) else {
            return false;
        };
        for (_, pos) in &self.outputs[cols.start..cols.end] {
            out.push(pos.and_then(|p| values.get(p)).cloned().unwrap_or_default());
        }
        true
    }

    fn row_of_key(&self, _state: &MasterState, key: Symbol) -> Option<usize> {
        self.traversal.position(key)
    }

    fn traversal_row(&self, _state: &MasterState, row: usize) -> Option<TraversalRow> {
        self.traversal.key_at(row).map(|key| TraversalRow {
            depth: 0,
            expanded: false,
            has_children: false,
            key: Some(key),
        })
    }

    fn changed_rows(&mut self, _state: &MasterState, keys: Vec<Symbol>) -> Vec<usize> {
        let mut rows: Vec<usize> = keys
            .into_iter()
            .filter_map(|k| self.traversal.position(k))
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
        let mut out = Vec::with_capacity(cells.len());
        for &(row, _) in cells {
            if let Some(key) = self.traversal.key_at(row) {
                let pkey = state.read_value(key, index).cloned().unwrap_or_default();
                if !out.contains(&pkey) {
                    out.push(pkey);
                }
            }
        }
        Ok(out)
    }

    fn sidedness(&self) -> u8 {
        0
    }

    fn reset(&mut self) {
        self.deltas.clear();
        self.traversal.clear();
        self.initialized = false;
    }
}

#[cfg(test)]
mod flat_context_tests {
    use super::*;
    use crate::engine::operators::FilterOp;
    use crate::engine::symbol::SymbolTable;
    use crate::engine::types::OpRow;
    use crate::engine::view_config::SortDirection;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Schema {
        Schema::new(
            [("id", DType::Str), ("qty", DType::Int), ("price", DType::Float)],
            "id",
        )
        .unwrap()
    }

    fn ins(k: &str, qty: i64, price: f64) -> OpRow {
        OpRow::insert(vec![Scalar::str(k), Scalar::Int(qty), Scalar::Float(price)])
    }

    fn run(state: &mut MasterState, ctx: &mut FlatContext, batch: Vec<OpRow>) {
        let step = state.apply(batch).unwrap();
        ctx.step_begin();
        ctx.notify(&step, state);
        ctx.step_end(state);
    }

    #[test]
    fn test_filter_sort_and_computed_columns() {
        let config = ContextConfig::new()
            .filter("qty", FilterOp::Gt, json!(1))
            .sort_by("total", SortDirection::Desc)
            .computed("total", "qty * price")
            .project(&["id"]);
        let mut state = MasterState::new(schema(), Arc::new(SymbolTable::new()));
        let mut ctx = FlatContext::new(config, &schema()).unwrap();
        ctx.init(&state);
        run(
            &mut state,
            &mut ctx,
            vec![ins("a", 2, 1.0), ins("b", 1, 100.0), ins("c", 3, 2.0)],
        );

        assert_eq!(ctx.get_column_names(), vec![SmolStr::new("id"), SmolStr::new("total")]);
        assert_eq!(ctx.get_column_dtype(1), DType::Float);
        let block = ctx.get_data(&state, 0, 10, 0, 10);
        assert_eq!(block.num_rows(), 2);
        assert_eq!(block.row(0), Some(&[Scalar::str("c"), Scalar::Float(6.0)][..]));
        assert_eq!(block.row(1), Some(&[Scalar::str("a"), Scalar::Float(2.0)][..]));
    }

    #[test]
    fn test_keys_that_never_pass_are_not_reported() {
        let config = ContextConfig::new().filter("qty", FilterOp::Gte, json!(10));
        let mut state = MasterState::new(schema(), Arc::new(SymbolTable::new()));
        let mut ctx = FlatContext::new(config, &schema()).unwrap();
        ctx.init(&state);
        run(&mut state, &mut ctx, vec![ins("a", 1, 1.0), ins("b", 20, 1.0)]);
        let delta = ctx.get_row_delta(&state);
        assert_eq!(delta.num_rows_changed(), 1);
        assert_eq!(delta.row(0).map(|r| r[0].clone()), Some(Scalar::str("b")));

        // a row leaving the filter is tracked but no longer visible
        run(
            &mut state,
            &mut ctx,
            vec![OpRow::update(vec![Scalar::str("b"), Scalar::Int(2), Scalar::Unset])],
        );
        assert!(ctx.has_deltas());
        assert_eq!(ctx.get_row_count(), 0);
        assert_eq!(ctx.get_row_delta(&state).num_rows_changed(), 0);
    }

    #[test]
    fn test_init_sees_existing_rows_and_pkeys() {
        let mut state = MasterState::new(schema(), Arc::new(SymbolTable::new()));
        state.apply(vec![ins("x", 1, 1.0), ins("y", 2, 2.0)]).unwrap();
        let mut ctx = FlatContext::new(ContextConfig::new().project(&["qty"]), &schema()).unwrap();
        ctx.init(&state);
        assert_eq!(ctx.get_row_count(), 2);
        assert_eq!(ctx.get_pkeys(&state, &[(1, 0), (1, 0)]).unwrap(), vec![Scalar::str("y")]);
        assert_eq!(ctx.get_column_dtype(3), DType::None);
    }
}
