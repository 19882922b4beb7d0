use super::{classify, ContextOps, DeltaTracker, TraversalRow};
use crate::engine::extents::Extent;
use crate::engine::state::{MasterState, StepDelta};
use crate::engine::symbol::Symbol;
use crate::engine::types::{DType, Operation, Scalar, Schema};
use crate::engine::view_config::{ContextConfig, ContextKind};
use crate::error::EngineError;
use smol_str::SmolStr;
use tracing::debug;

/// Unconfigured view: every master column, rows in table order.
#[derive(Debug)]
pub struct UnitContext {
    config: ContextConfig,
    schema: Schema,
    deltas: DeltaTracker,
    num_rows: usize,
    initialized: bool,
}

impl UnitContext {
    pub fn new(config: ContextConfig, schema: &Schema) -> Self {
        Self {
            config,
            schema: schema.clone(),
            deltas: DeltaTracker::default(),
            num_rows: 0,
            initialized: false,
        }
    }
}

impl ContextOps for UnitContext {
    fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn kind(&self) -> ContextKind {
        ContextKind::Unit
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn init(&mut self, state: &MasterState) {
        self.num_rows = state.num_rows();
        self.initialized = true;
    }

    fn deltas(&self) -> &DeltaTracker {
        &self.deltas
    }

    fn deltas_mut(&mut self) -> &mut DeltaTracker {
        &mut self.deltas
    }

    fn notify(&mut self, step: &StepDelta, state: &MasterState) {
        for row in &step.flattened {
            match classify(row.op) {
                Operation::Insert | Operation::Update => self.deltas.track(row.pkey),
                Operation::Delete => {
                    self.deltas.track(row.pkey);
                    self.deltas.force();
                }
            }
        }
        self.num_rows = state.num_rows();
    }

    fn step_end(&mut self, state: &MasterState) {
        self.num_rows = state.num_rows();
        debug!(rows = self.num_rows, changed = self.deltas.len(), "Unit context step_end");
    }

    fn get_row_count(&self) -> usize {
        self.num_rows
    }

    fn get_column_count(&self) -> usize {
        self.schema.len()
    }

    fn get_column_names(&self) -> Vec<SmolStr> {
        self.schema.column_names()
    }

    fn get_column_dtype(&self, col: usize) -> DType {
        self.schema.dtype(col)
    }

    fn render_cells(
        &self,
        state: &MasterState,
        row: usize,
        cols: Extent,
        out: &mut Vec<Scalar>,
    ) -> bool {
        let Some(key) = state.key_at(row) else {
            return false;
        };
        for c in cols.start..cols.end {
            out.push(state.read_value(key, c).cloned().unwrap_or_default());
        }
        true
    }

    fn row_of_key(&self, state: &MasterState, key: Symbol) -> Option<usize> {
        state.position_of(key)
    }

    fn traversal_row(&self, state: &MasterState, row: usize) -> Option<TraversalRow> {
        state.key_at(row).map(|key| TraversalRow {
            depth: 0,
            expanded: false,
            has_children: false,
            key: Some(key),
        })
    }

    fn changed_rows(&mut self, state: &MasterState, keys: Vec<Symbol>) -> Vec<usize> {
        // deleted keys are no longer live and drop out here
        let mut rows: Vec<usize> = keys.into_iter().filter_map(|k| state.position_of(k)).collect();
        rows.sort_unstable();
        rows
    }

    fn get_pkeys(
        &self,
        _state: &MasterState,
        _cells: &[(usize, usize)],
    ) -> Result<Vec<Scalar>, EngineError> {
        Err(EngineError::Unsupported("get_pkeys on an unconfigured view"))
    }

    fn supports_pkeys(&self) -> bool {
        false
    }

    fn sidedness(&self) -> u8 {
        0
    }

    fn reset(&mut self) {
        self.deltas.clear();
        self.num_rows = 0;
        self.initialized = false;
    }
}
