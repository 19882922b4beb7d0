//! Views ("contexts") over the master state.
//!
//! Every variant implements [`ContextOps`]. The trait carries the shared
//! query surface (range/sparse fetch, row deltas) on top of a few
//! variant-specific hooks; [`Context`] dispatches over the concrete variants.

mod flat;
mod pivot;
mod unit;

pub use flat::FlatContext;
pub use pivot::PivotContext;
pub use unit::UnitContext;

use super::extents::{sanitize, Extent};
use super::state::{MasterState, StepDelta};
use super::symbol::Symbol;
use super::types::{DType, FastHashSet, Operation, Scalar, Schema};
use super::view_config::{ContextConfig, ContextKind};
use crate::error::EngineError;
use serde::Serialize;
use smol_str::SmolStr;

/// Row-major block of output cells.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct DataBlock {
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
    pub data: Vec<Scalar>,
}

impl DataBlock {
    fn new(rows: Extent, cols: Extent) -> Self {
        Self {
            start_row: rows.start,
            end_row: rows.end,
            start_col: cols.start,
            end_col: cols.end,
            data: Vec::with_capacity(rows.len() * cols.len()),
        }
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.end_row - self.start_row
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.end_col - self.start_col
    }

    /// Cells of the `i`-th row of the block (relative to `start_row`).
    pub fn row(&self, i: usize) -> Option<&[Scalar]> {
        let width = self.num_columns();
        if i >= self.num_rows() {
            return None;
        }
        self.data.get(i * width..(i + 1) * width)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Scalar]> + '_ {
        (0..self.num_rows()).filter_map(move |i| self.row(i))
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Scalar> {
        if col >= self.num_columns() {
            return None;
        }
        self.row(row).and_then(|r| r.get(col))
    }
}

/// Rows changed since the last read, as returned by `get_row_delta`.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct RowDelta {
    pub rows_changed: bool,
    /// Row count of the view after the change.
    pub num_rows: usize,
    /// Visible row index of each changed row, ascending.
    pub row_indices: Vec<usize>,
    pub stride: usize,
    pub data: Vec<Scalar>,
}

impl RowDelta {
    pub fn num_rows_changed(&self) -> usize {
        self.row_indices.len()
    }

    pub fn row(&self, i: usize) -> Option<&[Scalar]> {
        self.data.get(i * self.stride..(i + 1) * self.stride)
    }
}

/// One visible row of a traversal.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraversalRow {
    pub depth: usize,
    pub expanded: bool,
    pub has_children: bool,
    /// Primary key for unpivoted rows and per-key leaves.
    pub key: Option<Symbol>,
}

/// Keys changed in the current cycle plus the has-delta flag.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    keys: FastHashSet<Symbol>,
    forced: bool,
}

impl DeltaTracker {
    pub fn clear(&mut self) {
        self.keys.clear();
        self.forced = false;
    }

    #[inline]
    pub fn track(&mut self, key: Symbol) {
        self.keys.insert(key);
    }

    /// Raise the flag without tracking a key (deletes do this).
    #[inline]
    pub fn force(&mut self) {
        self.forced = true;
    }

    #[inline]
    pub fn has_delta(&self) -> bool {
        self.forced || !self.keys.is_empty()
    }

    pub fn contains(&self, key: Symbol) -> bool {
        self.keys.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Snapshot and clear.
    pub fn take(&mut self) -> (bool, Vec<Symbol>) {
        let flag = self.has_delta();
        let keys = self.keys.drain().collect();
        self.forced = false;
        (flag, keys)
    }
}

/// Decode a flattened-row tag. Flattened data is produced by the master
/// state, so anything else is corruption.
pub(crate) fn classify(tag: u8) -> Operation {
    match Operation::from_tag(tag) {
        Some(op) => op,
        None => panic!("unexpected operation tag {} in flattened batch", tag),
    }
}

pub trait ContextOps {
    fn config(&self) -> &ContextConfig;

    fn kind(&self) -> ContextKind;

    fn is_initialized(&self) -> bool;

    /// Load whatever the master state already holds.
    fn init(&mut self, state: &MasterState);

    fn deltas(&self) -> &DeltaTracker;

    fn deltas_mut(&mut self) -> &mut DeltaTracker;

    fn step_begin(&mut self) {
        if self.is_initialized() {
            self.deltas_mut().clear();
        }
    }

    fn notify(&mut self, step: &StepDelta, state: &MasterState);

    /// First batch into an empty master state.
    fn notify_initial(&mut self, step: &StepDelta, state: &MasterState) {
        self.notify(step, state);
        self.deltas_mut().force();
    }

    fn step_end(&mut self, state: &MasterState);

    fn get_row_count(&self) -> usize;

    fn get_column_count(&self) -> usize;

    fn get_column_names(&self) -> Vec<SmolStr>;

    /// Declared type of an output column; `DType::None` out of range.
    fn get_column_dtype(&self, col: usize) -> DType;

    /// Write the cells `cols` of visible row `row` into `out`. Returns false
    /// (and writes nothing) when the row does not exist.
    fn render_cells(&self, state: &MasterState, row: usize, cols: Extent, out: &mut Vec<Scalar>)
        -> bool;

    /// Visible row currently showing `key`, if any.
    fn row_of_key(&self, state: &MasterState, key: Symbol) -> Option<usize>;

    fn traversal_row(&self, state: &MasterState, row: usize) -> Option<TraversalRow>;

    /// Visible rows affected by `keys` (and any other tracked change), ascending.
    fn changed_rows(&mut self, state: &MasterState, keys: Vec<Symbol>) -> Vec<usize>;

    fn get_pkeys(&self, state: &MasterState, cells: &[(usize, usize)])
        -> Result<Vec<Scalar>, EngineError>;

    fn supports_pkeys(&self) -> bool {
        true
    }

    fn sidedness(&self) -> u8;

    /// Drop delta tracking and derived structures. `init` must run again.
    fn reset(&mut self);

    fn has_deltas(&self) -> bool {
        self.deltas().has_delta()
    }

    fn get_data(
        &self,
        state: &MasterState,
        start_row: i64,
        end_row: i64,
        start_col: i64,
        end_col: i64,
    ) -> DataBlock {
        let rows = sanitize(start_row, end_row, self.get_row_count());
        let cols = sanitize(start_col, end_col, self.get_column_count());
        let mut block = DataBlock::new(rows, cols);
        for r in rows.start..rows.end {
            if !self.render_cells(state, r, cols, &mut block.data) {
                block.data.extend(std::iter::repeat(Scalar::None).take(cols.len()));
            }
        }
        normalize(&mut block.data);
        block
    }

    fn get_data_by_rows(&self, state: &MasterState, rows: &[usize]) -> DataBlock {
        let cols = Extent {
            start: 0,
            end: self.get_column_count(),
        };
        let mut block = DataBlock::new(Extent { start: 0, end: rows.len() }, cols);
        for &r in rows {
            if !self.render_cells(state, r, cols, &mut block.data) {
                block.data.extend(std::iter::repeat(Scalar::None).take(cols.len()));
            }
        }
        normalize(&mut block.data);
        block
    }

    fn get_data_by_keys(&self, state: &MasterState, keys: &[Symbol]) -> DataBlock {
        let rows: Vec<usize> = keys
            .iter()
            .map(|k| self.row_of_key(state, *k).unwrap_or(usize::MAX))
            .collect();
        self.get_data_by_rows(state, &rows)
    }

    /// Fetch-and-clear the rows changed since the last read.
    fn get_row_delta(&mut self, state: &MasterState) -> RowDelta {
        let (rows_changed, keys) = self.deltas_mut().take();
        let row_indices = self.changed_rows(state, keys);
        let block = self.get_data_by_rows(state, &row_indices);
        RowDelta {
            rows_changed,
            num_rows: self.get_row_count(),
            row_indices,
            stride: block.num_columns(),
            data: block.data,
        }
    }
}

fn normalize(cells: &mut [Scalar]) {
    for c in cells.iter_mut() {
        if c.is_unset() {
            *c = Scalar::None;
        }
    }
}

/// A view of any variant.
#[derive(Debug)]
pub enum Context {
    Unit(UnitContext),
    Flat(FlatContext),
    Pivot(PivotContext),
}

macro_rules! dispatch {
    ($self:expr, $ctx:ident => $body:expr) => {
        match $self {
            Context::Unit($ctx) => $body,
            Context::Flat($ctx) => $body,
            Context::Pivot($ctx) => $body,
        }
    };
}

impl Context {
    /// Build the variant the configuration calls for.
    pub fn new(config: ContextConfig, schema: &Schema) -> Result<Self, EngineError> {
        Ok(match config.kind() {
            ContextKind::Unit => Context::Unit(UnitContext::new(config, schema)),
            ContextKind::Flat => Context::Flat(FlatContext::new(config, schema)?),
            kind => Context::Pivot(PivotContext::new(config, kind, schema)?),
        })
    }

    pub fn as_pivot_mut(&mut self) -> Result<&mut PivotContext, EngineError> {
        match self {
            Context::Pivot(p) => Ok(p),
            _ => Err(EngineError::Unsupported("expansion requires a pivoted view")),
        }
    }

    pub fn expand(&mut self, row: usize) -> Result<bool, EngineError> {
        Ok(self.as_pivot_mut()?.expand(row))
    }

    pub fn collapse(&mut self, row: usize) -> Result<bool, EngineError> {
        Ok(self.as_pivot_mut()?.collapse(row))
    }

    pub fn set_depth(&mut self, depth: usize) -> Result<bool, EngineError> {
        Ok(self.as_pivot_mut()?.set_depth(depth))
    }
}

impl ContextOps for Context {
    fn config(&self) -> &ContextConfig {
        dispatch!(self, c => c.config())
    }

    fn kind(&self) -> ContextKind {
        dispatch!(self, c => c.kind())
    }

    fn is_initialized(&self) -> bool {
        dispatch!(self, c => c.is_initialized())
    }

    fn init(&mut self, state: &MasterState) {
        dispatch!(self, c => c.init(state))
    }

    fn deltas(&self) -> &DeltaTracker {
        dispatch!(self, c => c.deltas())
    }

    fn deltas_mut(&mut self) -> &mut DeltaTracker {
        dispatch!(self, c => c.deltas_mut())
    }

    fn step_begin(&mut self) {
        dispatch!(self, c => c.step_begin())
    }

    fn notify(&mut self, step: &StepDelta, state: &MasterState) {
        dispatch!(self, c => c.notify(step, state))
    }

    fn notify_initial(&mut self, step: &StepDelta, state: &MasterState) {
        dispatch!(self, c => c.notify_initial(step, state))
    }

    fn step_end(&mut self, state: &MasterState) {
        dispatch!(self, c => c.step_end(state))
    }

    fn get_row_count(&self) -> usize {
        dispatch!(self, c => c.get_row_count())
    }

    fn get_column_count(&self) -> usize {
        dispatch!(self, c => c.get_column_count())
    }

    fn get_column_names(&self) -> Vec<SmolStr> {
        dispatch!(self, c => c.get_column_names())
    }

    fn get_column_dtype(&self, col: usize) -> DType {
        dispatch!(self, c => c.get_column_dtype(col))
    }

    fn render_cells(
        &self,
        state: &MasterState,
        row: usize,
        cols: Extent,
        out: &mut Vec<Scalar>,
    ) -> bool {
        dispatch!(self, c => c.render_cells(state, row, cols, out))
    }

    fn row_of_key(&self, state: &MasterState, key: Symbol) -> Option<usize> {
        dispatch!(self, c => c.row_of_key(state, key))
    }

    fn traversal_row(&self, state: &MasterState, row: usize) -> Option<TraversalRow> {
        dispatch!(self, c => c.traversal_row(state, row))
    }

    fn changed_rows(&mut self, state: &MasterState, keys: Vec<Symbol>) -> Vec<usize> {
        dispatch!(self, c => c.changed_rows(state, keys))
    }

    fn get_pkeys(
        &self,
        state: &MasterState,
        cells: &[(usize, usize)],
    ) -> Result<Vec<Scalar>, EngineError> {
        dispatch!(self, c => c.get_pkeys(state, cells))
    }

    fn supports_pkeys(&self) -> bool {
        dispatch!(self, c => c.supports_pkeys())
    }

    fn sidedness(&self) -> u8 {
        dispatch!(self, c => c.sidedness())
    }

    fn reset(&mut self) {
        dispatch!(self, c => c.reset())
    }

    fn has_deltas(&self) -> bool {
        dispatch!(self, c => c.has_deltas())
    }

    fn get_row_delta(&mut self, state: &MasterState) -> RowDelta {
        dispatch!(self, c => c.get_row_delta(state))
    }
}
