//! Canonical master table.
//!
//! Holds exactly one current row per live primary key in columnar storage and
//! turns each incoming batch into a [`StepDelta`]: one flattened row per
//! touched key plus the prev/curr/transition/existed tables every context
//! needs to update itself incrementally.

use super::symbol::{Symbol, SymbolTable};
use super::types::{FastIndexMap, OpRow, Operation, Scalar, Schema, Transition};
use crate::error::EngineError;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug)]
struct RowSlot {
    slot: usize,
    ordinal: u64,
}

/// One effective row per key touched by a batch.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FlattenedRow {
    pub pkey: Symbol,
    pub pkey_value: Scalar,
    /// Resolved wire tag: INSERT for fresh keys, UPDATE for keys that were
    /// live before the batch, DELETE when the batch removed the key.
    pub op: u8,
    /// Current values; for deletes the pre-delete values (all `None` when the
    /// key was never live).
    pub values: Vec<Scalar>,
}

/// The normalized result of applying one batch.
///
/// All vectors are parallel to `flattened`.
#[derive(Serialize, Clone, Debug, Default)]
pub struct StepDelta {
    pub flattened: Vec<FlattenedRow>,
    /// Per-column numeric difference `curr - prev` (missing side counts as 0);
    /// `None` for non-numeric cells.
    pub delta: Vec<Vec<Scalar>>,
    pub prev: Vec<Option<Vec<Scalar>>>,
    pub curr: Vec<Option<Vec<Scalar>>>,
    pub transitions: Vec<Transition>,
    pub existed: Vec<bool>,
    /// Rows skipped because their primary key was null.
    pub rejected: usize,
}

impl StepDelta {
    #[inline]
    pub fn len(&self) -> usize {
        self.flattened.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flattened.is_empty()
    }
}

struct Pending {
    pkey_value: Scalar,
    row: Option<Vec<Scalar>>,
}

#[derive(Debug)]
pub struct MasterState {
    schema: Schema,
    symbols: Arc<SymbolTable>,
    columns: Vec<Vec<Scalar>>,
    free: Vec<usize>,
    live: FastIndexMap<Symbol, RowSlot>,
    next_ordinal: u64,
}

impl MasterState {
    pub fn new(schema: Schema, symbols: Arc<SymbolTable>) -> Self {
        let columns = vec![Vec::new(); schema.len()];
        Self {
            schema,
            symbols,
            columns,
            free: Vec::new(),
            live: FastIndexMap::default(),
            next_ordinal: 0,
        }
    }

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.schema.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[inline]
    pub fn contains(&self, key: Symbol) -> bool {
        self.live.contains_key(&key)
    }

    /// Keys in table order.
    pub fn keys(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.live.keys().copied()
    }

    pub fn key_at(&self, position: usize) -> Option<Symbol> {
        self.live.get_index(position).map(|(k, _)| *k)
    }

    pub fn position_of(&self, key: Symbol) -> Option<usize> {
        self.live.get_index_of(&key)
    }

    /// Monotonic insertion sequence of a live key.
    pub fn ordinal(&self, key: Symbol) -> Option<u64> {
        self.live.get(&key).map(|r| r.ordinal)
    }

    pub fn read_value(&self, key: Symbol, column: usize) -> Option<&Scalar> {
        let slot = self.live.get(&key)?.slot;
        self.columns.get(column)?.get(slot)
    }

    pub fn read_row(&self, key: Symbol) -> Option<Vec<Scalar>> {
        let slot = self.live.get(&key)?.slot;
        Some(self.columns.iter().map(|c| c[slot].clone()).collect())
    }

    /// Apply a batch. Validation happens before any mutation: an unknown tag or
    /// a schema mismatch rejects the batch as a whole. Rows with a null primary
    /// key are skipped individually.
    pub fn apply(&mut self, batch: Vec<OpRow>) -> Result<StepDelta, EngineError> {
        let width = self.schema.len();
        let index = self.schema.index_column();

        let mut ops = Vec::with_capacity(batch.len());
        for (i, row) in batch.iter().enumerate() {
            let op = Operation::from_tag(row.op)
                .ok_or(EngineError::UnknownOperation { tag: row.op, row: i })?;
            if row.values.len() != width {
                return Err(EngineError::SchemaMismatch {
                    reason: format!(
                        "row {} has {} values, schema has {} columns",
                        i,
                        row.values.len(),
                        width
                    ),
                });
            }
            ops.push(op);
        }

        let mut rows = Vec::with_capacity(batch.len());
        for (i, row) in batch.into_iter().enumerate() {
            let mut coerced = Vec::with_capacity(width);
            for (c, value) in row.values.into_iter().enumerate() {
                let dtype = self.schema.dtype(c);
                let kind = value.dtype();
                match value.coerce_to(dtype) {
                    Some(v) => coerced.push(v),
                    None => {
                        return Err(EngineError::SchemaMismatch {
                            reason: format!(
                                "row {} column '{}' expects {:?}, got {:?}",
                                i,
                                self.schema.column_name(c).map(|n| n.as_str()).unwrap_or("?"),
                                dtype,
                                kind
                            ),
                        })
                    }
                }
            }
            rows.push(coerced);
        }

        // Fold rows per key; later rows supersede earlier ones.
        let mut pending: FastIndexMap<Symbol, Pending> = FastIndexMap::default();
        let mut rejected = 0;
        for (i, (op, values)) in ops.into_iter().zip(rows).enumerate() {
            let pkey_value = values[index].clone();
            if pkey_value.is_none() {
                warn!(row = i, "Skipping batch row with null primary key");
                rejected += 1;
                continue;
            }
            let key = self.symbols.intern(&pkey_value);
            let entry = match pending.entry(key) {
                indexmap::map::Entry::Occupied(e) => e.into_mut(),
                indexmap::map::Entry::Vacant(e) => e.insert(Pending {
                    pkey_value,
                    row: self.read_row(key),
                }),
            };
            entry.row = match op {
                Operation::Insert => Some(values.into_iter().map(Scalar::normalized).collect()),
                Operation::Update => Some(match entry.row.take() {
                    Some(prev) => prev
                        .into_iter()
                        .zip(values)
                        .map(|(old, new)| if new.is_unset() { old } else { new })
                        .collect(),
                    None => values.into_iter().map(Scalar::normalized).collect(),
                }),
                Operation::Delete => None,
            };
            trace!(row = i, ?op, "Folded batch row");
        }

        let mut step = StepDelta {
            rejected,
            ..StepDelta::default()
        };
        step.flattened.reserve(pending.len());

        for (key, Pending { pkey_value, row }) in pending {
            let prev = self.read_row(key);
            let existed = prev.is_some();
            let (op, transition, values) = match &row {
                Some(curr) => {
                    if existed {
                        let transition = if prev.as_ref() == Some(curr) {
                            Transition::Unchanged
                        } else {
                            Transition::Updated
                        };
                        (Operation::Update, transition, curr.clone())
                    } else {
                        (Operation::Insert, Transition::Inserted, curr.clone())
                    }
                }
                None => {
                    let values = match &prev {
                        Some(p) => p.clone(),
                        None => {
                            let mut v = vec![Scalar::None; width];
                            v[index] = pkey_value.clone();
                            v
                        }
                    };
                    let transition = if existed {
                        Transition::Deleted
                    } else {
                        Transition::Absent
                    };
                    (Operation::Delete, transition, values)
                }
            };

            match &row {
                Some(curr) => self.write_row(key, curr),
                None if existed => self.remove_row(key),
                None => {}
            }

            step.delta.push(numeric_delta(prev.as_deref(), row.as_deref(), width));
            step.flattened.push(FlattenedRow {
                pkey: key,
                pkey_value,
                op: op.tag(),
                values,
            });
            step.prev.push(prev);
            step.curr.push(row);
            step.transitions.push(transition);
            step.existed.push(existed);
        }

        debug!(
            flattened = step.flattened.len(),
            rejected = step.rejected,
            live = self.live.len(),
            "Applied batch to master state"
        );
        Ok(step)
    }

    fn write_row(&mut self, key: Symbol, row: &[Scalar]) {
        let slot = match self.live.get(&key) {
            Some(r) => r.slot,
            None => {
                let slot = match self.free.pop() {
                    Some(slot) => slot,
                    None => {
                        for col in &mut self.columns {
                            col.push(Scalar::None);
                        }
                        self.columns.first().map(|c| c.len() - 1).unwrap_or(0)
                    }
                };
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                self.live.insert(key, RowSlot { slot, ordinal });
                slot
            }
        };
        for (col, value) in self.columns.iter_mut().zip(row) {
            col[slot] = value.clone();
        }
    }

    fn remove_row(&mut self, key: Symbol) {
        // shift_remove keeps the remaining keys in table order
        if let Some(r) = self.live.shift_remove(&key) {
            for col in &mut self.columns {
                col[r.slot] = Scalar::None;
            }
            self.free.push(r.slot);
        }
    }
}

fn numeric_delta(prev: Option<&[Scalar]>, curr: Option<&[Scalar]>, width: usize) -> Vec<Scalar> {
    (0..width)
        .map(|c| {
            let p = prev.and_then(|r| r.get(c));
            let n = curr.and_then(|r| r.get(c));
            match (p, n) {
                (Some(Scalar::Int(a)), Some(Scalar::Int(b))) => Scalar::Int(b.wrapping_sub(*a)),
                (None, Some(Scalar::Int(b))) => Scalar::Int(*b),
                (Some(Scalar::Int(a)), None) => Scalar::Int(a.wrapping_neg()),
                _ => {
                    let pf = p.map(|v| v.as_f64());
                    let nf = n.map(|v| v.as_f64());
                    match (pf, nf) {
                        (Some(Some(a)), Some(Some(b))) => Scalar::Float(b - a),
                        (None, Some(Some(b))) => Scalar::Float(b),
                        (Some(Some(a)), None) => Scalar::Float(-a),
                        _ => Scalar::None,
                    }
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod master_state_tests {
    use super::*;
    use crate::engine::types::DType;

    fn state() -> MasterState {
        let schema = Schema::new(
            [("id", DType::Str), ("value", DType::Int), ("label", DType::Str)],
            "id",
        )
        .unwrap();
        MasterState::new(schema, Arc::new(SymbolTable::new()))
    }

    fn row(id: &str, value: i64, label: &str) -> Vec<Scalar> {
        vec![Scalar::str(id), Scalar::Int(value), Scalar::str(label)]
    }

    #[test]
    fn test_insert_then_read_in_table_order() {
        let mut s = state();
        let step = s
            .apply(vec![OpRow::insert(row("b", 2, "x")), OpRow::insert(row("a", 1, "y"))])
            .unwrap();
        assert_eq!(step.len(), 2);
        assert_eq!(step.transitions, vec![Transition::Inserted, Transition::Inserted]);
        assert_eq!(step.existed, vec![false, false]);
        assert_eq!(s.num_rows(), 2);
        let first = s.key_at(0).unwrap();
        assert_eq!(s.read_value(first, 0), Some(&Scalar::str("b")));
    }

    #[test]
    fn test_later_rows_supersede_and_update_merges_unset() {
        let mut s = state();
        s.apply(vec![OpRow::insert(row("a", 1, "x"))]).unwrap();
        let step = s
            .apply(vec![
                OpRow::update(vec![Scalar::str("a"), Scalar::Int(5), Scalar::Unset]),
                OpRow::update(vec![Scalar::str("a"), Scalar::Int(7), Scalar::Unset]),
            ])
            .unwrap();
        assert_eq!(step.len(), 1);
        assert_eq!(step.flattened[0].op, Operation::UPDATE_TAG);
        assert_eq!(step.flattened[0].values, row("a", 7, "x"));
        assert_eq!(step.transitions[0], Transition::Updated);
        assert_eq!(step.delta[0][1], Scalar::Int(6));
        assert_eq!(step.prev[0], Some(row("a", 1, "x")));
    }

    #[test]
    fn test_unchanged_update_is_detected() {
        let mut s = state();
        s.apply(vec![OpRow::insert(row("a", 1, "x"))]).unwrap();
        let step = s.apply(vec![OpRow::insert(row("a", 1, "x"))]).unwrap();
        assert_eq!(step.transitions[0], Transition::Unchanged);
    }

    #[test]
    fn test_delete_keeps_prev_row_for_the_cycle() {
        let mut s = state();
        s.apply(vec![OpRow::insert(row("a", 1, "x")), OpRow::insert(row("b", 2, "y"))])
            .unwrap();
        let step = s.apply(vec![OpRow::delete(3, 0, Scalar::str("a"))]).unwrap();
        assert_eq!(step.flattened[0].op, Operation::DELETE_TAG);
        assert_eq!(step.flattened[0].values, row("a", 1, "x"));
        assert_eq!(step.transitions[0], Transition::Deleted);
        assert_eq!(step.curr[0], None);
        assert_eq!(s.num_rows(), 1);
        assert!(!s.contains(step.flattened[0].pkey));
        assert_eq!(s.read_value(s.key_at(0).unwrap(), 0), Some(&Scalar::str("b")));
    }

    #[test]
    fn test_delete_of_unknown_key_is_absent() {
        let mut s = state();
        let step = s.apply(vec![OpRow::delete(3, 0, Scalar::str("ghost"))]).unwrap();
        assert_eq!(step.transitions[0], Transition::Absent);
        assert_eq!(step.flattened[0].op, Operation::DELETE_TAG);
        assert_eq!(step.flattened[0].values[0], Scalar::str("ghost"));
        assert!(s.is_empty());
    }

    #[test]
    fn test_free_slots_are_reused() {
        let mut s = state();
        s.apply(vec![OpRow::insert(row("a", 1, "x"))]).unwrap();
        s.apply(vec![OpRow::delete(3, 0, Scalar::str("a"))]).unwrap();
        s.apply(vec![OpRow::insert(row("b", 2, "y"))]).unwrap();
        assert_eq!(s.columns[0].len(), 1);
        let b = s.key_at(0).unwrap();
        assert_eq!(s.read_row(b), Some(row("b", 2, "y")));
    }

    #[test]
    fn test_unknown_tag_rejects_whole_batch() {
        let mut s = state();
        let err = s
            .apply(vec![OpRow::insert(row("a", 1, "x")), OpRow::raw(7, row("b", 2, "y"))])
            .unwrap_err();
        assert_eq!(err, EngineError::UnknownOperation { tag: 7, row: 1 });
        assert!(s.is_empty());
    }

    #[test]
    fn test_schema_mismatch_rejects_whole_batch() {
        let mut s = state();
        let bad_arity = s.apply(vec![OpRow::insert(vec![Scalar::str("a")])]);
        assert!(matches!(bad_arity, Err(EngineError::SchemaMismatch { .. })));
        let bad_type = s.apply(vec![OpRow::insert(vec![
            Scalar::str("a"),
            Scalar::str("not a number"),
            Scalar::None,
        ])]);
        assert!(matches!(bad_type, Err(EngineError::SchemaMismatch { .. })));
        assert!(s.is_empty());
    }

    #[test]
    fn test_null_pkey_rows_fail_independently() {
        let mut s = state();
        let step = s
            .apply(vec![
                OpRow::insert(vec![Scalar::None, Scalar::Int(1), Scalar::None]),
                OpRow::insert(row("a", 1, "x")),
            ])
            .unwrap();
        assert_eq!(step.rejected, 1);
        assert_eq!(step.len(), 1);
        assert_eq!(s.num_rows(), 1);
    }

    #[test]
    fn test_insert_after_delete_in_same_batch_is_update() {
        let mut s = state();
        s.apply(vec![OpRow::insert(row("a", 1, "x"))]).unwrap();
        let step = s
            .apply(vec![OpRow::delete(3, 0, Scalar::str("a")), OpRow::insert(row("a", 3, "z"))])
            .unwrap();
        assert_eq!(step.len(), 1);
        assert_eq!(step.flattened[0].op, Operation::UPDATE_TAG);
        assert_eq!(step.transitions[0], Transition::Updated);
        assert_eq!(s.num_rows(), 1);
    }
}
