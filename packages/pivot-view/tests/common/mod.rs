//! Shared fixtures for the pivot-view integration tests.
#![allow(dead_code)]

use pivot_view::{
    DType, DataBlock, EngineConfig, OpRow, Pipeline, Scalar, Schema, SymbolTable, ViewHandle,
};
use std::sync::Arc;

/// `{pkey: Str (index), value: Int}`
pub fn kv_schema() -> Schema {
    Schema::new([("pkey", DType::Str), ("value", DType::Int)], "pkey").expect("valid schema")
}

/// `{id: Str (index), region: Str, kind: Str, qty: Int, price: Float}`
pub fn sales_schema() -> Schema {
    Schema::new(
        [
            ("id", DType::Str),
            ("region", DType::Str),
            ("kind", DType::Str),
            ("qty", DType::Int),
            ("price", DType::Float),
        ],
        "id",
    )
    .expect("valid schema")
}

/// Pipeline with its own symbol table so tests do not share interned keys.
pub fn setup(schema: Schema) -> Pipeline {
    Pipeline::with_symbols(schema, EngineConfig::default(), Arc::new(SymbolTable::new()))
        .expect("pipeline")
}

pub fn ins(key: &str, value: i64) -> OpRow {
    OpRow::insert(vec![Scalar::str(key), Scalar::Int(value)])
}

pub fn upd(key: &str, value: i64) -> OpRow {
    OpRow::update(vec![Scalar::str(key), Scalar::Int(value)])
}

pub fn del(key: &str) -> OpRow {
    OpRow::delete(2, 0, Scalar::str(key))
}

pub fn sale(id: &str, region: &str, kind: &str, qty: i64, price: f64) -> OpRow {
    OpRow::insert(vec![
        Scalar::str(id),
        Scalar::str(region),
        Scalar::str(kind),
        Scalar::Int(qty),
        Scalar::Float(price),
    ])
}

pub fn del_sale(id: &str) -> OpRow {
    OpRow::delete(5, 0, Scalar::str(id))
}

pub fn rows(block: &DataBlock) -> Vec<Vec<Scalar>> {
    block.rows().map(|r| r.to_vec()).collect()
}

/// Every visible row of a view.
pub fn all_rows(view: &ViewHandle) -> Vec<Vec<Scalar>> {
    rows(&view.get_data(0, i64::MAX, 0, i64::MAX))
}

/// Visible rows rendered and sorted, for order-insensitive comparisons.
pub fn snapshot(view: &ViewHandle) -> Vec<String> {
    let mut out: Vec<String> = all_rows(view)
        .into_iter()
        .map(|r| format!("{:?}", r))
        .collect();
    out.sort();
    out
}

pub fn row(values: &[Scalar]) -> Vec<Scalar> {
    values.to_vec()
}
