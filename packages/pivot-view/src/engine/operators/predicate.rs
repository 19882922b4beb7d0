use crate::engine::types::{compare_scalars, Scalar};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "is null")]
    IsNull,
    #[serde(rename = "is not null")]
    IsNotNull,
    #[serde(rename = "begins with")]
    BeginsWith,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "in")]
    In,
}

/// A filter bound to a column position in the view's row layout.
#[derive(Clone, Debug)]
pub struct Predicate {
    pub column: Option<usize>,
    pub op: FilterOp,
    operand: Operand,
}

#[derive(Clone, Debug)]
enum Operand {
    One(Scalar),
    Many(Vec<Scalar>),
}

impl Predicate {
    pub fn new(column: Option<usize>, op: FilterOp, value: &Value) -> Self {
        let operand = match (op, value) {
            (FilterOp::In, Value::Array(items)) => {
                Operand::Many(items.iter().cloned().map(Scalar::from).collect())
            }
            (FilterOp::In, v) => Operand::Many(vec![Scalar::from(v.clone())]),
            (_, v) => Operand::One(Scalar::from(v.clone())),
        };
        Self {
            column,
            op,
            operand,
        }
    }

    /// Evaluate against one cell. Unbound columns read as `None`.
    pub fn check(&self, cell: &Scalar) -> bool {
        match self.op {
            FilterOp::IsNull => return cell.is_none(),
            FilterOp::IsNotNull => return !cell.is_none(),
            _ => {}
        }
        if cell.is_none() {
            return false;
        }
        match (&self.operand, self.op) {
            (Operand::Many(items), FilterOp::In) => items.iter().any(|v| loosely_equal(cell, v)),
            (Operand::One(target), FilterOp::BeginsWith) => match (cell.as_str(), target.as_str()) {
                (Some(s), Some(prefix)) => s.starts_with(prefix),
                _ => false,
            },
            (Operand::One(target), FilterOp::Contains) => match (cell.as_str(), target.as_str()) {
                (Some(s), Some(needle)) => s.contains(needle),
                _ => false,
            },
            (Operand::One(target), op) => {
                if target.is_none() {
                    return false;
                }
                let ord = compare_scalars(cell, target);
                match op {
                    FilterOp::Eq => ord == Ordering::Equal,
                    FilterOp::Neq => ord != Ordering::Equal,
                    FilterOp::Lt => ord == Ordering::Less,
                    FilterOp::Lte => ord != Ordering::Greater,
                    FilterOp::Gt => ord == Ordering::Greater,
                    FilterOp::Gte => ord != Ordering::Less,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

fn loosely_equal(a: &Scalar, b: &Scalar) -> bool {
    compare_scalars(a, b) == Ordering::Equal
}

/// Conjunction of predicates over a full row.
pub fn passes_all(predicates: &[Predicate], row: &[Scalar]) -> bool {
    predicates.iter().all(|p| {
        let cell = p.column.and_then(|c| row.get(c)).unwrap_or(&Scalar::None);
        p.check(cell)
    })
}
