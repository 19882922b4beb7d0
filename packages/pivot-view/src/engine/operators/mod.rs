pub mod expr;
pub mod predicate;

pub use expr::{BinOp, ComputedExpr, Expr};
pub use predicate::{passes_all, FilterOp, Predicate};
