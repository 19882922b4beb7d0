pub mod aggregate;
pub mod context;
pub mod extents;
pub mod operators;
pub mod pipeline;
pub mod state;
pub mod symbol;
pub mod traversal;
pub mod tree;
pub mod types;
pub mod view_config;

pub use context::{Context, ContextOps, DataBlock, RowDelta, TraversalRow};
pub use pipeline::{Pipeline, UpdateReport, ViewHandle};
pub use state::{MasterState, StepDelta};
pub use symbol::{Symbol, SymbolTable};
pub use types::{DType, OpRow, Operation, Scalar, Schema, Transition};
pub use view_config::{AggFunc, AggSpec, ContextConfig, ContextKind, SortDirection};
