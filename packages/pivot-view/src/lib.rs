// src/lib.rs

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
pub use rayon::prelude::*;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use engine::operators::FilterOp;
pub use engine::{
    AggFunc, AggSpec, Context, ContextConfig, ContextKind, ContextOps, DType, DataBlock, OpRow,
    Operation, Pipeline, RowDelta, Scalar, Schema, SortDirection, Symbol, SymbolTable,
    UpdateReport, ViewHandle,
};
pub use error::EngineError;
