use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// A batch carried an operation tag outside INSERT/UPDATE/DELETE.
    #[error("unknown operation tag {tag} in batch row {row}")]
    UnknownOperation { tag: u8, row: usize },

    #[error("schema mismatch: {reason}")]
    SchemaMismatch { reason: String },

    #[error("unknown column '{0}'")]
    UnknownColumn(SmolStr),

    #[error("view '{0}' already exists")]
    AlreadyExists(SmolStr),

    #[error("view '{0}' does not exist")]
    UnknownView(SmolStr),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid expression '{expr}': {message}")]
    Expression { expr: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}
