mod maps;
mod operation;
mod scalar;
mod schema;

pub use maps::{FastBuildHasher, FastHashSet, FastIndexMap, FastMap};
pub use operation::{OpRow, Operation, Transition};
pub use scalar::{compare_scalars, DType, Scalar};
pub use schema::Schema;
