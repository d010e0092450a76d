//! Type definitions shared by the codec, registry and evaluators

pub mod batch;
pub mod schema;
pub mod value;

pub use batch::{Orientation, Record, RecordBatch};
pub use schema::FieldSpec;
pub use value::{ElementType, Tensor, Value};
