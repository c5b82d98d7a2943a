//! In-memory stores behind the router's handler and mapping boundaries.
pub mod apply_errors;
pub mod mapping;
pub mod memory;

pub use apply_errors::ApplyErrorLog;
pub use mapping::MappingStore;
pub use memory::{Owner, Record, RecordKey, ResourceStore};
