//! Database layer - connection pooling, backend kinds, schema creation and constraint management

pub mod constraints;
pub mod pool;
pub mod schema;

pub use constraints::{ConstraintManager, ConstraintSnapshot};
pub use pool::{BackendKind, Pool, PoolConnection};
