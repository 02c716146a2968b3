//! Persistence layer: `TaskStore` trait and the libSQL backend.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{EventRow, NewEvent, TaskStore};
