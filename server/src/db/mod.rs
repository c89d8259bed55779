//! PostgreSQL persistence: the store adapter over existing application tables.

mod pool;
mod records;

pub use pool::*;
pub use records::*;
