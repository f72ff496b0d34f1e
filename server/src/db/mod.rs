//! Database module for PostgreSQL persistence.

mod entities;
mod operations;
mod pool;

pub use entities::*;
pub use operations::*;
pub use pool::*;
