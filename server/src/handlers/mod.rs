//! Request handlers for sync operations.

mod changes;
mod fetch;
mod push;

pub use changes::*;
pub use fetch::*;
pub use push::*;
