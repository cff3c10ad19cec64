//! Invalidation bus backends.

mod memory;
mod postgres;

pub use memory::MemoryInvalidationBus;
pub use postgres::{CHANNEL_KEY_DELETED, CHANNEL_KEY_MODIFIED, PostgresInvalidationBus};
