//! Node-local cache layer.
//!
//! - [`CacheStore`]: values plus per-key [`Staleness`] markers
//! - [`KeyLocks`]: per-key critical sections for the repository
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! store_timeout_ms = 2000
//! bus_timeout_ms = 2000
//! publish_attempts = 3
//! warm_on_startup = true
//! # ... see config.rs for all options
//! ```

mod config;
mod key_locks;
pub(crate) mod lock;
mod store;

pub use config::CacheConfig;
pub use key_locks::{KeyGuard, KeyLocks};
pub use store::{CacheError, CacheStore, Staleness};
