//! Key-value node whose per-node caches converge through lazy,
//! message-driven invalidation over a shared durable store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
