//! Consistency protocol: store and bus seams, the per-node repository and
//! the inbound invalidation consumers.

pub mod bus;
pub mod consumers;
pub mod error;
pub mod repos;
pub mod repository;
