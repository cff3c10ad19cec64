//! Domain layer types shared by every node.

pub mod entities;
pub mod messages;
