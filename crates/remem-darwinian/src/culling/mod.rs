//! Capacity-driven culling

pub mod policy;
pub mod queue;
