//! Core data types for the ReMem experience engine

pub mod experience;
pub mod ids;
pub mod scope;
