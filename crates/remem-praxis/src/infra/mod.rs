//! Infrastructure layer

pub mod embedding;
pub mod experience_store;
pub mod snapshot;
pub mod telemetry;
