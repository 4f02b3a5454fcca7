//! Domain layer

pub mod augmentation;
pub mod collaborators;
pub mod control_loop;
pub mod evolution;
pub mod indexing;
pub mod retrieval;
