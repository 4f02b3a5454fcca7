//! Visibility promotion

pub mod policy;
