//! Fitness arithmetic

pub mod calculator;
