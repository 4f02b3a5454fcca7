//! # ReMem Index
//!
//! Approximate index structures backing experience retrieval:
//!
//! - [`BloomFilter`] for exact-duplicate task detection
//! - [`LshIndex`] for fast candidate generation
//! - [`ProductQuantizer`] for compressed distance estimates
//! - [`Hnsw`] for approximate nearest-neighbour refinement
//! - [`CountMinSketch`] for retrieval popularity
//! - [`CuckooFilter`] for deletable "unhelpful" flags
//!
//! [`IndexSet`] bundles one of each per shard. All structures are derivative
//! of the experience store and can be rebuilt from it.

pub mod bloom;
pub mod count_min;
pub mod cuckoo;
pub mod distance;
mod hashing;
pub mod hnsw;
pub mod index_set;
pub mod lsh;
pub mod pq;

pub use bloom::BloomFilter;
pub use count_min::CountMinSketch;
pub use cuckoo::{CuckooFilter, FilterFull};
pub use hnsw::{Hnsw, HnswParams};
pub use index_set::{IndexConfig, IndexEntry, IndexSet, IndexStats, Neighbor};
pub use lsh::LshIndex;
pub use pq::{DistanceTable, ProductQuantizer};
