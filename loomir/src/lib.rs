//! Block-structured program representation with first-class fork/join
//! concurrency, plus the structural analyses (dominators, natural loops,
//! task tree) that transformation passes consume.
pub mod alloc;
pub mod analysis;
pub mod builder;
pub mod error;
pub mod modules;
pub mod types;
pub mod verify;
