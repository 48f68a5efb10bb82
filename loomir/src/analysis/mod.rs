//! Structural analyses over functions: control-flow edges and orders,
//! dominators, the natural-loop forest and the fork/join task tree.
//!
//! All analyses are snapshots; passes that mutate the graph rebuild the
//! analyses they still need afterwards.
pub mod cfg;
pub mod dom;
pub mod loops;
pub mod tasks;

pub use cfg::FlowGraph;
pub use dom::DomTree;
pub use loops::{LoopForest, LoopId};
pub use tasks::{TaskId, TaskTree};
