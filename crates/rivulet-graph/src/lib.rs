//! Dependency graph construction and traversal
//!
//! Builds the model graph from the explicit reference markers in each model
//! body and computes a deterministic, safe build order.

pub mod graph;
pub mod refs;

pub use graph::{GraphError, ModelGraph, NodeId};
pub use refs::{extract_references, Reference};
