//! Core domain types: tasks, identifiers, the dependency graph, retry
//! policies, and resource hooks.

pub mod graph;
pub mod resource;
pub mod retry;
pub mod task;
pub mod types;
