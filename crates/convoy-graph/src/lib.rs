//! convoy-graph - validated resource graphs and conditional inclusion

pub mod graph;
pub mod inclusion;

pub use graph::{fingerprint, ResourceGraph, ResourceNode};
pub use inclusion::{resolve, Exclusion};
