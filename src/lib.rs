//! convoy - command-line front end over the core, graph and exec crates.

pub mod cli;
pub mod render;
