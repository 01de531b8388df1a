//! convoy-core - data model, declarations, flags, configuration and errors
//!
//! Everything here is plain data. Graph construction lives in convoy-graph,
//! execution in convoy-exec.

pub mod config;
pub mod declaration;
pub mod duration;
pub mod error;
pub mod flags;
pub mod types;

pub use config::{EngineConfig, OperatorConfig, DEFAULT_MAX_IN_FLIGHT, DEFAULT_OPERATION_TIMEOUT};
pub use declaration::{Declaration, DeclarationSet};
pub use error::{Error, GraphError, Relation, Result};
pub use flags::{FlagValue, Flags, Predicate};
pub use types::*;
