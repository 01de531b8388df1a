//! Executor-side errors. Node failures are data on the run result; these are
//! the cases where the engine itself was misused.

use convoy_core::{NodeId, NodeState};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("node '{0}' is not tracked in this run")]
    UnknownNode(NodeId),

    #[error("illegal transition for '{node}': {from} -> {to}")]
    IllegalTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("node '{node}' is {actual}, not {expected}")]
    StateMismatch {
        node: NodeId,
        expected: NodeState,
        actual: NodeState,
    },

    #[error("outputs of '{0}' were already captured")]
    OutputsAlreadyCaptured(NodeId),
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("unknown destroy target: {0}")]
    UnknownTarget(String),

    #[error(transparent)]
    Core(#[from] convoy_core::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
