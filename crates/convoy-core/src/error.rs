//! Error types for convoy

use crate::types::Action;
use std::fmt;
use thiserror::Error;

/// Which declared relation a reference came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    DependsOn,
    Parent,
    Input,
    Export,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependsOn => write!(f, "depends on"),
            Self::Parent => write!(f, "is parented by"),
            Self::Input => write!(f, "reads an output of"),
            Self::Export => write!(f, "exports an output of"),
        }
    }
}

/// Build-time graph errors. Any of these aborts the run before scheduling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("dangling reference: '{node}' {relation} '{target}', which is not declared")]
    DanglingReference {
        node: String,
        relation: Relation,
        target: String,
    },

    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("node '{0}' is a conditional release but declares no `when` predicate")]
    MissingPredicate(String),

    #[error("declaration #{0} has an empty id")]
    EmptyId(usize),

    #[error("node '{node}' declares a zero {action} timeout")]
    ZeroTimeout { node: String, action: Action },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid flag: {0}")]
    InvalidFlag(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("declaration error: {0}")]
    DeclarationError(String),

    #[error("state error: {0}")]
    StateError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("toml error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn declaration(message: impl Into<String>) -> Self {
        Self::DeclarationError(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::StateError(message.into())
    }
}

impl GraphError {
    pub fn dangling(node: impl Into<String>, relation: Relation, target: impl Into<String>) -> Self {
        Self::DanglingReference {
            node: node.into(),
            relation,
            target: target.into(),
        }
    }
}
