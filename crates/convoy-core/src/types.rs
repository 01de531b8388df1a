//! Core types for convoy

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opaque kind-specific configuration. Never inspected by the engine.
pub type Payload = serde_json::Value;

/// Output values emitted by a platform operation.
pub type Outputs = BTreeMap<String, String>;

/// Node identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0.to_string()
    }
}

impl std::borrow::Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The kind tag as written in declarations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Namespace,
    Secret,
    Issuer,
    Certificate,
    DataStore,
    ServiceRelease,
    ConditionalServiceRelease,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Namespace => "Namespace",
            Self::Secret => "Secret",
            Self::Issuer => "Issuer",
            Self::Certificate => "Certificate",
            Self::DataStore => "DataStore",
            Self::ServiceRelease => "ServiceRelease",
            Self::ConditionalServiceRelease => "ConditionalServiceRelease",
        };
        write!(f, "{}", s)
    }
}

/// A node's kind together with the payload forwarded to the operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum NodeKind {
    Namespace(Payload),
    Secret(Payload),
    Issuer(Payload),
    Certificate(Payload),
    DataStore(Payload),
    ServiceRelease(Payload),
    ConditionalServiceRelease(Payload),
}

impl NodeKind {
    pub fn new(kind: ResourceKind, payload: Payload) -> Self {
        match kind {
            ResourceKind::Namespace => Self::Namespace(payload),
            ResourceKind::Secret => Self::Secret(payload),
            ResourceKind::Issuer => Self::Issuer(payload),
            ResourceKind::Certificate => Self::Certificate(payload),
            ResourceKind::DataStore => Self::DataStore(payload),
            ResourceKind::ServiceRelease => Self::ServiceRelease(payload),
            ResourceKind::ConditionalServiceRelease => Self::ConditionalServiceRelease(payload),
        }
    }

    pub fn tag(&self) -> ResourceKind {
        match self {
            Self::Namespace(_) => ResourceKind::Namespace,
            Self::Secret(_) => ResourceKind::Secret,
            Self::Issuer(_) => ResourceKind::Issuer,
            Self::Certificate(_) => ResourceKind::Certificate,
            Self::DataStore(_) => ResourceKind::DataStore,
            Self::ServiceRelease(_) => ResourceKind::ServiceRelease,
            Self::ConditionalServiceRelease(_) => ResourceKind::ConditionalServiceRelease,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Self::Namespace(p)
            | Self::Secret(p)
            | Self::Issuer(p)
            | Self::Certificate(p)
            | Self::DataStore(p)
            | Self::ServiceRelease(p)
            | Self::ConditionalServiceRelease(p) => p,
        }
    }
}

/// Per-operation duration ceilings. `None` falls back to the engine default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub create: Option<Duration>,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub update: Option<Duration>,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub delete: Option<Duration>,
}

impl Timeouts {
    pub fn uniform(d: Duration) -> Self {
        Self {
            create: Some(d),
            update: Some(d),
            delete: Some(d),
        }
    }

    pub fn get(&self, action: Action) -> Option<Duration> {
        match action {
            Action::Create => self.create,
            Action::Update => self.update,
            Action::Delete => self.delete,
        }
    }

    /// Resolve against engine defaults, field by field.
    pub fn resolve(&self, action: Action, defaults: &Timeouts, fallback: Duration) -> Duration {
        self.get(action)
            .or_else(|| defaults.get(action))
            .unwrap_or(fallback)
    }
}

/// Reference to a value another node emits on success.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub from: NodeId,
    pub key: String,
}

impl OutputRef {
    pub fn new(from: impl Into<NodeId>, key: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.from, self.key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Apply,
    Destroy,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a node ended Skipped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Pruned by conditional inclusion. Counts as success for the aggregate.
    Excluded,
    /// Never got to try: an upstream node failed.
    BlockedByDependencyFailure { dependency: NodeId },
    /// Not dispatched because the run was cancelled.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excluded => write!(f, "excluded"),
            Self::BlockedByDependencyFailure { dependency } => {
                write!(f, "blocked by dependency failure ({})", dependency)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorKind {
    OperationTimeout {
        #[serde(with = "crate::duration")]
        after: Duration,
    },
    OperationFailure {
        error_kind: String,
    },
    MissingOutput {
        from: NodeId,
        key: String,
    },
}

/// Failure detail recorded on a Failed node. The message is kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: ErrorKind::OperationTimeout { after },
            message: format!(
                "operation exceeded its {} ceiling",
                crate::duration::format_duration(after)
            ),
        }
    }

    pub fn failure(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::OperationFailure {
                error_kind: error_kind.into(),
            },
            message: message.into(),
        }
    }

    pub fn missing_output(reference: &OutputRef) -> Self {
        Self {
            kind: ErrorKind::MissingOutput {
                from: reference.from.clone(),
                key: reference.key.clone(),
            },
            message: format!("output '{}' was not emitted", reference),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::OperationTimeout { .. })
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::OperationTimeout { .. } => write!(f, "timeout: {}", self.message),
            ErrorKind::OperationFailure { error_kind } => {
                write!(f, "{}: {}", error_kind, self.message)
            }
            ErrorKind::MissingOutput { .. } => write!(f, "missing output: {}", self.message),
        }
    }
}

/// Aggregate status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
