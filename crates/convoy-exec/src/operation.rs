//! The platform operation contract.
//!
//! An operator is whatever actually creates, updates or deletes a namespace,
//! certificate, issuer, secret or service release. The engine hands it the
//! untouched payload plus resolved inputs and observes the result. Timeouts
//! are enforced by the caller, not the operator.

use convoy_core::{Action, NodeId, Outputs, Payload, ResourceKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One operation on one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub node: NodeId,
    pub action: Action,
    pub kind: ResourceKind,
    /// Forwarded verbatim from the declaration.
    pub spec: Payload,
    /// Input values resolved from upstream outputs.
    pub inputs: Outputs,
    /// Outputs recorded the last time this node was applied.
    pub prior_outputs: Outputs,
    #[serde(with = "convoy_core::duration")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OperationResult {
    Success { outputs: Outputs },
    Failure { error_kind: String, message: String },
}

impl OperationResult {
    pub fn success(outputs: Outputs) -> Self {
        Self::Success { outputs }
    }

    pub fn empty() -> Self {
        Self::Success {
            outputs: Outputs::new(),
        }
    }

    pub fn failure(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            error_kind: error_kind.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Executes node operations against a platform.
#[async_trait::async_trait]
pub trait PlatformOperator: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: OperationRequest) -> OperationResult;
}
