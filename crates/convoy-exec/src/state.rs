//! Run result: the persisted outcome of one apply or destroy.
//!
//! The result doubles as the state a later run diffs against: each record
//! carries the configuration last applied to the platform.

use crate::tracker::Transition;
use chrono::{DateTime, Utc};
use convoy_core::{
    Action, Error, Mode, NodeError, NodeId, NodeState, Outputs, Payload, ResourceKind, RunStatus,
    SkipReason, Timeouts,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the platform was last told about a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub fingerprint: String,
    #[serde(default)]
    pub inputs: Outputs,
    #[serde(default)]
    pub outputs: Outputs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: ResourceKind,
    #[serde(default)]
    pub spec: Payload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub timeouts: Timeouts,
    pub state: NodeState,
    /// Operation chosen for this run. `None` means nothing to do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default)]
    pub executed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    /// `None` once the resource is known to be absent from the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedState>,
}

impl NodeRecord {
    pub fn new(kind: ResourceKind, spec: Payload) -> Self {
        Self {
            kind,
            spec,
            depends_on: Vec::new(),
            parent: None,
            timeouts: Timeouts::default(),
            state: NodeState::Pending,
            action: None,
            executed: false,
            outputs: Outputs::new(),
            error: None,
            skip: None,
            started: None,
            ended: None,
            applied: None,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }

    pub fn wall_ms(&self) -> Option<u64> {
        match (self.started, self.ended) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub mode: Mode,
    #[serde(default)]
    pub name: String,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Platform operations actually invoked, prune deletes included.
    pub executed: usize,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, String>,
    /// Orphans deleted (or attempted) after an apply.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pruned: BTreeMap<NodeId, NodeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

impl RunResult {
    pub fn new(run_id: impl Into<String>, mode: Mode, name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            name: name.into(),
            started: Utc::now(),
            ended: None,
            status: RunStatus::Running,
            executed: 0,
            nodes: BTreeMap::new(),
            exports: BTreeMap::new(),
            pruned: BTreeMap::new(),
            transitions: Vec::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|r| r.state)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|r| r.state == state).count()
    }

    /// Every record whose resource may still exist, pruned leftovers included.
    /// Node records win over prune records for the same id.
    pub fn applied_records(&self) -> BTreeMap<&NodeId, &NodeRecord> {
        let mut out: BTreeMap<&NodeId, &NodeRecord> = self
            .pruned
            .iter()
            .filter(|(_, r)| r.is_applied())
            .collect();
        for (id, r) in &self.nodes {
            if r.is_applied() {
                out.insert(id, r);
            } else {
                out.remove(id);
            }
        }
        out
    }

    /// Last applied record for `id`, looking at prune leftovers too.
    pub fn applied_record(&self, id: &str) -> Option<&NodeRecord> {
        let record = match self.nodes.get(id) {
            Some(r) => Some(r),
            None => self.pruned.get(id),
        };
        record.filter(|r| r.is_applied())
    }

    pub fn wall_ms(&self) -> u64 {
        self.ended
            .map(|e| (e - self.started).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn from_yaml(content: &str) -> convoy_core::Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::state(format!("unreadable run result: {}", e)))
    }

    pub fn run_log_line(&self) -> String {
        format!(
            "| {} | {} | {} | {} | {} | {} | {}ms |",
            self.run_id,
            self.mode,
            self.name,
            self.started.format("%Y-%m-%dT%H:%M:%S"),
            self.status,
            self.executed,
            self.wall_ms(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ErrorKind;
    use std::time::Duration;

    fn applied(fp: &str) -> AppliedState {
        AppliedState {
            fingerprint: fp.into(),
            inputs: Outputs::new(),
            outputs: Outputs::from([("secretName".to_string(), "ca-tls".to_string())]),
        }
    }

    fn sample() -> RunResult {
        let mut r = RunResult::new("run-1", Mode::Apply, "bootstrap");
        let mut ca = NodeRecord::new(ResourceKind::Certificate, serde_json::json!({"isCA": true}));
        ca.state = NodeState::Succeeded;
        ca.action = Some(Action::Create);
        ca.executed = true;
        ca.applied = Some(applied("abc"));
        r.nodes.insert("ca".into(), ca);

        let mut release = NodeRecord::new(ResourceKind::ServiceRelease, Payload::Null);
        release.state = NodeState::Failed;
        release.error = Some(NodeError::timeout(Duration::from_secs(60)));
        r.nodes.insert("release".into(), release);

        let mut blocked = NodeRecord::new(ResourceKind::ServiceRelease, Payload::Null);
        blocked.state = NodeState::Skipped;
        blocked.skip = Some(SkipReason::BlockedByDependencyFailure {
            dependency: "release".into(),
        });
        r.nodes.insert("dataplane".into(), blocked);
        r.status = RunStatus::Failed;
        r.ended = Some(Utc::now());
        r
    }

    #[test]
    fn yaml_keeps_error_and_skip_detail() {
        let r = sample();
        let yaml = r.to_yaml();
        assert!(yaml.contains("operation_timeout"));
        assert!(yaml.contains("blocked_by_dependency_failure"));
        let back = RunResult::from_yaml(&yaml).unwrap();
        assert_eq!(back, r);
        assert_eq!(
            back.node("release").unwrap().error.as_ref().unwrap().kind,
            ErrorKind::OperationTimeout {
                after: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn garbage_is_a_state_error() {
        assert!(matches!(
            RunResult::from_yaml("nodes: [1, 2"),
            Err(Error::StateError(_))
        ));
    }

    #[test]
    fn applied_records_prefer_node_entries() {
        let mut r = sample();
        let mut gone = NodeRecord::new(ResourceKind::Secret, Payload::Null);
        gone.applied = Some(applied("old"));
        r.pruned.insert("legacy-secret".into(), gone.clone());
        // Pruned copy of "ca" is stale; the node entry decides.
        r.pruned.insert("ca".into(), gone);

        let ids: Vec<&str> = r.applied_records().keys().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["ca", "legacy-secret"]);
        assert_eq!(r.applied_record("ca").unwrap().applied.as_ref().unwrap().fingerprint, "abc");
        assert!(r.applied_record("release").is_none());
    }

    #[test]
    fn counts_and_log_line() {
        let r = sample();
        assert_eq!(r.count(NodeState::Succeeded), 1);
        assert_eq!(r.count(NodeState::Skipped), 1);
        let line = r.run_log_line();
        assert!(line.starts_with("| run-1 | apply | bootstrap |"));
        assert!(line.contains("| failed |"));
    }
}
