//! Change planning: what an apply or destroy would do to each node.
//!
//! `decide` is the single rule the executor uses at dispatch time. The
//! `ChangePlan` preview runs the same rule ahead of time, estimating inputs
//! from prior outputs.

use crate::state::{NodeRecord, RunResult};
use convoy_core::{Action, Mode, NodeId, NodeState, Outputs};
use convoy_graph::{Exclusion, ResourceGraph, ResourceNode};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Outcome of comparing a node with its last applied configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Create,
    Update(Vec<String>),
    Unchanged,
}

impl Decision {
    pub fn action(&self) -> Option<Action> {
        match self {
            Self::Create => Some(Action::Create),
            Self::Update(_) => Some(Action::Update),
            Self::Unchanged => None,
        }
    }
}

/// Create when never applied; Update when the fingerprint or resolved inputs
/// moved, or the last attempt failed on an existing resource; otherwise
/// Unchanged.
pub fn decide(node: &ResourceNode, inputs: &Outputs, prior: Option<&NodeRecord>) -> Decision {
    let (record, applied) = match prior.and_then(|r| r.applied.as_ref().map(|a| (r, a))) {
        Some(pair) => pair,
        None => return Decision::Create,
    };

    let mut reasons = Vec::new();
    if applied.fingerprint != node.fingerprint {
        reasons.push("configuration changed".to_string());
    }
    if &applied.inputs != inputs {
        let changed: Vec<&str> = inputs
            .keys()
            .chain(applied.inputs.keys())
            .filter(|k| inputs.get(*k) != applied.inputs.get(*k))
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        reasons.push(format!("inputs changed: {}", changed.join(", ")));
    }
    if record.state == NodeState::Failed {
        reasons.push("previous attempt failed".to_string());
    }

    if reasons.is_empty() {
        Decision::Unchanged
    } else {
        Decision::Update(reasons)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Unchanged,
    Delete,
    /// Destroy of a node that was never applied.
    Absent,
    Excluded,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Unchanged => "unchanged",
            Self::Delete => "delete",
            Self::Absent => "absent",
            Self::Excluded => "excluded",
        };
        f.pad(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    pub node: NodeId,
    pub change: ChangeKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChangePlan {
    pub mode: Mode,
    /// In execution order.
    pub changes: Vec<PlannedChange>,
    /// Previously applied resources an apply would delete.
    pub orphans: Vec<NodeId>,
}

impl ChangePlan {
    pub fn count(&self, kind: &ChangeKind) -> usize {
        self.changes.iter().filter(|c| &c.change == kind).count()
    }

    pub fn get(&self, id: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.node.as_str() == id)
    }

    /// True when applying would invoke no operation at all.
    pub fn is_noop(&self) -> bool {
        self.orphans.is_empty()
            && self
                .changes
                .iter()
                .all(|c| matches!(c.change, ChangeKind::Unchanged | ChangeKind::Excluded | ChangeKind::Absent))
    }

    /// Preview an apply of `graph` (already resolved for inclusion) over `prior`.
    ///
    /// Inputs from nodes that would be left unchanged are taken from prior
    /// outputs. Inputs from nodes that would run are unknown until they do, so
    /// an applied consumer is shown as an update.
    pub fn apply(graph: &ResourceGraph, prior: Option<&RunResult>) -> Self {
        let mut changes = Vec::with_capacity(graph.len());
        let mut settled: BTreeMap<NodeId, Outputs> = BTreeMap::new();

        for node in graph.topological() {
            if !node.included {
                let reasons = node.exclusion.iter().map(Exclusion::to_string).collect();
                changes.push(PlannedChange {
                    node: node.id.clone(),
                    change: ChangeKind::Excluded,
                    reasons,
                });
                continue;
            }

            let record = prior.and_then(|p| p.applied_record(node.id.as_str()));
            let mut inputs = Outputs::new();
            let mut pending = Vec::new();
            for (name, r) in &node.inputs {
                match settled.get(&r.from).and_then(|o| o.get(&r.key)) {
                    Some(v) => {
                        inputs.insert(name.clone(), v.clone());
                    }
                    None => pending.push(r.from.to_string()),
                }
            }

            let decision = decide(node, &inputs, record);
            let (change, reasons) = match decision {
                Decision::Create => (ChangeKind::Create, Vec::new()),
                Decision::Unchanged => (ChangeKind::Unchanged, Vec::new()),
                Decision::Update(reasons) if pending.is_empty() => (ChangeKind::Update, reasons),
                Decision::Update(mut reasons) => {
                    pending.sort();
                    pending.dedup();
                    reasons.retain(|r| !r.starts_with("inputs changed"));
                    reasons.push(format!("inputs pending changes to {}", pending.join(", ")));
                    (ChangeKind::Update, reasons)
                }
            };

            if change == ChangeKind::Unchanged {
                if let Some(applied) = record.and_then(|r| r.applied.as_ref()) {
                    settled.insert(node.id.clone(), applied.outputs.clone());
                }
            }
            changes.push(PlannedChange {
                node: node.id.clone(),
                change,
                reasons,
            });
        }

        Self {
            mode: Mode::Apply,
            changes,
            orphans: orphans(graph, prior),
        }
    }

    /// Preview a destroy of `targets` (all nodes when empty).
    pub fn destroy(graph: &ResourceGraph, prior: Option<&RunResult>, targets: &[usize]) -> Self {
        let set = destroy_set(graph, targets);
        let changes = graph
            .order()
            .iter()
            .rev()
            .filter(|i| set.contains(i))
            .map(|&i| {
                let id = graph.node_at(i).id.clone();
                let applied = prior.and_then(|p| p.applied_record(id.as_str())).is_some();
                PlannedChange {
                    node: id,
                    change: if applied { ChangeKind::Delete } else { ChangeKind::Absent },
                    reasons: Vec::new(),
                }
            })
            .collect();
        Self {
            mode: Mode::Destroy,
            changes,
            orphans: Vec::new(),
        }
    }
}

/// Previously applied resources that are no longer declared or now excluded.
pub fn orphans(graph: &ResourceGraph, prior: Option<&RunResult>) -> Vec<NodeId> {
    let Some(prior) = prior else {
        return Vec::new();
    };
    prior
        .applied_records()
        .into_keys()
        .filter(|id| graph.get(id.as_str()).map(|n| !n.included).unwrap_or(true))
        .cloned()
        .collect()
}

/// Targets closed under children and dependents. Empty targets mean every node.
pub fn destroy_set(graph: &ResourceGraph, targets: &[usize]) -> HashSet<usize> {
    if targets.is_empty() {
        return (0..graph.len()).collect();
    }
    let mut set: HashSet<usize> = HashSet::new();
    let mut stack: Vec<usize> = targets.to_vec();
    while let Some(i) = stack.pop() {
        if !set.insert(i) {
            continue;
        }
        stack.extend(graph.dependent_indices(i));
        stack.extend(graph.child_indices(i));
    }
    set
}
