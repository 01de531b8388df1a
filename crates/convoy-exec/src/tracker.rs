//! StatusTracker: per-node lifecycle state, the append-only transition log,
//! captured outputs and the aggregate run status.
//!
//! Owned by the executor's scheduling loop. Workers never touch it; they hand
//! results back and the loop records them, so no locking is needed.

use crate::error::TrackerError;
use crate::state::{NodeRecord, RunResult};
use chrono::{DateTime, Utc};
use convoy_core::{
    Action, Mode, NodeError, NodeId, NodeState, OutputRef, Outputs, RunStatus, SkipReason,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

/// One state change, in the order it was recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub node: NodeId,
    pub from: NodeState,
    pub to: NodeState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A transition as forwarded to event sinks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    #[serde(flatten)]
    pub transition: Transition,
}

pub type EventSender = mpsc::UnboundedSender<RunEvent>;

/// Whether `from -> to` is a legal lifecycle step.
///
/// `Ready -> Succeeded` covers nodes that need no operation: unchanged on
/// apply, already absent on destroy.
pub fn is_legal(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    matches!(
        (from, to),
        (Pending, Ready)
            | (Pending, Skipped)
            | (Ready, Running)
            | (Ready, Succeeded)
            | (Ready, Skipped)
            | (Running, Succeeded)
            | (Running, Failed)
    )
}

pub struct StatusTracker {
    run_id: String,
    mode: Mode,
    name: String,
    started: DateTime<Utc>,
    records: BTreeMap<NodeId, NodeRecord>,
    captured: HashSet<NodeId>,
    log: Vec<Transition>,
    next_seq: u64,
    cancelled: bool,
    events: Option<EventSender>,
}

impl StatusTracker {
    pub fn new(run_id: impl Into<String>, mode: Mode, name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            name: name.into(),
            started: Utc::now(),
            records: BTreeMap::new(),
            captured: HashSet::new(),
            log: Vec::new(),
            next_seq: 1,
            cancelled: false,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventSender>) -> Self {
        self.events = events;
        self
    }

    /// Continue numbering after another tracker's log.
    pub fn starting_at(mut self, seq: u64) -> Self {
        self.next_seq = seq;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Track a node. Its state is reset to Pending.
    pub fn register(&mut self, id: NodeId, mut record: NodeRecord) {
        record.state = NodeState::Pending;
        record.outputs.clear();
        record.error = None;
        record.skip = None;
        record.action = None;
        record.executed = false;
        record.started = None;
        record.ended = None;
        self.records.insert(id, record);
    }

    /// Append a transition after checking the node is in `from` and the step
    /// is legal.
    pub fn record_transition(
        &mut self,
        node: &NodeId,
        from: NodeState,
        to: NodeState,
        detail: Option<String>,
    ) -> Result<(), TrackerError> {
        let record = self
            .records
            .get_mut(node)
            .ok_or_else(|| TrackerError::UnknownNode(node.clone()))?;
        if record.state != from {
            return Err(TrackerError::StateMismatch {
                node: node.clone(),
                expected: from,
                actual: record.state,
            });
        }
        if !is_legal(from, to) {
            return Err(TrackerError::IllegalTransition {
                node: node.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        record.state = to;
        if to == NodeState::Running {
            record.started = Some(now);
        }
        if to.is_terminal() {
            record.started.get_or_insert(now);
            record.ended = Some(now);
        }

        let transition = Transition {
            seq: self.next_seq,
            node: node.clone(),
            from,
            to,
            at: now,
            detail,
        };
        self.next_seq += 1;
        debug!(node = %node, %from, %to, seq = transition.seq, "transition");

        if let Some(tx) = &self.events {
            // A closed sink only means nobody is listening any more.
            let _ = tx.send(RunEvent {
                run_id: self.run_id.clone(),
                transition: transition.clone(),
            });
        }
        self.log.push(transition);
        Ok(())
    }

    /// Transition from whatever state the node is in now.
    pub fn advance(&mut self, node: &NodeId, to: NodeState, detail: Option<String>) -> Result<(), TrackerError> {
        let from = self
            .state(node.as_str())
            .ok_or_else(|| TrackerError::UnknownNode(node.clone()))?;
        self.record_transition(node, from, to, detail)
    }

    pub fn mark_ready(&mut self, node: &NodeId) -> Result<(), TrackerError> {
        self.record_transition(node, NodeState::Pending, NodeState::Ready, None)
    }

    /// Ready -> Running for `action`.
    pub fn start(&mut self, node: &NodeId, action: Action) -> Result<(), TrackerError> {
        self.record_transition(node, NodeState::Ready, NodeState::Running, Some(action.to_string()))?;
        if let Some(r) = self.records.get_mut(node) {
            r.action = Some(action);
        }
        Ok(())
    }

    /// Running (or Ready, for no-op nodes) -> Succeeded, capturing outputs.
    pub fn succeed(&mut self, node: &NodeId, outputs: Outputs, detail: Option<String>) -> Result<(), TrackerError> {
        self.capture_outputs(node, outputs)?;
        self.advance(node, NodeState::Succeeded, detail)
    }

    pub fn fail(&mut self, node: &NodeId, error: NodeError) -> Result<(), TrackerError> {
        let detail = error.to_string();
        self.record_transition(node, NodeState::Running, NodeState::Failed, Some(detail))?;
        if let Some(r) = self.records.get_mut(node) {
            r.error = Some(error);
        }
        Ok(())
    }

    pub fn skip(&mut self, node: &NodeId, reason: SkipReason) -> Result<(), TrackerError> {
        self.advance(node, NodeState::Skipped, Some(reason.to_string()))?;
        if let Some(r) = self.records.get_mut(node) {
            r.skip = Some(reason);
        }
        Ok(())
    }

    /// Outputs are write-once per node.
    pub fn capture_outputs(&mut self, node: &NodeId, outputs: Outputs) -> Result<(), TrackerError> {
        let record = self
            .records
            .get_mut(node)
            .ok_or_else(|| TrackerError::UnknownNode(node.clone()))?;
        if !self.captured.insert(node.clone()) {
            return Err(TrackerError::OutputsAlreadyCaptured(node.clone()));
        }
        record.outputs = outputs;
        Ok(())
    }

    /// A dependency's output, available as soon as that node has succeeded.
    pub fn output(&self, reference: &OutputRef) -> Option<&str> {
        let record = self.records.get(&reference.from)?;
        if record.state != NodeState::Succeeded {
            return None;
        }
        record.outputs.get(&reference.key).map(String::as_str)
    }

    pub fn state(&self, node: &str) -> Option<NodeState> {
        self.records.get(node).map(|r| r.state)
    }

    pub fn record(&self, node: &str) -> Option<&NodeRecord> {
        self.records.get(node)
    }

    pub(crate) fn record_mut(&mut self, node: &str) -> Option<&mut NodeRecord> {
        self.records.get_mut(node)
    }

    pub fn records(&self) -> &BTreeMap<NodeId, NodeRecord> {
        &self.records
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.log
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Succeeded only when every node is Succeeded or Skipped for a reason
    /// other than a dependency failure. Cancellation wins over failure.
    pub fn aggregate(&self) -> RunStatus {
        if self.cancelled {
            return RunStatus::Cancelled;
        }
        let mut unfinished = false;
        for record in self.records.values() {
            match (record.state, &record.skip) {
                (NodeState::Failed, _) => return RunStatus::Failed,
                (NodeState::Skipped, Some(SkipReason::BlockedByDependencyFailure { .. })) => {
                    return RunStatus::Failed
                }
                (NodeState::Succeeded | NodeState::Skipped, _) => {}
                _ => unfinished = true,
            }
        }
        if unfinished {
            RunStatus::Running
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn executed(&self) -> usize {
        self.records.values().filter(|r| r.executed).count()
    }

    pub fn snapshot(&self) -> RunResult {
        let status = self.aggregate();
        RunResult {
            run_id: self.run_id.clone(),
            mode: self.mode,
            name: self.name.clone(),
            started: self.started,
            ended: (status != RunStatus::Running).then(Utc::now),
            status,
            executed: self.executed(),
            nodes: self.records.clone(),
            exports: BTreeMap::new(),
            pruned: BTreeMap::new(),
            transitions: self.log.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::{Payload, ResourceKind};

    fn tracker(ids: &[&str]) -> StatusTracker {
        let mut t = StatusTracker::new("run-test", Mode::Apply, "test");
        for id in ids {
            t.register(NodeId::new(*id), NodeRecord::new(ResourceKind::Secret, Payload::Null));
        }
        t
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut t = tracker(&["a"]);
        t.mark_ready(&id("a")).unwrap();
        t.start(&id("a"), Action::Create).unwrap();
        t.succeed(&id("a"), Outputs::from([("k".to_string(), "v".to_string())]), None)
            .unwrap();
        let r = t.record("a").unwrap();
        assert_eq!(r.state, NodeState::Succeeded);
        assert_eq!(r.action, Some(Action::Create));
        assert!(r.started.is_some() && r.ended.is_some());
        let seqs: Vec<u64> = t.transitions().iter().map(|tr| tr.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(t.aggregate(), RunStatus::Succeeded);
    }

    #[test]
    fn rejects_illegal_and_stale_transitions() {
        let mut t = tracker(&["a"]);
        assert_eq!(
            t.record_transition(&id("a"), NodeState::Pending, NodeState::Running, None),
            Err(TrackerError::IllegalTransition {
                node: id("a"),
                from: NodeState::Pending,
                to: NodeState::Running
            })
        );
        assert!(matches!(
            t.record_transition(&id("a"), NodeState::Ready, NodeState::Running, None),
            Err(TrackerError::StateMismatch { .. })
        ));
        assert!(matches!(
            t.mark_ready(&id("ghost")),
            Err(TrackerError::UnknownNode(_))
        ));
        assert!(t.transitions().is_empty());
    }

    #[test]
    fn outputs_are_write_once_and_gated_on_success() {
        let mut t = tracker(&["ca"]);
        let r = OutputRef::new("ca", "secretName");
        t.mark_ready(&id("ca")).unwrap();
        t.start(&id("ca"), Action::Create).unwrap();
        assert_eq!(t.output(&r), None);
        t.succeed(&id("ca"), Outputs::from([("secretName".to_string(), "ca-tls".to_string())]), None)
            .unwrap();
        assert_eq!(t.output(&r), Some("ca-tls"));
        assert_eq!(
            t.capture_outputs(&id("ca"), Outputs::new()),
            Err(TrackerError::OutputsAlreadyCaptured(id("ca")))
        );
    }

    #[test]
    fn aggregate_distinguishes_exclusion_from_blocking() {
        let mut t = tracker(&["a", "b"]);
        t.skip(&id("a"), SkipReason::Excluded).unwrap();
        t.mark_ready(&id("b")).unwrap();
        assert_eq!(t.aggregate(), RunStatus::Running);
        t.succeed(&id("b"), Outputs::new(), Some("unchanged".into())).unwrap();
        assert_eq!(t.aggregate(), RunStatus::Succeeded);

        let mut t = tracker(&["a"]);
        t.skip(&id("a"), SkipReason::BlockedByDependencyFailure { dependency: id("x") })
            .unwrap();
        assert_eq!(t.aggregate(), RunStatus::Failed);
    }

    #[test]
    fn failure_records_error() {
        let mut t = tracker(&["a"]);
        t.mark_ready(&id("a")).unwrap();
        t.start(&id("a"), Action::Update).unwrap();
        t.fail(&id("a"), NodeError::failure("exit:1", "boom")).unwrap();
        assert_eq!(t.aggregate(), RunStatus::Failed);
        assert_eq!(t.record("a").unwrap().error.as_ref().unwrap().message, "boom");
        assert!(t.transitions().last().unwrap().detail.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn cancellation_wins() {
        let mut t = tracker(&["a"]);
        t.skip(&id("a"), SkipReason::Cancelled).unwrap();
        t.mark_cancelled();
        assert_eq!(t.aggregate(), RunStatus::Cancelled);
        assert_eq!(t.snapshot().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn forwards_transitions_to_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = tracker(&["a"]).with_events(Some(tx));
        t.mark_ready(&id("a")).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id, "run-test");
        assert_eq!(event.transition.to, NodeState::Ready);
    }

    #[test]
    fn numbering_can_continue() {
        let mut t = tracker(&["a"]).starting_at(42);
        t.skip(&id("a"), SkipReason::Excluded).unwrap();
        assert_eq!(t.transitions()[0].seq, 42);
        assert_eq!(t.next_seq(), 43);
    }
}
