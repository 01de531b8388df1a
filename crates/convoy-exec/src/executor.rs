//! Executor: walks a resolved resource graph and drives platform operations.
//!
//! One scheduling loop serves every walk:
//! - apply: dependencies before dependents, each node created, updated or
//!   left alone depending on its last applied configuration
//! - destroy: dependents and children before the nodes they rely on
//! - prune: after an apply, previously applied resources that are no longer
//!   declared (or now excluded) are deleted in reverse dependency order
//!
//! Ready nodes are dispatched as soon as their blockers succeed, bounded by
//! `max_in_flight`. Each operation runs in its own task under the node's
//! timeout. Cancellation stops dispatching; in-flight operations are left to
//! finish or time out.

use crate::error::{ExecError, Result};
use crate::operation::{OperationRequest, OperationResult, PlatformOperator};
use crate::plan::{self, decide, Decision};
use crate::state::{AppliedState, NodeRecord, RunResult};
use crate::tracker::{EventSender, StatusTracker};
use chrono::Utc;
use convoy_core::{
    Action, EngineConfig, Mode, NodeError, NodeId, NodeState, Outputs, RunStatus, SkipReason,
    Timeouts, DEFAULT_MAX_IN_FLIGHT, DEFAULT_OPERATION_TIMEOUT,
};
use convoy_graph::{ResourceGraph, ResourceNode};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Executor {
    operator: Arc<dyn PlatformOperator>,
    max_in_flight: usize,
    timeouts: Timeouts,
    cancel: CancellationToken,
    events: Option<EventSender>,
}

impl Executor {
    pub fn new(operator: Arc<dyn PlatformOperator>) -> Self {
        Self {
            operator,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            timeouts: Timeouts::uniform(DEFAULT_OPERATION_TIMEOUT),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Take in-flight bound and default timeouts from engine config.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.max_in_flight = config.max_in_flight;
        self.timeouts = config.timeouts.clone();
        self
    }

    /// 0 means unbounded.
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn default_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, graph: &ResourceGraph, mode: Mode, prior: Option<&RunResult>) -> Result<RunResult> {
        match mode {
            Mode::Apply => self.apply(graph, prior).await,
            Mode::Destroy => self.destroy(graph, prior, &[]).await,
        }
    }

    /// Converge the platform on `graph`, which must already be resolved for
    /// inclusion.
    pub async fn apply(&self, graph: &ResourceGraph, prior: Option<&RunResult>) -> Result<RunResult> {
        let run_id = new_run_id();
        info!(run_id = %run_id, name = graph.name(), nodes = graph.len(), "apply started");
        let mut tracker = StatusTracker::new(&run_id, Mode::Apply, graph.name()).with_events(self.events.clone());

        for node in graph.topological() {
            let mut record = record_for(node);
            record.applied = prior_applied(prior, node.id.as_str()).and_then(|r| r.applied.clone());
            tracker.register(node.id.clone(), record);
        }
        for node in graph.topological().filter(|n| !n.included) {
            if let Some(reason) = &node.exclusion {
                debug!(node = %node.id, %reason, "excluded");
            }
            tracker.skip(&node.id, SkipReason::Excluded)?;
        }

        let mut tasks: Vec<Task> = Vec::new();
        let mut slot: HashMap<usize, usize> = HashMap::new();
        for &g in graph.order() {
            let node = graph.node_at(g);
            if !node.included {
                continue;
            }
            slot.insert(g, tasks.len());
            tasks.push(Task {
                id: node.id.clone(),
                node: Some(node),
                record: tracker.record(node.id.as_str()).cloned().unwrap_or_else(|| record_for(node)),
                prior: prior_applied(prior, node.id.as_str()).cloned(),
                blockers: 0,
                waiters: Vec::new(),
            });
        }
        for &g in graph.order() {
            let Some(&t) = slot.get(&g) else { continue };
            for d in graph.dependency_indices(g) {
                if let Some(&b) = slot.get(d) {
                    tasks[t].blockers += 1;
                    tasks[b].waiters.push(t);
                }
            }
        }

        Schedule::new(self, &tasks, &mut tracker).run().await?;

        let cancelled = tracker.is_cancelled();
        let mut result = tracker.snapshot();
        for (name, r) in graph.exports() {
            match tracker.output(r) {
                Some(v) => {
                    result.exports.insert(name.clone(), v.to_string());
                }
                None => debug!(export = %name, from = %r, "export unavailable"),
            }
        }

        if !cancelled {
            let orphans = plan::orphans(graph, prior);
            self.prune(&mut result, prior, &orphans, &run_id, tracker.next_seq()).await?;
        }
        carry_untouched(&mut result, prior);
        Ok(finish(result))
    }

    /// Tear down `targets` together with everything that depends on them or is
    /// parented by them. No targets means the whole graph, plus any applied
    /// resources that are no longer declared.
    pub async fn destroy(&self, graph: &ResourceGraph, prior: Option<&RunResult>, targets: &[&str]) -> Result<RunResult> {
        let target_indices = targets
            .iter()
            .map(|t| graph.index_of(t).ok_or_else(|| ExecError::UnknownTarget(t.to_string())))
            .collect::<Result<Vec<usize>>>()?;
        let set = plan::destroy_set(graph, &target_indices);

        let run_id = new_run_id();
        info!(run_id = %run_id, name = graph.name(), nodes = set.len(), "destroy started");
        let mut tracker = StatusTracker::new(&run_id, Mode::Destroy, graph.name()).with_events(self.events.clone());

        let order: Vec<usize> = graph.order().iter().rev().copied().filter(|i| set.contains(i)).collect();
        let mut tasks: Vec<Task> = Vec::with_capacity(order.len());
        let mut slot: HashMap<usize, usize> = HashMap::new();
        for &g in &order {
            let node = graph.node_at(g);
            let mut record = record_for(node);
            let prior_record = prior_applied(prior, node.id.as_str());
            record.applied = prior_record.and_then(|r| r.applied.clone());
            tracker.register(node.id.clone(), record.clone());
            slot.insert(g, tasks.len());
            tasks.push(Task {
                id: node.id.clone(),
                node: None,
                record,
                prior: prior_record.cloned(),
                blockers: 0,
                waiters: Vec::new(),
            });
        }
        for &g in &order {
            let t = slot[&g];
            let before: HashSet<usize> = graph
                .dependent_indices(g)
                .iter()
                .chain(graph.child_indices(g))
                .copied()
                .collect();
            for b in before {
                if let Some(&b) = slot.get(&b) {
                    tasks[t].blockers += 1;
                    tasks[b].waiters.push(t);
                }
            }
        }

        Schedule::new(self, &tasks, &mut tracker).run().await?;

        let cancelled = tracker.is_cancelled();
        let mut result = tracker.snapshot();
        if targets.is_empty() && !cancelled {
            let undeclared: Vec<NodeId> = prior
                .map(|p| {
                    p.applied_records()
                        .into_keys()
                        .filter(|id| !graph.contains(id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            self.prune(&mut result, prior, &undeclared, &run_id, tracker.next_seq()).await?;
        }
        carry_untouched(&mut result, prior);
        Ok(finish(result))
    }

    /// Delete `orphans` in reverse recorded dependency order, folding the
    /// outcome into `result`.
    async fn prune(
        &self,
        result: &mut RunResult,
        prior: Option<&RunResult>,
        orphans: &[NodeId],
        run_id: &str,
        seq: u64,
    ) -> Result<()> {
        let Some(prior) = prior else { return Ok(()) };
        if orphans.is_empty() {
            return Ok(());
        }
        info!(run_id, orphans = orphans.len(), "pruning resources no longer in the graph");

        let mut tracker = StatusTracker::new(run_id, result.mode, result.name.clone())
            .starting_at(seq)
            .with_events(self.events.clone());
        let mut tasks: Vec<Task> = Vec::with_capacity(orphans.len());
        let mut slot: HashMap<&str, usize> = HashMap::new();
        for id in orphans.iter().rev() {
            let Some(record) = prior.applied_record(id.as_str()) else { continue };
            tracker.register(id.clone(), record.clone());
            slot.insert(id.as_str(), tasks.len());
            tasks.push(Task {
                id: id.clone(),
                node: None,
                record: record.clone(),
                prior: Some(record.clone()),
                blockers: 0,
                waiters: Vec::new(),
            });
        }
        // An orphan is deleted before what it depended on or was parented by.
        let mut edges = Vec::new();
        for (t, task) in tasks.iter().enumerate() {
            for upstream in task.record.depends_on.iter().chain(task.record.parent.iter()) {
                if let Some(&u) = slot.get(upstream.as_str()) {
                    edges.push((t, u));
                }
            }
        }
        if is_acyclic(tasks.len(), &edges) {
            for (t, u) in edges {
                tasks[u].blockers += 1;
                tasks[t].waiters.push(u);
            }
        } else {
            warn!(run_id, "recorded dependencies of orphans form a cycle; deleting without ordering");
        }

        Schedule::new(self, &tasks, &mut tracker).run().await?;

        let outcome = tracker.snapshot();
        for (id, record) in &outcome.nodes {
            if record.state == NodeState::Succeeded {
                if let Some(node) = result.nodes.get_mut(id) {
                    node.applied = None;
                }
            }
        }
        result.executed += outcome.executed;
        result.transitions.extend(outcome.transitions);
        if outcome.status != RunStatus::Succeeded && result.status == RunStatus::Succeeded {
            warn!(run_id, status = %outcome.status, "pruning did not complete");
            result.status = if outcome.status == RunStatus::Cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
        }
        result.pruned = outcome.nodes;
        Ok(())
    }

    fn limit(&self) -> usize {
        if self.max_in_flight == 0 {
            usize::MAX
        } else {
            self.max_in_flight
        }
    }
}

/// A node as the scheduling loop sees it.
struct Task<'g> {
    id: NodeId,
    /// Set for apply walks; delete walks work from the record alone.
    node: Option<&'g ResourceNode>,
    record: NodeRecord,
    /// The last applied record, for change decisions.
    prior: Option<NodeRecord>,
    blockers: usize,
    waiters: Vec<usize>,
}

enum Attempt {
    Returned(OperationResult),
    TimedOut(Duration),
    Panicked(String),
}

struct Schedule<'a, 'g> {
    exec: &'a Executor,
    tasks: &'a [Task<'g>],
    tracker: &'a mut StatusTracker,
    remaining: Vec<usize>,
    ready: VecDeque<usize>,
    running: JoinSet<(usize, Attempt)>,
    /// Dispatched nodes whose operation has not reported back.
    in_flight: BTreeSet<usize>,
    inputs: HashMap<usize, Outputs>,
}

impl<'a, 'g> Schedule<'a, 'g> {
    fn new(exec: &'a Executor, tasks: &'a [Task<'g>], tracker: &'a mut StatusTracker) -> Self {
        Self {
            exec,
            tasks,
            tracker,
            remaining: tasks.iter().map(|t| t.blockers).collect(),
            ready: VecDeque::new(),
            running: JoinSet::new(),
            in_flight: BTreeSet::new(),
            inputs: HashMap::new(),
        }
    }

    async fn run(mut self) -> Result<()> {
        for i in 0..self.tasks.len() {
            if self.remaining[i] == 0 {
                self.tracker.mark_ready(&self.tasks[i].id)?;
                self.ready.push_back(i);
            }
        }

        let limit = self.exec.limit();
        let mut cancelled = self.exec.cancel.is_cancelled();
        loop {
            if !cancelled {
                while self.running.len() < limit {
                    let Some(i) = self.ready.pop_front() else { break };
                    self.dispatch(i)?;
                }
            }
            if self.running.is_empty() {
                if self.in_flight.is_empty() {
                    break;
                }
                self.fail_lost()?;
                continue;
            }

            tokio::select! {
                _ = self.exec.cancel.cancelled(), if !cancelled => {
                    info!(in_flight = self.running.len(), "cancellation requested; waiting for in-flight operations");
                    cancelled = true;
                }
                joined = self.running.join_next() => match joined {
                    Some(Ok((i, attempt))) => self.complete(i, attempt)?,
                    Some(Err(e)) => warn!("operation task lost: {}", e),
                    None => {}
                },
            }
        }

        if cancelled {
            self.tracker.mark_cancelled();
            for task in self.tasks {
                if matches!(self.tracker.state(task.id.as_str()), Some(NodeState::Pending | NodeState::Ready)) {
                    self.tracker.skip(&task.id, SkipReason::Cancelled)?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, i: usize) -> Result<()> {
        match self.tasks[i].node {
            Some(node) => self.dispatch_apply(i, node),
            None => self.dispatch_delete(i),
        }
    }

    fn dispatch_apply(&mut self, i: usize, node: &'g ResourceNode) -> Result<()> {
        let tasks = self.tasks;
        let task = &tasks[i];
        let prior = task.prior.as_ref();

        let mut inputs = Outputs::new();
        for (name, r) in &node.inputs {
            match self.tracker.output(r) {
                Some(v) => {
                    inputs.insert(name.clone(), v.to_string());
                }
                None => {
                    let action = if prior.map(NodeRecord::is_applied).unwrap_or(false) {
                        Action::Update
                    } else {
                        Action::Create
                    };
                    self.tracker.start(&task.id, action)?;
                    self.tracker.fail(&task.id, NodeError::missing_output(r))?;
                    warn!(node = %task.id, reference = %r, "required output missing");
                    return self.settle(i, false);
                }
            }
        }

        let (action, applied) = match decide(node, &inputs, prior) {
            Decision::Unchanged => {
                let outputs = prior
                    .and_then(|r| r.applied.as_ref())
                    .map(|a| a.outputs.clone())
                    .unwrap_or_default();
                self.tracker.succeed(&task.id, outputs, Some("unchanged".into()))?;
                debug!(node = %task.id, "unchanged");
                return self.settle(i, true);
            }
            Decision::Create => (Action::Create, None),
            Decision::Update(reasons) => {
                debug!(node = %task.id, reasons = %reasons.join("; "), "update needed");
                (Action::Update, prior.and_then(|r| r.applied.as_ref()))
            }
        };

        let request = OperationRequest {
            node: task.id.clone(),
            action,
            kind: node.kind.tag(),
            spec: node.kind.payload().clone(),
            inputs: inputs.clone(),
            prior_outputs: applied.map(|a| a.outputs.clone()).unwrap_or_default(),
            timeout: node.timeouts.resolve(action, &self.exec.timeouts, DEFAULT_OPERATION_TIMEOUT),
        };
        self.inputs.insert(i, inputs);
        self.spawn(i, request)
    }

    fn dispatch_delete(&mut self, i: usize) -> Result<()> {
        let tasks = self.tasks;
        let task = &tasks[i];
        let Some(applied) = task.record.applied.as_ref() else {
            self.tracker.succeed(&task.id, Outputs::new(), Some("already absent".into()))?;
            debug!(node = %task.id, "already absent");
            return self.settle(i, true);
        };
        let request = OperationRequest {
            node: task.id.clone(),
            action: Action::Delete,
            kind: task.record.kind,
            spec: task.record.spec.clone(),
            inputs: applied.inputs.clone(),
            prior_outputs: applied.outputs.clone(),
            timeout: task
                .record
                .timeouts
                .resolve(Action::Delete, &self.exec.timeouts, DEFAULT_OPERATION_TIMEOUT),
        };
        self.spawn(i, request)
    }

    fn spawn(&mut self, i: usize, request: OperationRequest) -> Result<()> {
        let id = request.node.clone();
        self.tracker.start(&id, request.action)?;
        if let Some(r) = self.tracker.record_mut(id.as_str()) {
            r.executed = true;
        }
        debug!(node = %id, action = %request.action, timeout = ?request.timeout, "dispatching");

        self.in_flight.insert(i);
        let operator = self.exec.operator.clone();
        let limit = request.timeout;
        self.running.spawn(async move {
            let mut handle = tokio::spawn(async move { operator.execute(request).await });
            let attempt = match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(result)) => Attempt::Returned(result),
                Ok(Err(e)) => Attempt::Panicked(panic_message(e)),
                Err(_) => {
                    handle.abort();
                    Attempt::TimedOut(limit)
                }
            };
            (i, attempt)
        });
        Ok(())
    }

    fn complete(&mut self, i: usize, attempt: Attempt) -> Result<()> {
        self.in_flight.remove(&i);
        let tasks = self.tasks;
        let task = &tasks[i];
        let action = self.tracker.record(task.id.as_str()).and_then(|r| r.action);
        let error = match attempt {
            Attempt::Returned(OperationResult::Success { outputs }) => {
                let applied = match (task.node, action) {
                    (_, Some(Action::Delete)) | (None, _) => None,
                    (Some(node), _) => Some(AppliedState {
                        fingerprint: node.fingerprint.clone(),
                        inputs: self.inputs.remove(&i).unwrap_or_default(),
                        outputs: outputs.clone(),
                    }),
                };
                self.tracker.succeed(&task.id, outputs, None)?;
                if let Some(r) = self.tracker.record_mut(task.id.as_str()) {
                    r.applied = applied;
                    info!(node = %task.id, action = ?r.action, wall_ms = r.wall_ms().unwrap_or(0), "node succeeded");
                }
                return self.settle(i, true);
            }
            Attempt::Returned(OperationResult::Failure { error_kind, message }) => {
                NodeError::failure(error_kind, message)
            }
            Attempt::TimedOut(after) => NodeError::timeout(after),
            Attempt::Panicked(message) => NodeError::failure("panic", message),
        };
        warn!(node = %task.id, action = ?action, error = %error, "node failed");
        self.inputs.remove(&i);
        self.tracker.fail(&task.id, error)?;
        self.settle(i, false)
    }

    /// Fail nodes whose operation task ended without reporting. A lost
    /// `JoinError` does not say which node it carried, so this runs once the
    /// join set has drained.
    fn fail_lost(&mut self) -> Result<()> {
        let tasks = self.tasks;
        for i in std::mem::take(&mut self.in_flight) {
            let id = &tasks[i].id;
            warn!(node = %id, "operation task lost before reporting");
            self.inputs.remove(&i);
            self.tracker.fail(
                id,
                NodeError::failure("lost", "operation task ended without reporting a result"),
            )?;
            self.settle(i, false)?;
        }
        Ok(())
    }

    /// Release waiters after a success, or block every transitive waiter
    /// after a failure.
    fn settle(&mut self, i: usize, succeeded: bool) -> Result<()> {
        let tasks = self.tasks;
        if succeeded {
            for &w in &tasks[i].waiters {
                self.remaining[w] -= 1;
                if self.remaining[w] == 0 && self.tracker.state(tasks[w].id.as_str()) == Some(NodeState::Pending) {
                    self.tracker.mark_ready(&tasks[w].id)?;
                    self.ready.push_back(w);
                }
            }
            return Ok(());
        }

        let failed = tasks[i].id.clone();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = tasks[i].waiters.iter().copied().collect();
        while let Some(w) = queue.pop_front() {
            if !seen.insert(w) {
                continue;
            }
            let id = &tasks[w].id;
            if self.tracker.state(id.as_str()) == Some(NodeState::Pending) {
                self.tracker.skip(
                    id,
                    SkipReason::BlockedByDependencyFailure {
                        dependency: failed.clone(),
                    },
                )?;
                debug!(node = %id, dependency = %failed, "blocked");
            }
            queue.extend(tasks[w].waiters.iter().copied());
        }
        Ok(())
    }
}

fn new_run_id() -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &short[..8])
}

fn record_for(node: &ResourceNode) -> NodeRecord {
    let mut record = NodeRecord::new(node.kind.tag(), node.kind.payload().clone());
    record.depends_on = node.depends_on.iter().cloned().collect();
    record.parent = node.parent.clone();
    record.timeouts = node.timeouts.clone();
    record
}

fn prior_applied<'p>(prior: Option<&'p RunResult>, id: &str) -> Option<&'p NodeRecord> {
    prior.and_then(|p| p.applied_record(id))
}

/// Keep prior records of resources this run neither touched nor pruned.
fn carry_untouched(result: &mut RunResult, prior: Option<&RunResult>) {
    let Some(prior) = prior else { return };
    let carried: BTreeMap<NodeId, NodeRecord> = prior
        .applied_records()
        .into_iter()
        .filter(|(id, _)| !result.nodes.contains_key(*id) && !result.pruned.contains_key(*id))
        .map(|(id, r)| (id.clone(), r.clone()))
        .collect();
    if !carried.is_empty() {
        debug!(count = carried.len(), "carrying untouched records");
    }
    result.nodes.extend(carried);
}

fn finish(mut result: RunResult) -> RunResult {
    result.ended = Some(Utc::now());
    info!(
        run_id = %result.run_id,
        mode = %result.mode,
        status = %result.status,
        executed = result.executed,
        wall_ms = result.wall_ms(),
        "run complete"
    );
    result
}

fn is_acyclic(n: usize, edges: &[(usize, usize)]) -> bool {
    let mut indegree = vec![0usize; n];
    let mut out = vec![Vec::new(); n];
    for &(a, b) in edges {
        out[a].push(b);
        indegree[b] += 1;
    }
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut seen = 0;
    while let Some(i) = queue.pop_front() {
        seen += 1;
        for &j in &out[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                queue.push_back(j);
            }
        }
    }
    seen == n
}

fn panic_message(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "operator panicked".to_string()
    }
}
