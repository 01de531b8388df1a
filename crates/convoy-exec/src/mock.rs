//! MockOperator: scripted platform responses for tests and rehearsals.
//!
//! Behaviors are keyed by node id, optionally narrowed to one action. Every
//! call is logged with start/finish sequence numbers, and the high-water mark
//! of concurrent calls is kept for concurrency assertions.

use crate::operation::{OperationRequest, OperationResult, PlatformOperator};
use convoy_core::{Action, NodeId, Outputs};
use convoy_graph::ResourceGraph;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum MockBehavior {
    /// Return these outputs immediately.
    Succeed(Outputs),
    /// Sleep, then return these outputs.
    Delay(Duration, Outputs),
    /// Return an operation failure.
    Fail { error_kind: String, message: String },
    /// Never return. Only a timeout ends the call.
    Hang,
    /// Panic inside the operator.
    Panic(String),
}

impl MockBehavior {
    pub fn succeed<I, K, V>(outputs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Succeed(outputs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn fail(error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail {
            error_kind: error_kind.into(),
            message: message.into(),
        }
    }

    pub fn delay(d: Duration) -> Self {
        Self::Delay(d, Outputs::new())
    }
}

/// One recorded operator call.
#[derive(Clone, Debug)]
pub struct MockCall {
    pub node: NodeId,
    pub action: Action,
    pub inputs: Outputs,
    pub prior_outputs: Outputs,
    pub timeout: Duration,
    pub started_seq: u64,
    pub finished_seq: Option<u64>,
}

pub struct MockOperator {
    behaviors: Mutex<HashMap<(String, Option<Action>), MockBehavior>>,
    defaults: Mutex<HashMap<String, Outputs>>,
    calls: Mutex<Vec<MockCall>>,
    clock: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for MockOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOperator {
    /// Every call succeeds with no outputs unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// A mock that emits a placeholder for every output the graph references,
    /// so inputs and exports resolve during a dry rehearsal.
    pub fn rehearsal(graph: &ResourceGraph) -> Self {
        let mock = Self::new();
        {
            let mut defaults = lock(&mock.defaults);
            let refs = graph
                .nodes()
                .flat_map(|n| n.inputs.values())
                .chain(graph.exports().values());
            for r in refs {
                defaults
                    .entry(r.from.to_string())
                    .or_default()
                    .insert(r.key.clone(), format!("{}.{}", r.from, r.key));
            }
        }
        mock
    }

    /// Script `node` for every action.
    pub fn on(self, node: &str, behavior: MockBehavior) -> Self {
        lock(&self.behaviors).insert((node.to_string(), None), behavior);
        self
    }

    /// Script `node` for one action only.
    pub fn on_action(self, node: &str, action: Action, behavior: MockBehavior) -> Self {
        lock(&self.behaviors).insert((node.to_string(), Some(action)), behavior);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_for(&self, node: &str) -> Vec<MockCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.node.as_str() == node)
            .cloned()
            .collect()
    }

    /// Node ids in the order their calls started.
    pub fn call_order(&self) -> Vec<String> {
        let mut calls = self.calls();
        calls.sort_by_key(|c| c.started_seq);
        calls.into_iter().map(|c| c.node.to_string()).collect()
    }

    /// Highest number of calls observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, node: &str, action: Action) -> MockBehavior {
        let behaviors = lock(&self.behaviors);
        if let Some(b) = behaviors
            .get(&(node.to_string(), Some(action)))
            .or_else(|| behaviors.get(&(node.to_string(), None)))
        {
            return b.clone();
        }
        let outputs = if action == Action::Delete {
            Outputs::new()
        } else {
            lock(&self.defaults).get(node).cloned().unwrap_or_default()
        };
        MockBehavior::Succeed(outputs)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Decrements the in-flight gauge even if the call is dropped mid-flight.
struct InFlight<'a> {
    op: &'a MockOperator,
    index: usize,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.op.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.finished {
            let seq = self.op.tick();
            if let Some(call) = lock(&self.op.calls).get_mut(self.index) {
                call.finished_seq = Some(seq);
            }
        }
    }
}

#[async_trait::async_trait]
impl PlatformOperator for MockOperator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, request: OperationRequest) -> OperationResult {
        let behavior = self.behavior_for(request.node.as_str(), request.action);

        let index = {
            let mut calls = lock(&self.calls);
            calls.push(MockCall {
                node: request.node.clone(),
                action: request.action,
                inputs: request.inputs.clone(),
                prior_outputs: request.prior_outputs.clone(),
                timeout: request.timeout,
                started_seq: self.tick(),
                finished_seq: None,
            });
            calls.len() - 1
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut guard = InFlight {
            op: self,
            index,
            finished: false,
        };

        let result = match behavior {
            MockBehavior::Succeed(outputs) => OperationResult::success(outputs),
            MockBehavior::Delay(d, outputs) => {
                tokio::time::sleep(d).await;
                OperationResult::success(outputs)
            }
            MockBehavior::Fail {
                error_kind,
                message,
            } => OperationResult::failure(error_kind, message),
            MockBehavior::Hang => std::future::pending().await,
            MockBehavior::Panic(message) => panic!("{}", message),
        };
        guard.finished = true;
        result
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking scripted call must not poison later assertions.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::{Declaration, ResourceKind};

    fn request(node: &str, action: Action) -> OperationRequest {
        OperationRequest {
            node: NodeId::new(node),
            action,
            kind: ResourceKind::Secret,
            spec: serde_json::Value::Null,
            inputs: Outputs::new(),
            prior_outputs: Outputs::new(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn scripted_and_default_behaviors() {
        let mock = MockOperator::new()
            .on("ca", MockBehavior::succeed([("secretName", "ca-tls")]))
            .on_action("db", Action::Update, MockBehavior::fail("exit:1", "helm upgrade failed"));

        match mock.execute(request("ca", Action::Create)).await {
            OperationResult::Success { outputs } => assert_eq!(outputs["secretName"], "ca-tls"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(mock.execute(request("db", Action::Create)).await.is_success());
        assert!(!mock.execute(request("db", Action::Update)).await.is_success());
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.call_order(), vec!["ca", "db", "db"]);
        assert!(mock.calls().iter().all(|c| c.finished_seq.is_some()));
    }

    #[tokio::test]
    async fn tracks_peak_concurrency() {
        let mock = std::sync::Arc::new(
            MockOperator::new()
                .on("a", MockBehavior::delay(Duration::from_millis(50)))
                .on("b", MockBehavior::delay(Duration::from_millis(50))),
        );
        let (m1, m2) = (mock.clone(), mock.clone());
        let (ra, rb) = tokio::join!(
            async move { m1.execute(request("a", Action::Create)).await },
            async move { m2.execute(request("b", Action::Create)).await },
        );
        assert!(ra.is_success() && rb.is_success());
        assert_eq!(mock.max_concurrency(), 2);
    }

    #[tokio::test]
    async fn dropped_call_releases_gauge() {
        let mock = MockOperator::new().on("stuck", MockBehavior::Hang);
        let r = tokio::time::timeout(Duration::from_millis(20), mock.execute(request("stuck", Action::Create))).await;
        assert!(r.is_err());
        assert_eq!(mock.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(mock.calls_for("stuck")[0].finished_seq, None);
    }

    #[tokio::test]
    async fn rehearsal_emits_referenced_outputs() {
        let graph = ResourceGraph::from_declarations(
            "t",
            vec![
                Declaration::new("key", ResourceKind::Secret),
                Declaration::new("cert", ResourceKind::Certificate).input("pem", "key", "privateKeyPem"),
            ],
        )
        .unwrap();
        let mock = MockOperator::rehearsal(&graph);
        match mock.execute(request("key", Action::Create)).await {
            OperationResult::Success { outputs } => {
                assert_eq!(outputs["privateKeyPem"], "key.privateKeyPem")
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
