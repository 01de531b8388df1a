//! Resource graph: validated, topologically ordered view of a declaration set.
//!
//! Built once per run. Nodes are addressed by index internally; the executor
//! walks `order()` and the adjacency slices directly.

use crate::inclusion::Exclusion;
use convoy_core::{
    Action, Declaration, DeclarationSet, GraphError, NodeId, NodeKind, OutputRef, Predicate, Relation,
    ResourceKind, Timeouts,
};
use ring::digest::{digest, SHA256};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

/// The typed unit of deployable state.
#[derive(Clone, Debug)]
pub struct ResourceNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Explicit `dependsOn` plus every node an input reads from.
    pub depends_on: BTreeSet<NodeId>,
    pub parent: Option<NodeId>,
    pub timeouts: Timeouts,
    pub when: Option<Predicate>,
    pub inputs: BTreeMap<String, OutputRef>,
    /// Set by `inclusion::resolve`; every node starts included.
    pub included: bool,
    pub exclusion: Option<Exclusion>,
    /// SHA-256 over kind, payload, input references and timeouts.
    pub fingerprint: String,
    position: usize,
}

impl ResourceNode {
    /// Index in the original declaration list.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn reads_output_of(&self, id: &str) -> bool {
        self.inputs.values().any(|r| r.from.as_str() == id)
    }
}

#[derive(Clone, Debug)]
pub struct ResourceGraph {
    name: String,
    nodes: Vec<ResourceNode>,
    index: HashMap<NodeId, usize>,
    order: Vec<usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    parents: Vec<Option<usize>>,
    exports: BTreeMap<String, OutputRef>,
}

impl ResourceGraph {
    /// Validate declarations and compute the topological order.
    ///
    /// Pure: identical declarations produce an identical graph. Ties between
    /// unordered nodes are broken by declaration order.
    pub fn build(set: &DeclarationSet) -> Result<Self, GraphError> {
        let decls = &set.resources;
        let mut index = HashMap::with_capacity(decls.len());
        for (i, d) in decls.iter().enumerate() {
            if d.id.trim().is_empty() {
                return Err(GraphError::EmptyId(i));
            }
            if index.insert(NodeId::new(d.id.clone()), i).is_some() {
                return Err(GraphError::DuplicateNode(d.id.clone()));
            }
        }

        let mut nodes = Vec::with_capacity(decls.len());
        let mut dependencies = Vec::with_capacity(decls.len());
        let mut parents = Vec::with_capacity(decls.len());
        for (position, d) in decls.iter().enumerate() {
            let (node, deps, parent) = resolve_declaration(d, position, &index)?;
            nodes.push(node);
            dependencies.push(deps);
            parents.push(parent);
        }

        for (name, r) in &set.exports {
            if !index.contains_key(r.from.as_str()) {
                return Err(GraphError::dangling(name.clone(), Relation::Export, r.from.as_str()));
            }
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut children = vec![Vec::new(); nodes.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
            if let Some(p) = parents[i] {
                children[p].push(i);
            }
        }

        let ids: Vec<&NodeId> = nodes.iter().map(|n| &n.id).collect();
        let order = topological_order(&dependencies).map_err(|remaining| GraphError::CyclicDependency {
            cycle: minimal_cycle(&remaining, |i| dependencies[i].clone(), &ids),
        })?;

        // Teardown runs dependents before dependencies and children before
        // parents; that combined relation must be acyclic too.
        let teardown: Vec<Vec<usize>> = (0..nodes.len())
            .map(|i| {
                let mut edges = dependencies[i].clone();
                if let Some(p) = parents[i] {
                    if !edges.contains(&p) {
                        edges.push(p);
                    }
                }
                edges
            })
            .collect();
        if let Err(remaining) = topological_order(&teardown) {
            return Err(GraphError::CyclicDependency {
                cycle: minimal_cycle(&remaining, |i| teardown[i].clone(), &ids),
            });
        }

        tracing::debug!(name = %set.name, nodes = nodes.len(), "built resource graph");

        Ok(Self {
            name: set.name.clone(),
            nodes,
            index,
            order,
            dependencies,
            dependents,
            children,
            parents,
            exports: set.exports.clone(),
        })
    }

    pub fn from_declarations(name: &str, decls: Vec<Declaration>) -> Result<Self, GraphError> {
        Self::build(&DeclarationSet::new(name, decls))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node_at(&self, i: usize) -> &ResourceNode {
        &self.nodes[i]
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// Node indices in topological order (dependencies first).
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn topological(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    pub fn topological_ids(&self) -> Vec<NodeId> {
        self.topological().map(|n| n.id.clone()).collect()
    }

    pub fn included(&self) -> impl Iterator<Item = &ResourceNode> {
        self.topological().filter(|n| n.included)
    }

    pub fn dependency_indices(&self, i: usize) -> &[usize] {
        &self.dependencies[i]
    }

    pub fn dependent_indices(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    pub fn child_indices(&self, i: usize) -> &[usize] {
        &self.children[i]
    }

    pub fn parent_index(&self, i: usize) -> Option<usize> {
        self.parents[i]
    }

    pub fn dependents_of(&self, id: &str) -> Vec<&ResourceNode> {
        self.index_of(id)
            .map(|i| self.dependents[i].iter().map(|&d| &self.nodes[d]).collect())
            .unwrap_or_default()
    }

    pub fn children_of(&self, id: &str) -> Vec<&ResourceNode> {
        self.index_of(id)
            .map(|i| self.children[i].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    /// Transitive dependents of `i`, excluding `i` itself.
    pub fn downstream_of(&self, i: usize) -> Vec<usize> {
        walk(i, |n| &self.dependents[n])
    }

    /// Transitive children of `i`, excluding `i` itself.
    pub fn descendants_of(&self, i: usize) -> Vec<usize> {
        walk(i, |n| &self.children[n])
    }

    pub fn exports(&self) -> &BTreeMap<String, OutputRef> {
        &self.exports
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [ResourceNode] {
        &mut self.nodes
    }
}

fn resolve_declaration(
    d: &Declaration,
    position: usize,
    index: &HashMap<NodeId, usize>,
) -> Result<(ResourceNode, Vec<usize>, Option<usize>), GraphError> {
    if d.kind == ResourceKind::ConditionalServiceRelease && d.when.is_none() {
        return Err(GraphError::MissingPredicate(d.id.clone()));
    }
    for action in [Action::Create, Action::Update, Action::Delete] {
        if d.timeouts.get(action).is_some_and(|t| t.is_zero()) {
            return Err(GraphError::ZeroTimeout {
                node: d.id.clone(),
                action,
            });
        }
    }

    let mut depends_on = BTreeSet::new();
    let mut deps = Vec::new();
    let mut add = |target: &str, relation: Relation| -> Result<(), GraphError> {
        let &t = index
            .get(target)
            .ok_or_else(|| GraphError::dangling(d.id.clone(), relation, target))?;
        if depends_on.insert(NodeId::new(target)) {
            deps.push(t);
        }
        Ok(())
    };
    for dep in &d.depends_on {
        add(dep, Relation::DependsOn)?;
    }
    for r in d.inputs.values() {
        add(r.from.as_str(), Relation::Input)?;
    }

    let parent = match &d.parent {
        Some(p) => Some(
            *index
                .get(p.as_str())
                .ok_or_else(|| GraphError::dangling(d.id.clone(), Relation::Parent, p.clone()))?,
        ),
        None => None,
    };

    let kind = NodeKind::new(d.kind, d.spec.clone());
    let node = ResourceNode {
        id: NodeId::new(d.id.clone()),
        fingerprint: fingerprint(&kind, &d.inputs, &d.timeouts),
        kind,
        depends_on,
        parent: d.parent.clone().map(NodeId::new),
        timeouts: d.timeouts.clone(),
        when: d.when.clone(),
        inputs: d.inputs.clone(),
        included: true,
        exclusion: None,
        position,
    };
    Ok((node, deps, parent))
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    kind: &'a NodeKind,
    inputs: &'a BTreeMap<String, OutputRef>,
    timeouts: &'a Timeouts,
}

/// Stable digest of a node's configuration. serde_json maps are sorted, so
/// key order in the payload does not matter.
pub fn fingerprint(kind: &NodeKind, inputs: &BTreeMap<String, OutputRef>, timeouts: &Timeouts) -> String {
    let bytes = serde_json::to_vec(&FingerprintInput {
        kind,
        inputs,
        timeouts,
    })
    .unwrap_or_default();
    digest(&SHA256, &bytes)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Kahn's algorithm over "i depends on edges[i]". Returns node indices with
/// dependencies first, or the indices left over when a cycle blocks progress.
fn topological_order(edges: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = edges.len();
    let mut remaining: Vec<usize> = edges.iter().map(Vec::len).collect();
    let mut reverse = vec![Vec::new(); n];
    for (i, deps) in edges.iter().enumerate() {
        for &d in deps {
            reverse[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> =
        (0..n).filter(|&i| remaining[i] == 0).map(Reverse).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &j in &reverse[i] {
            remaining[j] -= 1;
            if remaining[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        let placed: HashSet<usize> = order.into_iter().collect();
        Err((0..n).filter(|i| !placed.contains(i)).collect())
    }
}

/// Shortest cycle among `candidates`, as ids with the first repeated at the end.
fn minimal_cycle<F>(candidates: &[usize], edges: F, ids: &[&NodeId]) -> Vec<String>
where
    F: Fn(usize) -> Vec<usize>,
{
    let allowed: HashSet<usize> = candidates.iter().copied().collect();
    let mut best: Option<Vec<usize>> = None;

    for &start in candidates {
        // BFS from start back to start.
        let mut prev: HashMap<usize, usize> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut found = None;
        'search: while let Some(cur) = queue.pop_front() {
            for next in edges(cur) {
                if !allowed.contains(&next) {
                    continue;
                }
                if next == start {
                    found = Some(cur);
                    break 'search;
                }
                if !prev.contains_key(&next) {
                    prev.insert(next, cur);
                    queue.push_back(next);
                }
            }
        }

        if let Some(last) = found {
            let mut path = vec![last];
            let mut cur = last;
            while cur != start {
                cur = prev[&cur];
                path.push(cur);
            }
            path.reverse();
            if best.as_ref().map(|b| path.len() < b.len()).unwrap_or(true) {
                best = Some(path);
            }
        }
    }

    let mut cycle: Vec<String> = best
        .unwrap_or_default()
        .into_iter()
        .map(|i| ids[i].to_string())
        .collect();
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    cycle
}

fn walk<'a, F>(start: usize, next: F) -> Vec<usize>
where
    F: Fn(usize) -> &'a Vec<usize>,
{
    let mut seen = HashSet::from([start]);
    let mut out = Vec::new();
    let mut queue = VecDeque::from([start]);
    while let Some(cur) = queue.pop_front() {
        for &n in next(cur) {
            if seen.insert(n) {
                out.push(n);
                queue.push_back(n);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ResourceKind::*;

    fn decl(id: &str, kind: ResourceKind, deps: &[&str]) -> Declaration {
        Declaration::new(id, kind).depends_on(deps.iter().copied())
    }

    fn build(decls: Vec<Declaration>) -> Result<ResourceGraph, GraphError> {
        ResourceGraph::from_declarations("test", decls)
    }

    fn position_in(order: &[NodeId], id: &str) -> usize {
        order.iter().position(|n| n.as_str() == id).unwrap()
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let g = build(vec![
            decl("release", ServiceRelease, &["ns", "cert"]),
            decl("cert", Certificate, &["issuer"]),
            decl("issuer", Issuer, &["ns"]),
            decl("ns", Namespace, &[]),
        ])
        .unwrap();
        let order = g.topological_ids();
        assert!(position_in(&order, "ns") < position_in(&order, "issuer"));
        assert!(position_in(&order, "issuer") < position_in(&order, "cert"));
        assert!(position_in(&order, "cert") < position_in(&order, "release"));
    }

    #[test]
    fn ties_follow_declaration_order() {
        let g = build(vec![
            decl("b", Secret, &[]),
            decl("a", Secret, &[]),
            decl("c", Secret, &[]),
        ])
        .unwrap();
        let ids: Vec<String> = g.topological_ids().iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn build_is_deterministic() {
        let decls = vec![
            decl("ns", Namespace, &[]),
            decl("db", DataStore, &["ns"]),
            decl("issuer", Issuer, &["ns"]),
            decl("cert", Certificate, &["issuer"]),
        ];
        let a = build(decls.clone()).unwrap();
        let b = build(decls).unwrap();
        assert_eq!(a.topological_ids(), b.topological_ids());
        let fa: Vec<_> = a.nodes().map(|n| n.fingerprint.clone()).collect();
        let fb: Vec<_> = b.nodes().map(|n| n.fingerprint.clone()).collect();
        assert_eq!(fa, fb);
    }

    #[test]
    fn dangling_dependency() {
        let err = build(vec![decl("cert", Certificate, &["issuer"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingReference {
                node: "cert".into(),
                relation: Relation::DependsOn,
                target: "issuer".into()
            }
        );
    }

    #[test]
    fn dangling_parent_and_input() {
        let err = build(vec![decl("s", Secret, &[]).parent("key")]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { relation: Relation::Parent, .. }));

        let err = build(vec![decl("s", Secret, &[]).input("pem", "key", "privateKeyPem")]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { relation: Relation::Input, .. }));
    }

    #[test]
    fn dangling_export() {
        let set = DeclarationSet::new("x", vec![decl("ns", Namespace, &[])]).export("status", "manager", "status");
        let err = ResourceGraph::build(&set).unwrap_err();
        assert!(matches!(err, GraphError::DanglingReference { relation: Relation::Export, .. }));
    }

    #[test]
    fn duplicate_and_empty_ids() {
        assert_eq!(
            build(vec![decl("a", Secret, &[]), decl("a", Secret, &[])]).unwrap_err(),
            GraphError::DuplicateNode("a".into())
        );
        assert_eq!(build(vec![decl(" ", Secret, &[])]).unwrap_err(), GraphError::EmptyId(0));
    }

    #[test]
    fn reports_minimal_cycle() {
        // a -> b -> c -> a is a 3-cycle; d <-> e is the shorter one.
        let err = build(vec![
            decl("a", Secret, &["b"]),
            decl("b", Secret, &["c"]),
            decl("c", Secret, &["a", "d"]),
            decl("d", Secret, &["e"]),
            decl("e", Secret, &["d"]),
        ])
        .unwrap_err();
        match err {
            GraphError::CyclicDependency { cycle } => {
                assert_eq!(cycle.len(), 3, "got {:?}", cycle);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"d".to_string()) && cycle.contains(&"e".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = build(vec![decl("a", Secret, &["a"])]).unwrap_err();
        assert_eq!(err, GraphError::CyclicDependency { cycle: vec!["a".into(), "a".into()] });
    }

    #[test]
    fn parent_conflicting_with_dependency_is_a_cycle() {
        // child depends on nothing, but parent depends on child: teardown
        // would need child first (child) and parent first (dependency).
        let err = build(vec![
            decl("p", ServiceRelease, &["c"]),
            decl("c", ServiceRelease, &[]).parent("p"),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }));
    }

    #[test]
    fn inputs_imply_dependencies() {
        let g = build(vec![
            decl("key", Secret, &[]),
            decl("cert", Certificate, &[]).input("pem", "key", "privateKeyPem"),
        ])
        .unwrap();
        let cert = g.get("cert").unwrap();
        assert!(cert.depends_on.contains("key"));
        assert!(cert.reads_output_of("key"));
        assert_eq!(g.dependents_of("key").len(), 1);
    }

    #[test]
    fn conditional_release_needs_predicate() {
        let err = build(vec![decl("public", ConditionalServiceRelease, &[])]).unwrap_err();
        assert_eq!(err, GraphError::MissingPredicate("public".into()));
        assert!(build(vec![decl("public", ConditionalServiceRelease, &[]).when(Predicate::flag("enterprise"))]).is_ok());
    }

    #[test]
    fn fingerprint_tracks_payload_not_key_order() {
        let a = build(vec![decl("s", Secret, &[]).spec(serde_json::json!({"a": 1, "b": 2}))]).unwrap();
        let b = build(vec![decl("s", Secret, &[]).spec(serde_json::json!({"b": 2, "a": 1}))]).unwrap();
        let c = build(vec![decl("s", Secret, &[]).spec(serde_json::json!({"a": 1, "b": 3}))]).unwrap();
        assert_eq!(a.get("s").unwrap().fingerprint, b.get("s").unwrap().fingerprint);
        assert_ne!(a.get("s").unwrap().fingerprint, c.get("s").unwrap().fingerprint);
        assert_eq!(a.get("s").unwrap().fingerprint.len(), 64);
    }

    #[test]
    fn parent_does_not_order_apply() {
        let g = build(vec![
            decl("child", Secret, &[]).parent("owner"),
            decl("owner", Certificate, &[]),
        ])
        .unwrap();
        let ids: Vec<String> = g.topological_ids().iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["child", "owner"]);
        assert_eq!(g.children_of("owner").len(), 1);
    }

    #[test]
    fn downstream_and_descendants() {
        let g = build(vec![
            decl("ns", Namespace, &[]),
            decl("a", Secret, &["ns"]),
            decl("b", ServiceRelease, &["a"]),
            decl("c", ServiceRelease, &[]).parent("b"),
            decl("d", ServiceRelease, &[]).parent("c"),
        ])
        .unwrap();
        let ns = g.index_of("ns").unwrap();
        let mut down: Vec<&str> = g.downstream_of(ns).into_iter().map(|i| g.node_at(i).id.as_str()).collect();
        down.sort();
        assert_eq!(down, vec!["a", "b"]);
        let b = g.index_of("b").unwrap();
        let mut desc: Vec<&str> = g.descendants_of(b).into_iter().map(|i| g.node_at(i).id.as_str()).collect();
        desc.sort();
        assert_eq!(desc, vec!["c", "d"]);
    }
}
