//! Conditional inclusion: decide which nodes take part in a run.
//!
//! Exclusion flows downstream and to children, never upward. A node whose
//! predicate holds can still be excluded when it reads an output of an
//! excluded node, when every one of its dependencies is excluded, or when
//! its parent is excluded.

use crate::graph::ResourceGraph;
use convoy_core::{Flags, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a node was excluded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Exclusion {
    /// Its own `when` predicate evaluated false.
    Predicate,
    /// It reads an output of an excluded node.
    OutputUnavailable { from: NodeId },
    /// It has dependencies and all of them are excluded.
    DependenciesExcluded,
    ParentExcluded { parent: NodeId },
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate => write!(f, "predicate is false"),
            Self::OutputUnavailable { from } => write!(f, "needs an output of excluded '{}'", from),
            Self::DependenciesExcluded => write!(f, "all dependencies excluded"),
            Self::ParentExcluded { parent } => write!(f, "parent '{}' excluded", parent),
        }
    }
}

/// Evaluate predicates against `flags` and propagate exclusion to a fixed
/// point. Re-resolving with different flags starts from scratch.
pub fn resolve(mut graph: ResourceGraph, flags: &Flags) -> ResourceGraph {
    for node in graph.nodes_mut() {
        let excluded = node.when.as_ref().map(|p| !p.evaluate(flags)).unwrap_or(false);
        node.included = !excluded;
        node.exclusion = excluded.then_some(Exclusion::Predicate);
    }

    let order = graph.order().to_vec();
    loop {
        let mut changed = false;
        for &i in &order {
            if !graph.node_at(i).included {
                continue;
            }
            if let Some(reason) = exclusion_reason(&graph, i) {
                tracing::debug!(node = %graph.node_at(i).id, %reason, "excluding node");
                let node = &mut graph.nodes_mut()[i];
                node.included = false;
                node.exclusion = Some(reason);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let excluded = graph.nodes().filter(|n| !n.included).count();
    tracing::info!(
        included = graph.len() - excluded,
        excluded,
        "resolved conditional inclusion"
    );
    graph
}

fn exclusion_reason(graph: &ResourceGraph, i: usize) -> Option<Exclusion> {
    let node = graph.node_at(i);
    let is_excluded = |id: &str| graph.get(id).map(|n| !n.included).unwrap_or(false);

    if let Some(r) = node.inputs.values().find(|r| is_excluded(r.from.as_str())) {
        return Some(Exclusion::OutputUnavailable { from: r.from.clone() });
    }

    let deps = graph.dependency_indices(i);
    if !deps.is_empty() && deps.iter().all(|&d| !graph.node_at(d).included) {
        return Some(Exclusion::DependenciesExcluded);
    }

    match &node.parent {
        Some(parent) if is_excluded(parent.as_str()) => Some(Exclusion::ParentExcluded {
            parent: parent.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ResourceKind::*;
    use convoy_core::{Declaration, FlagValue, Predicate};

    fn graph(decls: Vec<Declaration>) -> ResourceGraph {
        ResourceGraph::from_declarations("test", decls).unwrap()
    }

    fn excluded(g: &ResourceGraph) -> Vec<String> {
        g.nodes().filter(|n| !n.included).map(|n| n.id.to_string()).collect()
    }

    #[test]
    fn false_predicate_excludes_only_that_branch() {
        let g = graph(vec![
            Declaration::new("N", Namespace),
            Declaration::new("I", Issuer).depends_on(["N"]),
            Declaration::new("C", Certificate).depends_on(["I"]),
            Declaration::new("R", ServiceRelease).depends_on(["N", "C"]),
            Declaration::new("R2", ConditionalServiceRelease)
                .depends_on(["N"])
                .when(Predicate::flag("enableR2")),
        ]);
        let g = resolve(g, &Flags::new().with("enableR2", FlagValue::Bool(false)));
        assert_eq!(excluded(&g), vec!["R2"]);
        assert_eq!(g.get("R2").unwrap().exclusion, Some(Exclusion::Predicate));
    }

    #[test]
    fn output_reader_follows_excluded_source() {
        let g = graph(vec![
            Declaration::new("ns", Namespace),
            Declaration::new("license", Secret)
                .depends_on(["ns"])
                .when(Predicate::flag("enterprise")),
            Declaration::new("cp", ServiceRelease)
                .depends_on(["ns"])
                .input("license", "license", "name"),
        ]);
        let g = resolve(g, &Flags::new());
        assert_eq!(excluded(&g), vec!["license", "cp"]);
        assert_eq!(
            g.get("cp").unwrap().exclusion,
            Some(Exclusion::OutputUnavailable { from: "license".into() })
        );
    }

    #[test]
    fn partial_exclusion_of_dependencies_keeps_node() {
        let g = graph(vec![
            Declaration::new("a", Secret).when(Predicate::flag("on")),
            Declaration::new("b", Secret),
            Declaration::new("c", ServiceRelease).depends_on(["a", "b"]),
        ]);
        let g = resolve(g, &Flags::new());
        assert_eq!(excluded(&g), vec!["a"]);
    }

    #[test]
    fn all_dependencies_excluded_propagates() {
        let g = graph(vec![
            Declaration::new("a", Secret).when(Predicate::flag("on")),
            Declaration::new("b", Secret).depends_on(["a"]),
            Declaration::new("c", ServiceRelease).depends_on(["b"]),
        ]);
        let g = resolve(g, &Flags::new());
        assert_eq!(excluded(&g), vec!["a", "b", "c"]);
        assert_eq!(g.get("c").unwrap().exclusion, Some(Exclusion::DependenciesExcluded));
    }

    #[test]
    fn children_of_excluded_parent_are_excluded() {
        // The child is declared first and depends on nothing, so it needs the
        // second pass to settle.
        let g = graph(vec![
            Declaration::new("grandchild", ServiceRelease).parent("child"),
            Declaration::new("child", ServiceRelease).parent("owner"),
            Declaration::new("owner", ServiceRelease).when(Predicate::flag("on")),
        ]);
        let g = resolve(g, &Flags::new());
        let mut out = excluded(&g);
        out.sort();
        assert_eq!(out, vec!["child", "grandchild", "owner"]);
    }

    #[test]
    fn exclusion_never_propagates_upward() {
        let g = graph(vec![
            Declaration::new("owner", ServiceRelease),
            Declaration::new("dep", Secret),
            Declaration::new("child", ServiceRelease)
                .parent("owner")
                .depends_on(["dep"])
                .when(Predicate::flag("on")),
        ]);
        let g = resolve(g, &Flags::new());
        assert_eq!(excluded(&g), vec!["child"]);
    }

    #[test]
    fn resolve_is_repeatable_with_new_flags() {
        let g = graph(vec![Declaration::new("public", ConditionalServiceRelease).when(Predicate::flag("on"))]);
        let off = resolve(g, &Flags::new());
        assert!(!off.get("public").unwrap().included);
        let on = resolve(off, &Flags::new().with("on", FlagValue::Bool(true)));
        assert!(on.get("public").unwrap().included);
        assert_eq!(on.get("public").unwrap().exclusion, None);
    }
}
